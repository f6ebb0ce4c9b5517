//! session — tracking session lifecycle + per-frame coordination
//!
//! A [`FrameCoordinator`] owns the capture stream, the two inference
//! services and the observation history.  Lifecycle is two-state
//! (`Idle`/`Active`); flipping to `Idle` through a [`SessionHandle`] is the
//! only cancellation mechanism and is observed before any work is scheduled
//! or committed.
//!
//! One tick:
//! 1. guard on `Active`
//! 2. read a frame and copy it into the render surface
//! 3. run detection and pose concurrently on that buffer, wait for both
//! 4. guard on `Active` again; a tick that outlived `stop()` is discarded
//! 5. commit: append the box, recompute velocity, draw overlays

mod clock;

pub use clock::{FrameClock, PacedClock, Scheduler};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{TimestampSource, TrackerConfig};
use crate::detection::{select_best, BarDetector};
use crate::error::SessionError;
use crate::pose::{ArmJoints, PoseEstimator};
use crate::rendering::RenderSurface;
use crate::tracking::{BoundingBox, ObservationHistory, VelocityEstimate, VelocityTracker};
use crate::video::{CaptureDevice, VideoStream};

/// Ticks between timing log lines.
const PROFILE_EVERY: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionState {
    #[default]
    Idle,
    Active,
}

/// Shared view of a session's lifecycle state.
///
/// Clones can be moved to other threads; [`SessionHandle::stop`] is a pure
/// state flip and never touches the capture stream itself.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle(Arc<Mutex<SessionState>>);

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        match self.0.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn stop(&self) {
        self.set(SessionState::Idle);
    }

    fn set(&self, state: SessionState) {
        match self.0.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

/// The external collaborators a coordinator drives.
pub struct Services {
    pub detector: Box<dyn BarDetector>,
    pub pose: Box<dyn PoseEstimator>,
    pub capture: Box<dyn CaptureDevice>,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Session is idle; nothing was read.
    Inactive,
    /// The stream ran out of frames.
    EndOfStream,
    /// The frame could not be read or copied; try again next tick.
    Skipped,
    /// The session was stopped while inference was in flight.
    Discarded,
    Processed { detected: bool, pose: bool },
}

/// Values shown to the user after each tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Readout {
    pub last_box: Option<BoundingBox>,
    pub velocity: Option<VelocityEstimate>,
    pub arms: Option<ArmJoints>,
}

impl Readout {
    pub fn bar_coordinates_text(&self) -> String {
        match self.last_box {
            Some(b) => format!("x: {}, y: {}", b.x.round() as i64, b.y.round() as i64),
            None => "-".to_string(),
        }
    }

    pub fn velocity_text(&self) -> String {
        match self.velocity {
            Some(v) => format!("{:.2} px/s", v.pixels_per_second),
            None => "-".to_string(),
        }
    }

    pub fn elapsed_text(&self) -> String {
        match self.velocity {
            Some(v) => format!("{:.3} seconds", v.elapsed_seconds),
            None => "-".to_string(),
        }
    }

    pub fn arms_text(&self) -> String {
        let Some(arms) = self.arms else {
            return "-".to_string();
        };
        let fmt = |points: [crate::pose::Keypoint; 3]| {
            points
                .iter()
                .map(|p| format!("({}, {})", p.x.round() as i64, p.y.round() as i64))
                .collect::<Vec<_>>()
                .join(" ")
        };
        format!("L {} | R {}", fmt(arms.left_arm()), fmt(arms.right_arm()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ObservationRecord {
    pub timestamp_ms: u64,
    pub bbox: BoundingBox,
}

/// Serializable summary of the current (or last) session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub state: SessionState,
    pub ticks: u64,
    pub detections: u64,
    pub poses: u64,
    pub velocity: Option<VelocityEstimate>,
    pub observations: Vec<ObservationRecord>,
}

#[derive(Debug, Default)]
struct TickStats {
    ticks: u64,
    detections: u64,
    poses: u64,
    prof_detect: Duration,
    prof_pose: Duration,
}

pub struct FrameCoordinator {
    config: TrackerConfig,
    detector: Box<dyn BarDetector>,
    pose: Box<dyn PoseEstimator>,
    capture: Box<dyn CaptureDevice>,
    stream: Option<Box<dyn VideoStream>>,
    handle: SessionHandle,
    tracker: VelocityTracker,
    surface: RenderSurface,
    readout: Readout,
    stats: TickStats,
}

impl FrameCoordinator {
    pub fn new(config: TrackerConfig, services: Services) -> Self {
        let surface = RenderSurface::new(config.surface_width, config.surface_height);
        Self {
            config,
            detector: services.detector,
            pose: services.pose,
            capture: services.capture,
            stream: None,
            handle: SessionHandle::default(),
            tracker: VelocityTracker::new(),
            surface,
            readout: Readout::default(),
            stats: TickStats::default(),
        }
    }

    /// A clonable handle for stopping the session from elsewhere.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn history(&self) -> &ObservationHistory {
        self.tracker.history()
    }

    pub fn readout(&self) -> &Readout {
        &self.readout
    }

    pub fn surface(&self) -> &RenderSurface {
        &self.surface
    }

    /// Acquire the stream and begin a fresh session.
    ///
    /// Fails without any state change when a model is not ready.  Starting
    /// while already active releases the held stream before reopening, since
    /// most cameras admit a single owner; if the reopen is refused the
    /// session is left idle.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if !self.detector.is_ready() {
            return Err(SessionError::ModelNotReady("detection"));
        }
        if !self.pose.is_ready() {
            return Err(SessionError::ModelNotReady("pose"));
        }

        if let Some(mut previous) = self.stream.take() {
            self.handle.set(SessionState::Idle);
            previous.stop();
            info!("session restarting; previous stream released");
        }

        let stream = self.capture.open().map_err(|e| {
            warn!("capture failed: {e}");
            SessionError::from(e)
        })?;

        self.stream = Some(stream);
        self.tracker.reset();
        self.readout = Readout::default();
        self.stats = TickStats::default();
        self.handle.set(SessionState::Active);

        info!(
            width = self.config.surface_width,
            height = self.config.surface_height,
            threshold = self.config.confidence_threshold,
            "tracking session started"
        );
        Ok(())
    }

    /// Release the stream and go idle; no-op when there is nothing to release.
    pub fn stop(&mut self) {
        self.handle.stop();
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        stream.stop();

        if self.tracker.history().len() >= 2 {
            if let Some(v) = self.tracker.recompute() {
                self.readout.velocity = Some(v);
            }
        }

        info!(
            ticks = self.stats.ticks,
            observations = self.tracker.history().len(),
            velocity = %self.readout.velocity_text(),
            "tracking session stopped"
        );
    }

    /// One capture → infer → commit cycle.  `now_ms` is the frame clock's
    /// monotonic timestamp.
    pub fn on_tick(&mut self, now_ms: u64) -> TickOutcome {
        if !self.handle.is_active() {
            return TickOutcome::Inactive;
        }
        let Some(stream) = self.stream.as_mut() else {
            return TickOutcome::Inactive;
        };

        let frame = match stream.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return TickOutcome::EndOfStream,
            Err(e) => {
                warn!("frame read error: {e:#}");
                return TickOutcome::Skipped;
            }
        };
        let timestamp_ms = match self.config.timestamps {
            TimestampSource::Wall => now_ms,
            TimestampSource::Stream => match frame.pts_ms {
                Some(pts) => pts,
                None => {
                    debug!("frame has no presentation time; skipping");
                    return TickOutcome::Skipped;
                }
            },
        };
        if let Err(e) = self.surface.capture(&frame) {
            warn!("frame copy error: {e:#}");
            return TickOutcome::Skipped;
        }

        let buffer = self.surface.frame();
        let detector = &mut self.detector;
        let pose = &mut self.pose;
        let ((detection, detect_time), (keypoints, pose_time)) = rayon::join(
            || {
                let start = Instant::now();
                (detector.detect(buffer), start.elapsed())
            },
            || {
                let start = Instant::now();
                (pose.estimate(buffer), start.elapsed())
            },
        );

        if !self.handle.is_active() {
            debug!(timestamp_ms, "session stopped during inference; discarding tick");
            return TickOutcome::Discarded;
        }

        self.stats.ticks += 1;
        self.stats.prof_detect += detect_time;
        self.stats.prof_pose += pose_time;

        let bbox = match detection {
            Ok(candidates) => select_best(
                &candidates,
                self.config.confidence_threshold,
                self.surface.width(),
                self.surface.height(),
            ),
            Err(e) => {
                warn!("detection error: {e:#}");
                None
            }
        };

        let arms = match keypoints {
            Ok(keypoints) if keypoints.is_empty() => None,
            Ok(keypoints) => {
                match ArmJoints::from_keypoints(&keypoints, self.config.keypoint_threshold) {
                    Ok(arms) => arms,
                    Err(e) => {
                        warn!("pose error: {e:#}");
                        None
                    }
                }
            }
            Err(e) => {
                warn!("pose error: {e:#}");
                None
            }
        };

        if let Some(bbox) = bbox {
            self.stats.detections += 1;
            self.surface
                .draw_box(&bbox, self.config.box_color, self.config.line_width);
            self.readout.last_box = Some(bbox);
            if let Some(v) = self.tracker.observe(bbox, timestamp_ms) {
                self.readout.velocity = Some(v);
            }
            debug!(x = bbox.x, y = bbox.y, timestamp_ms, "bar observed");
        }

        if let Some(arms) = arms {
            self.stats.poses += 1;
            self.surface.draw_polyline(
                &arms.left_arm(),
                self.config.left_arm_color,
                self.config.line_width,
            );
            self.surface.draw_polyline(
                &arms.right_arm(),
                self.config.right_arm_color,
                self.config.line_width,
            );
            self.readout.arms = Some(arms);
        }

        self.log_timings();

        TickOutcome::Processed {
            detected: bbox.is_some(),
            pose: arms.is_some(),
        }
    }

    pub fn report(&self) -> SessionReport {
        let history = self.tracker.history();
        SessionReport {
            state: self.state(),
            ticks: self.stats.ticks,
            detections: self.stats.detections,
            poses: self.stats.poses,
            velocity: self.readout.velocity,
            observations: history
                .boxes()
                .iter()
                .zip(history.timestamps())
                .map(|(&bbox, &timestamp_ms)| ObservationRecord { timestamp_ms, bbox })
                .collect(),
        }
    }

    fn log_timings(&self) {
        let frames = self.stats.ticks;
        if frames == 0 || frames % PROFILE_EVERY != 0 {
            return;
        }
        info!(
            frames,
            detect_ms_per_frame = format!(
                "{:.2}",
                self.stats.prof_detect.as_secs_f64() * 1000.0 / frames as f64
            ),
            pose_ms_per_frame = format!(
                "{:.2}",
                self.stats.prof_pose.as_secs_f64() * 1000.0 / frames as f64
            ),
            detections = self.stats.detections,
            "session tick timings"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Keypoint;

    #[test]
    fn readout_formats_like_the_display() {
        let readout = Readout {
            last_box: Some(BoundingBox::new(12.4, 33.6, 5.0, 5.0)),
            velocity: Some(VelocityEstimate {
                pixels_per_second: 5.0,
                elapsed_seconds: 1.0,
            }),
            arms: None,
        };
        assert_eq!(readout.bar_coordinates_text(), "x: 12, y: 34");
        assert_eq!(readout.velocity_text(), "5.00 px/s");
        assert_eq!(readout.elapsed_text(), "1.000 seconds");
        assert_eq!(readout.arms_text(), "-");
    }

    #[test]
    fn arms_text_lists_both_sides() {
        let k = |x: f32, y: f32| Keypoint { x, y };
        let readout = Readout {
            arms: Some(ArmJoints {
                left_shoulder: k(1.0, 2.0),
                right_shoulder: k(3.0, 4.0),
                left_elbow: k(5.0, 6.0),
                right_elbow: k(7.0, 8.0),
                left_wrist: k(9.0, 10.0),
                right_wrist: k(11.0, 12.0),
            }),
            ..Readout::default()
        };
        assert_eq!(
            readout.arms_text(),
            "L (1, 2) (5, 6) (9, 10) | R (3, 4) (7, 8) (11, 12)"
        );
    }

    #[test]
    fn handle_flip_is_shared() {
        let handle = SessionHandle::default();
        assert_eq!(handle.state(), SessionState::Idle);
        handle.set(SessionState::Active);
        let other = handle.clone();
        other.stop();
        assert!(!handle.is_active());
    }

    #[test]
    fn poisoned_handle_still_reports_its_state() {
        let handle = SessionHandle::default();
        handle.set(SessionState::Active);
        let inner = handle.0.clone();
        let _ = std::thread::spawn(move || {
            let _guard = inner.lock().unwrap();
            panic!("poison the state lock");
        })
        .join();
        assert!(handle.0.is_poisoned());
        assert!(handle.is_active());
        handle.stop();
        assert_eq!(handle.state(), SessionState::Idle);
        handle.set(SessionState::Active);
        assert!(handle.is_active());
    }
}
