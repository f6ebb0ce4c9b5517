//! tracking — bar observation history + frame-to-frame velocity
//!
//! Every accepted detection is appended to an [`ObservationHistory`] together
//! with its capture timestamp.  Speed is a two-point finite difference over
//! the box centres of the last two observations:
//!
//! ```text
//! v = |centre(B₂) − centre(B₁)| / ((t₂ − t₁) / 1000)      [px/s]
//! ```
//!
//! A zero elapsed time has no defined speed; the update is skipped and the
//! previously displayed estimate is kept.

use nalgebra::Point2;
use serde::Serialize;
use tracing::debug;

// ── BoundingBox ──────────────────────────────────────────────────────────────

/// Axis-aligned box in render-surface pixel coordinates (top-left + extent).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> Point2<f64> {
        Point2::new(
            f64::from(self.x) + f64::from(self.width) / 2.0,
            f64::from(self.y) + f64::from(self.height) / 2.0,
        )
    }
}

// ── ObservationHistory ───────────────────────────────────────────────────────

/// Append-only record of accepted boxes and their timestamps (ms).
///
/// The two lists always have the same length; nothing is ever reordered or
/// edited in place.
#[derive(Debug, Clone, Default)]
pub struct ObservationHistory {
    boxes: Vec<BoundingBox>,
    timestamps: Vec<u64>,
}

impl ObservationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bbox: BoundingBox, timestamp_ms: u64) {
        self.boxes.push(bbox);
        self.timestamps.push(timestamp_ms);
    }

    pub fn clear(&mut self) {
        self.boxes.clear();
        self.timestamps.clear();
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.boxes.len(), self.timestamps.len());
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn boxes(&self) -> &[BoundingBox] {
        &self.boxes
    }

    pub fn timestamps(&self) -> &[u64] {
        &self.timestamps
    }

    /// The two most recent observations, oldest first.
    pub fn last_two(&self) -> Option<[(BoundingBox, u64); 2]> {
        let n = self.len();
        if n < 2 {
            return None;
        }
        Some([
            (self.boxes[n - 2], self.timestamps[n - 2]),
            (self.boxes[n - 1], self.timestamps[n - 1]),
        ])
    }
}

// ── Velocity ─────────────────────────────────────────────────────────────────

/// Speed of the bar centre between two observations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VelocityEstimate {
    pub pixels_per_second: f64,
    /// Time between the two observations, in seconds.
    pub elapsed_seconds: f64,
}

/// Two-point finite difference over box centres.
///
/// Returns `None` when `current_ms` does not come strictly after
/// `previous_ms`.
pub fn compute_velocity(
    previous: &BoundingBox,
    previous_ms: u64,
    current: &BoundingBox,
    current_ms: u64,
) -> Option<VelocityEstimate> {
    if current_ms <= previous_ms {
        return None;
    }
    let elapsed_seconds = (current_ms - previous_ms) as f64 / 1000.0;
    let distance = nalgebra::distance(&previous.center(), &current.center());
    Some(VelocityEstimate {
        pixels_per_second: distance / elapsed_seconds,
        elapsed_seconds,
    })
}

// ── VelocityTracker ──────────────────────────────────────────────────────────

/// History plus the last successfully computed (displayed) estimate.
#[derive(Debug, Default)]
pub struct VelocityTracker {
    history: ObservationHistory,
    last_estimate: Option<VelocityEstimate>,
}

impl VelocityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a detection; recompute once at least two observations exist.
    pub fn observe(&mut self, bbox: BoundingBox, timestamp_ms: u64) -> Option<VelocityEstimate> {
        self.history.push(bbox, timestamp_ms);
        if self.history.len() >= 2 {
            self.recompute();
        }
        self.last_estimate
    }

    /// Recompute from the last two observations.  A degenerate pair leaves
    /// the previous estimate in place.
    pub fn recompute(&mut self) -> Option<VelocityEstimate> {
        let [(b1, t1), (b2, t2)] = self.history.last_two()?;
        match compute_velocity(&b1, t1, &b2, t2) {
            Some(estimate) => {
                debug!(
                    px_per_s = estimate.pixels_per_second,
                    elapsed_s = estimate.elapsed_seconds,
                    "velocity updated"
                );
                self.last_estimate = Some(estimate);
            }
            None => debug!(t1, t2, "non-increasing timestamps; keeping previous velocity"),
        }
        self.last_estimate
    }

    pub fn last_estimate(&self) -> Option<VelocityEstimate> {
        self.last_estimate
    }

    pub fn history(&self) -> &ObservationHistory {
        &self.history
    }

    /// Forget everything (start of a new session).
    pub fn reset(&mut self) {
        self.history.clear();
        self.last_estimate = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_box(x: f32, y: f32) -> BoundingBox {
        BoundingBox::new(x, y, 0.0, 0.0)
    }

    #[test]
    fn three_four_five_over_one_second() {
        let v = compute_velocity(&point_box(0.0, 0.0), 0, &point_box(3.0, 4.0), 1000).unwrap();
        assert_eq!(v.pixels_per_second, 5.0);
        assert_eq!(v.elapsed_seconds, 1.0);
    }

    #[test]
    fn uses_box_centres() {
        // Centres (15, 15) and (18, 19): distance 5 over 0.5 s.
        let a = BoundingBox::new(10.0, 10.0, 10.0, 10.0);
        let b = BoundingBox::new(13.0, 14.0, 10.0, 10.0);
        let v = compute_velocity(&a, 200, &b, 700).unwrap();
        assert!((v.pixels_per_second - 10.0).abs() < 1e-12);
        assert!((v.elapsed_seconds - 0.5).abs() < 1e-12);
    }

    #[test]
    fn matches_formula_for_arbitrary_pairs() {
        let cases = [
            (BoundingBox::new(1.5, 2.25, 4.0, 8.0), 17u64, BoundingBox::new(-3.0, 9.5, 2.0, 1.0), 50u64),
            (BoundingBox::new(100.0, 40.0, 30.0, 12.0), 1_000, BoundingBox::new(101.0, 39.0, 31.0, 12.5), 1_033),
        ];
        for (b1, t1, b2, t2) in cases {
            let c1 = b1.center();
            let c2 = b2.center();
            let expected = ((c2.x - c1.x).powi(2) + (c2.y - c1.y).powi(2)).sqrt()
                / ((t2 - t1) as f64 / 1000.0);
            let v = compute_velocity(&b1, t1, &b2, t2).unwrap();
            assert!((v.pixels_per_second - expected).abs() <= expected * 1e-12);
        }
    }

    #[test]
    fn zero_elapsed_is_degenerate() {
        assert!(compute_velocity(&point_box(0.0, 0.0), 40, &point_box(3.0, 4.0), 40).is_none());
    }

    #[test]
    fn tracker_keeps_previous_value_on_zero_elapsed() {
        let mut tracker = VelocityTracker::new();
        assert!(tracker.observe(point_box(0.0, 0.0), 0).is_none());
        let first = tracker.observe(point_box(3.0, 4.0), 1000).unwrap();
        let after = tracker.observe(point_box(50.0, 50.0), 1000).unwrap();
        assert_eq!(first, after);
        assert_eq!(tracker.history().len(), 3);
        assert_eq!(tracker.history().timestamps().len(), 3);
    }

    #[test]
    fn reset_clears_history_and_estimate() {
        let mut tracker = VelocityTracker::new();
        tracker.observe(point_box(0.0, 0.0), 0);
        tracker.observe(point_box(3.0, 4.0), 1000);
        tracker.reset();
        assert!(tracker.history().is_empty());
        assert!(tracker.last_estimate().is_none());
        assert!(tracker.recompute().is_none());
    }
}
