//! pose — keypoint service + arm-joint extraction
//!
//! The pose service returns 17 keypoints in COCO order.  Only the arms are
//! used here, so the raw list is validated once and folded into
//! [`ArmJoints`]; nothing downstream indexes the raw list.

use std::path::Path;

use anyhow::{bail, Context, Result};
use fast_image_resize as fr;
use ort::session::Session;
use ort::value::Tensor;
use serde::Serialize;
use tracing::debug;

use crate::detection::build_ort_session;
use crate::video::RgbFrame;

/// Keypoints per pose in COCO order.
pub const KEYPOINT_COUNT: usize = 17;
/// Default square input for MoveNet Lightning.
pub const DEFAULT_POSE_INPUT_SIZE: u32 = 192;

/// COCO keypoint indices used by the arm overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ArmKeypoint {
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
}

/// Pixel position of one joint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
}

/// Raw service output: pixel position plus confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredKeypoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

/// The six joints drawn as two arm polylines.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ArmJoints {
    pub left_shoulder: Keypoint,
    pub right_shoulder: Keypoint,
    pub left_elbow: Keypoint,
    pub right_elbow: Keypoint,
    pub left_wrist: Keypoint,
    pub right_wrist: Keypoint,
}

impl ArmJoints {
    /// Validate a service result.
    ///
    /// Errors on a list that is not exactly 17 long.  `Ok(None)` when the
    /// mean score does not clear `threshold` (no confident person).
    pub fn from_keypoints(keypoints: &[ScoredKeypoint], threshold: f32) -> Result<Option<Self>> {
        if keypoints.len() != KEYPOINT_COUNT {
            bail!(
                "pose service returned {} keypoints, expected {KEYPOINT_COUNT}",
                keypoints.len()
            );
        }
        let mean = keypoints.iter().map(|k| k.score).sum::<f32>() / KEYPOINT_COUNT as f32;
        if mean.is_nan() || mean <= threshold {
            debug!(mean, threshold, "pose below confidence threshold");
            return Ok(None);
        }

        let at = |joint: ArmKeypoint| {
            let k = keypoints[joint as usize];
            Keypoint { x: k.x, y: k.y }
        };
        Ok(Some(Self {
            left_shoulder: at(ArmKeypoint::LeftShoulder),
            right_shoulder: at(ArmKeypoint::RightShoulder),
            left_elbow: at(ArmKeypoint::LeftElbow),
            right_elbow: at(ArmKeypoint::RightElbow),
            left_wrist: at(ArmKeypoint::LeftWrist),
            right_wrist: at(ArmKeypoint::RightWrist),
        }))
    }

    /// Shoulder → elbow → wrist.
    pub fn left_arm(&self) -> [Keypoint; 3] {
        [self.left_shoulder, self.left_elbow, self.left_wrist]
    }

    pub fn right_arm(&self) -> [Keypoint; 3] {
        [self.right_shoulder, self.right_elbow, self.right_wrist]
    }
}

/// Pose estimation service.
pub trait PoseEstimator: Send {
    fn is_ready(&self) -> bool {
        true
    }

    /// Keypoints in pixel space of `frame`; empty when nobody is visible.
    fn estimate(&mut self, frame: &RgbFrame) -> Result<Vec<ScoredKeypoint>>;
}

// ── ONNX pose estimator ──────────────────────────────────────────────────────

/// MoveNet single-pose exported to ONNX.
///
/// Input: NHWC `i32` RGB at `input_size × input_size`.
/// Output: `[1, 1, 17, 3]` rows of normalised `(y, x, score)`.
pub struct OnnxPoseEstimator {
    session: Session,
    input_name: String,
    input_size: u32,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl OnnxPoseEstimator {
    pub fn load<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let session = build_ort_session(model_path.as_ref(), "failed to load pose ONNX model")?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("pose model declares no inputs")?;
        debug!(input = %input_name, input_size, "pose model loaded");
        Ok(Self {
            session,
            input_name,
            input_size,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; input_size as usize * input_size as usize * 3],
        })
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<Tensor<i32>> {
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create pose resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            self.input_size,
            self.input_size,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create pose resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("pose input resize failed")?;

        self.resize_buf = dst.into_vec();
        let tensor_data: Vec<i32> = self.resize_buf.iter().map(|&v| i32::from(v)).collect();
        let size = self.input_size as usize;
        Tensor::from_array(([1usize, size, size, 3], tensor_data.into_boxed_slice()))
            .context("failed to create pose input tensor")
    }
}

impl PoseEstimator for OnnxPoseEstimator {
    fn estimate(&mut self, frame: &RgbFrame) -> Result<Vec<ScoredKeypoint>> {
        let input = self.preprocess(frame)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .context("pose inference failed")?;

        let (_, value) = outputs
            .iter()
            .next()
            .context("pose model produced no outputs")?;
        let (_shape, data) = value
            .try_extract_tensor::<f32>()
            .context("failed to extract pose tensor")?;

        Ok(keypoints_from_raw(data, frame.width, frame.height))
    }
}

/// Convert normalised `(y, x, score)` triples to pixel-space keypoints.
fn keypoints_from_raw(data: &[f32], width: u32, height: u32) -> Vec<ScoredKeypoint> {
    data.chunks_exact(3)
        .take(KEYPOINT_COUNT)
        .map(|row| ScoredKeypoint {
            x: row[1] * width as f32,
            y: row[0] * height as f32,
            score: row[2],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose(score: f32) -> Vec<ScoredKeypoint> {
        (0..KEYPOINT_COUNT)
            .map(|i| ScoredKeypoint {
                x: i as f32 * 10.0,
                y: i as f32 * 10.0 + 1.0,
                score,
            })
            .collect()
    }

    #[test]
    fn picks_coco_arm_indices() {
        let arms = ArmJoints::from_keypoints(&pose(0.9), 0.3).unwrap().unwrap();
        assert_eq!(arms.left_shoulder, Keypoint { x: 50.0, y: 51.0 });
        assert_eq!(arms.right_shoulder, Keypoint { x: 60.0, y: 61.0 });
        assert_eq!(arms.left_elbow, Keypoint { x: 70.0, y: 71.0 });
        assert_eq!(arms.right_elbow, Keypoint { x: 80.0, y: 81.0 });
        assert_eq!(arms.left_wrist, Keypoint { x: 90.0, y: 91.0 });
        assert_eq!(arms.right_wrist, Keypoint { x: 100.0, y: 101.0 });
        assert_eq!(arms.left_arm()[1], arms.left_elbow);
        assert_eq!(arms.right_arm()[2], arms.right_wrist);
    }

    #[test]
    fn low_confidence_is_no_result() {
        assert!(ArmJoints::from_keypoints(&pose(0.2), 0.3).unwrap().is_none());
        assert!(ArmJoints::from_keypoints(&pose(0.0), 0.0).unwrap().is_none());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let mut short = pose(0.9);
        short.truncate(16);
        assert!(ArmJoints::from_keypoints(&short, 0.3).is_err());
    }

    #[test]
    fn raw_rows_are_y_x_score() {
        let mut data = vec![0.0f32; KEYPOINT_COUNT * 3];
        data[0] = 0.5; // y
        data[1] = 0.25; // x
        data[2] = 0.8;
        let keypoints = keypoints_from_raw(&data, 640, 480);
        assert_eq!(keypoints.len(), KEYPOINT_COUNT);
        assert_eq!(keypoints[0].x, 160.0);
        assert_eq!(keypoints[0].y, 240.0);
        assert_eq!(keypoints[0].score, 0.8);
    }
}
