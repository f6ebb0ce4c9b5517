//! detection — barbell bounding-box service + best-candidate selection
//!
//! The detector itself is an opaque pretrained network.  Its contract is a
//! list of `(score, box)` pairs where each box is normalised to `[0, 1]`
//! and laid out as `[y, x, height, width]`.  [`select_best`] turns that into
//! at most one pixel-space [`BoundingBox`] per frame.

use std::path::Path;

use anyhow::{Context, Result};
use ort::execution_providers as ep;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use tracing::debug;

use crate::tracking::BoundingBox;
use crate::video::RgbFrame;

// ── Service contract ─────────────────────────────────────────────────────────

/// Box relative to the submitted buffer, every field in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedBox {
    pub y: f32,
    pub x: f32,
    pub height: f32,
    pub width: f32,
}

impl NormalizedBox {
    /// Build from the raw `[y, x, height, width]` service layout.
    pub fn from_raw([y, x, height, width]: [f32; 4]) -> Self {
        Self {
            y,
            x,
            height,
            width,
        }
    }

    /// Scale into pixel space of a `surface_width × surface_height` surface.
    pub fn to_pixels(&self, surface_width: u32, surface_height: u32) -> BoundingBox {
        let sw = surface_width as f32;
        let sh = surface_height as f32;
        BoundingBox {
            x: self.x * sw,
            y: self.y * sh,
            width: self.width * sw,
            height: self.height * sh,
        }
    }
}

/// One scored detection as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub score: f32,
    pub bbox: NormalizedBox,
}

/// Barbell detection service.
pub trait BarDetector: Send {
    /// Whether the underlying model has finished loading.
    fn is_ready(&self) -> bool {
        true
    }

    /// All candidates for `frame`, unfiltered.
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<Candidate>>;
}

/// Highest-scoring candidate strictly above `threshold`, in pixel space.
///
/// Equal scores keep the earlier candidate.  `None` means "no detection" for
/// this frame, which is a normal outcome.
pub fn select_best(
    candidates: &[Candidate],
    threshold: f32,
    surface_width: u32,
    surface_height: u32,
) -> Option<BoundingBox> {
    let mut best: Option<&Candidate> = None;
    for candidate in candidates {
        if candidate.score > threshold && best.is_none_or(|b| candidate.score > b.score) {
            best = Some(candidate);
        }
    }
    best.map(|c| c.bbox.to_pixels(surface_width, surface_height))
}

// ── ONNX detector ────────────────────────────────────────────────────────────

/// SSD-style detector exported to ONNX.
///
/// Input: NHWC `f32` in `[0, 1]` at the buffer's own resolution.
/// Outputs (in order): boxes `[1, N, 4]`, scores `[1, N]`.
pub struct OnnxBarDetector {
    session: Session,
    input_name: String,
}

impl OnnxBarDetector {
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = build_ort_session(model_path.as_ref(), "failed to load detection ONNX model")?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("detection model declares no inputs")?;
        debug!(input = %input_name, "detection model loaded");
        Ok(Self {
            session,
            input_name,
        })
    }
}

impl BarDetector for OnnxBarDetector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<Candidate>> {
        let tensor_data: Vec<f32> = frame.data.par_iter().map(|&v| v as f32 / 255.0).collect();
        let shape = [1usize, frame.height as usize, frame.width as usize, 3];
        let input = Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create detection input tensor")?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .context("detection inference failed")?;

        let mut values = outputs.iter();
        let (_, boxes_value) = values.next().context("detection model produced no outputs")?;
        let (_, scores_value) = values
            .next()
            .context("detection model produced no score output")?;
        let (_shape, boxes) = boxes_value
            .try_extract_tensor::<f32>()
            .context("failed to extract box tensor")?;
        let (_shape, scores) = scores_value
            .try_extract_tensor::<f32>()
            .context("failed to extract score tensor")?;

        Ok(candidates_from_raw(boxes, scores))
    }
}

/// Pair flat `[y, x, h, w]` quadruples with their scores; a truncated box
/// tensor drops the unmatched tail.
fn candidates_from_raw(boxes: &[f32], scores: &[f32]) -> Vec<Candidate> {
    scores
        .iter()
        .zip(boxes.chunks_exact(4))
        .map(|(&score, raw)| Candidate {
            score,
            bbox: NormalizedBox::from_raw([raw[0], raw[1], raw[2], raw[3]]),
        })
        .collect()
}

pub(crate) fn build_ort_session(model_path: &Path, load_error: &'static str) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(1)
        .context("failed to set ORT intra threads")?;
    builder = builder
        .with_inter_threads(1)
        .context("failed to set ORT inter threads")?;
    builder = builder
        .with_parallel_execution(false)
        .context("failed to set ORT parallel execution")?;
    builder = builder
        .with_execution_providers([ep::CoreMLExecutionProvider::default()
            .with_compute_units(ep::coreml::CoreMLComputeUnits::CPUAndNeuralEngine)
            .build()])
        .context("failed to register execution providers")?;
    builder.commit_from_file(model_path).context(load_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(score: f32, raw: [f32; 4]) -> Candidate {
        Candidate {
            score,
            bbox: NormalizedBox::from_raw(raw),
        }
    }

    #[test]
    fn threshold_is_strict() {
        let at_threshold = [candidate(0.5, [0.1, 0.1, 0.2, 0.2])];
        assert!(select_best(&at_threshold, 0.5, 640, 480).is_none());

        let just_above = [candidate(0.5001, [0.1, 0.1, 0.2, 0.2])];
        assert!(select_best(&just_above, 0.5, 640, 480).is_some());
    }

    #[test]
    fn picks_highest_score_and_scales_yxhw() {
        let candidates = [
            candidate(0.6, [0.0, 0.0, 0.1, 0.1]),
            candidate(0.9, [0.25, 0.5, 0.5, 0.25]),
            candidate(0.3, [0.9, 0.9, 0.1, 0.1]),
        ];
        let bbox = select_best(&candidates, 0.5, 640, 480).unwrap();
        assert_eq!(bbox, BoundingBox::new(320.0, 120.0, 160.0, 240.0));
    }

    #[test]
    fn equal_scores_keep_first() {
        let candidates = [
            candidate(0.8, [0.0, 0.0, 0.5, 0.5]),
            candidate(0.8, [0.5, 0.5, 0.5, 0.5]),
        ];
        let bbox = select_best(&candidates, 0.5, 100, 100).unwrap();
        assert_eq!(bbox.x, 0.0);
        assert_eq!(bbox.y, 0.0);
    }

    #[test]
    fn empty_and_nan_give_no_detection() {
        assert!(select_best(&[], 0.5, 640, 480).is_none());
        assert!(select_best(&[candidate(f32::NAN, [0.0; 4])], 0.5, 640, 480).is_none());
    }

    #[test]
    fn raw_outputs_pair_by_index() {
        let boxes = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9];
        let scores = [0.7, 0.2, 0.99];
        let candidates = candidates_from_raw(&boxes, &scores);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].score, 0.2);
        assert_eq!(candidates[1].bbox.y, 0.5);
        assert_eq!(candidates[1].bbox.width, 0.8);
    }
}
