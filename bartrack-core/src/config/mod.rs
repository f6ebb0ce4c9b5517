//! config — tracker tuning shared by the coordinator, detectors and overlays

use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Minimum detection score; candidates must be strictly above it.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
/// Minimum mean keypoint score for a pose to count as present.
pub const DEFAULT_KEYPOINT_THRESHOLD: f32 = 0.3;
pub const DEFAULT_SURFACE_WIDTH: u32 = 640;
pub const DEFAULT_SURFACE_HEIGHT: u32 = 480;
pub const DEFAULT_FPS: u32 = 30;
/// Largest accepted render surface edge, in pixels.
pub const MAX_SURFACE_DIM: u32 = 8192;

/// Where observation timestamps come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    /// Monotonic milliseconds from the frame clock (live cameras).
    #[default]
    Wall,
    /// Presentation time of the decoded frame (recorded clips).
    Stream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub confidence_threshold: f32,
    pub keypoint_threshold: f32,
    /// Render surface size; every frame is copied into a buffer of this size.
    pub surface_width: u32,
    pub surface_height: u32,
    pub fps: u32,
    pub timestamps: TimestampSource,
    pub box_color: [u8; 3],
    pub left_arm_color: [u8; 3],
    pub right_arm_color: [u8; 3],
    pub line_width: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            keypoint_threshold: DEFAULT_KEYPOINT_THRESHOLD,
            surface_width: DEFAULT_SURFACE_WIDTH,
            surface_height: DEFAULT_SURFACE_HEIGHT,
            fps: DEFAULT_FPS,
            timestamps: TimestampSource::Wall,
            box_color: [0, 255, 0],
            left_arm_color: [255, 64, 64],
            right_arm_color: [64, 128, 255],
            line_width: 2,
        }
    }
}

impl TrackerConfig {
    /// Read a JSON config file; missing fields keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.confidence_threshold),
            "confidence_threshold must be within [0, 1], got {}",
            self.confidence_threshold
        );
        ensure!(
            (0.0..=1.0).contains(&self.keypoint_threshold),
            "keypoint_threshold must be within [0, 1], got {}",
            self.keypoint_threshold
        );
        ensure!(
            self.surface_width > 0 && self.surface_height > 0,
            "render surface must be non-empty, got {}x{}",
            self.surface_width,
            self.surface_height
        );
        ensure!(
            self.surface_width <= MAX_SURFACE_DIM && self.surface_height <= MAX_SURFACE_DIM,
            "render surface {}x{} exceeds {MAX_SURFACE_DIM} pixels per edge",
            self.surface_width,
            self.surface_height
        );
        ensure!(self.fps > 0, "fps must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: TrackerConfig =
            serde_json::from_str(r#"{ "confidence_threshold": 0.7, "timestamps": "stream" }"#)
                .unwrap();
        assert_eq!(config.confidence_threshold, 0.7);
        assert_eq!(config.timestamps, TimestampSource::Stream);
        assert_eq!(config.surface_width, DEFAULT_SURFACE_WIDTH);
        assert_eq!(config.box_color, [0, 255, 0]);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let config = TrackerConfig {
            confidence_threshold: 1.5,
            ..TrackerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_surface() {
        let config = TrackerConfig {
            surface_height: 0,
            ..TrackerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_surface() {
        let config = TrackerConfig {
            surface_width: 70_000,
            surface_height: 70_000,
            ..TrackerConfig::default()
        };
        assert!(config.validate().is_err());

        let edge = TrackerConfig {
            surface_width: MAX_SURFACE_DIM,
            surface_height: MAX_SURFACE_DIM,
            ..TrackerConfig::default()
        };
        edge.validate().unwrap();
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("bartrack-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "fps": 60, "line_width": 3 }"#).unwrap();
        let config = TrackerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.fps, 60);
        assert_eq!(config.line_width, 3);
    }
}
