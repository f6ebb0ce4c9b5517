//! error — user-facing failure taxonomy
//!
//! Everything below the session boundary returns `anyhow::Result`; only the
//! failures a user has to act on get a typed variant here.  Per-frame
//! inference failures are deliberately absent: they are logged and the tick
//! continues as "no result".

use std::io;

use thiserror::Error;

/// Failure to start (or keep) a tracking session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// One or both inference services have not finished loading.
    #[error("{0} model is not ready; wait for it to load before starting")]
    ModelNotReady(&'static str),

    /// An inference service failed to initialise at all.
    #[error("failed to load {model} model: {reason}")]
    ModelLoad { model: &'static str, reason: String },

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

impl SessionError {
    pub fn model_load(model: &'static str, err: &anyhow::Error) -> Self {
        Self::ModelLoad {
            model,
            reason: format!("{err:#}"),
        }
    }
}

/// The capture device could not deliver a live stream.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera permission denied for {0}; check device permissions")]
    PermissionDenied(String),

    #[error("no capture device at {0}")]
    NoDevice(String),

    #[error("could not open {source_name}: {reason}")]
    Unavailable { source_name: String, reason: String },
}

impl CaptureError {
    /// Classify an FFmpeg open failure by its errno.
    pub fn from_ffmpeg(source_name: &str, err: ffmpeg_next::Error) -> Self {
        if let ffmpeg_next::Error::Other { errno } = err {
            match io::Error::from_raw_os_error(errno).kind() {
                io::ErrorKind::PermissionDenied => {
                    return Self::PermissionDenied(source_name.to_string())
                }
                io::ErrorKind::NotFound => return Self::NoDevice(source_name.to_string()),
                _ => {}
            }
        }
        Self::Unavailable {
            source_name: source_name.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification() {
        let denied = CaptureError::from_ffmpeg("/dev/video0", ffmpeg_next::Error::Other { errno: 13 });
        assert!(matches!(denied, CaptureError::PermissionDenied(_)));

        let missing = CaptureError::from_ffmpeg("/dev/video9", ffmpeg_next::Error::Other { errno: 2 });
        assert!(matches!(missing, CaptureError::NoDevice(_)));

        let other = CaptureError::from_ffmpeg("clip.mp4", ffmpeg_next::Error::InvalidData);
        assert!(matches!(other, CaptureError::Unavailable { .. }));
    }

    #[test]
    fn model_load_keeps_context_chain() {
        let err = anyhow::anyhow!("file not found").context("failed to open detector.onnx");
        let msg = SessionError::model_load("detection", &err).to_string();
        assert!(msg.contains("detection"));
        assert!(msg.contains("file not found"));
    }
}
