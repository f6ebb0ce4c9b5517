pub mod config;
pub mod detection;
pub mod error;
pub mod pose;
pub mod rendering;
pub mod runtime;
pub mod session;
pub mod tracking;
pub mod video;

// Re-export the plumbing error type so callers only need `bartrack_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;

pub use config::TrackerConfig;
pub use error::{CaptureError, SessionError};
pub use session::{FrameCoordinator, Readout, Scheduler, Services, SessionHandle, TickOutcome};
