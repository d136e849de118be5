//! Error types shared across the capture, display and recording paths

use thiserror::Error;

use crate::capture::frame::Eye;

/// Failures raised by a capture device or while filling a frame slot.
///
/// Every variant is transient from the pipeline's point of view: capture
/// workers log it and retry after the configured backoff.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open capture device {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("device {device} does not support video capture")]
    NotCaptureDevice { device: String },

    #[error("capture stream not started")]
    NotStreaming,

    #[error("dequeue failed: {0}")]
    Dequeue(#[from] std::io::Error),

    #[error("device returned an empty frame")]
    EmptyFrame,

    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("failed to decode frame: {0}")]
    Decode(String),

    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(crate::capture::frame::PixelFormat),
}

/// Failures raised by a render backend.
#[derive(Debug, Error)]
pub enum DisplayError {
    /// Context, window, shader or surface creation failed. Fatal at startup.
    #[error("display initialization failed: {0}")]
    Init(String),

    #[error("surface {surface}: {reason}")]
    Surface { surface: usize, reason: String },

    #[error("upload for {eye:?} eye rejected: expected {expected} bytes, got {actual}")]
    Upload {
        eye: Eye,
        expected: usize,
        actual: usize,
    },

    #[error("render worker {0} is gone")]
    WorkerLost(usize),

    #[error("render barrier lock poisoned")]
    Poisoned,

    #[error("backend already shut down")]
    ShutDown,
}

impl DisplayError {
    /// A single surface or upload failed; the next cycle may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DisplayError::Surface { .. } | DisplayError::Upload { .. })
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("recording I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode composite frame: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
