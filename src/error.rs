//! Typed errors at the codec and audio-device boundaries.

use thiserror::Error;

/// Errors from the Opus gateway. The pipeline drops the offending frame and
/// keeps going; none of these are fatal to a session.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec instance has been destroyed")]
    Destroyed,

    #[error("implausible frame size: {0} bytes")]
    ImplausibleFrame(usize),

    #[error("expected {expected} samples per frame, got {actual}")]
    FrameLength { expected: usize, actual: usize },

    #[error("unsupported stream format: {0}")]
    UnsupportedFormat(String),

    #[error("opus: {0}")]
    Opus(#[from] opus::Error),
}

/// Errors raised when opening or driving audio hardware.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio device error: {0}")]
    Device(String),

    #[error("capture already running")]
    AlreadyRunning,

    #[error("audio backend not available in this build")]
    Unsupported,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
