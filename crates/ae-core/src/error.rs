//! Audio engine error types

use thiserror::Error;

/// Errors that can occur inside the audio engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AeError {
    /// No audio devices available
    #[error("No audio output devices found")]
    NoDevices,

    /// Device not found
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    /// Device could not be opened or configured
    #[error("Failed to configure audio device: {0}")]
    ConfigError(String),

    /// Failed to build output stream
    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start/play stream
    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    /// Device reported an error while writing
    #[error("Audio device write failed: {0}")]
    WriteError(String),

    /// Unsupported sample format
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    /// Stream request rejected at creation time
    #[error("Invalid stream request: {0}")]
    InvalidStream(String),

    /// Resampler could not be built or failed while processing
    #[error("Resampler error: {0}")]
    Resampler(String),

    /// Time-stretch filter failure
    #[error("Tempo filter error: {0}")]
    TempoFilter(String),

    /// Engine has not been initialized or is shutting down
    #[error("Audio engine is not running")]
    NotRunning,

    /// A synchronous request did not get an answer in time
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The other end of a port went away
    #[error("Channel disconnected: {0}")]
    Disconnected(&'static str),
}

/// Result type for engine operations
pub type AeResult<T> = Result<T, AeError>;
