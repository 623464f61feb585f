//! Error types for host-side operations

use pageprog_proto::{ErrorCode, WireError};
use thiserror::Error;

/// Host-side errors
#[derive(Debug, Error)]
pub enum HostError {
    /// Failed to connect to the programmer
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// I/O error during communication
    #[error("I/O error: {0}")]
    Io(String),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The response stream could not be decoded; the session is
    /// desynchronized and must be reopened
    #[error("Response stream error: {0}")]
    Protocol(#[from] WireError),

    /// The device rejected or aborted the operation
    #[error("Device error: {0}")]
    Device(ErrorCode),

    /// A well-formed response arrived where it makes no sense
    #[error("Unexpected response frame during {0}")]
    UnexpectedFrame(&'static str),

    /// No response within the allotted time
    #[error("Communication timeout")]
    Timeout,

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result type for host operations
pub type Result<T> = core::result::Result<T, HostError>;

impl From<std::io::Error> for HostError {
    fn from(e: std::io::Error) -> Self {
        HostError::Io(e.to_string())
    }
}
