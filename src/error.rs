//! Error types for the overlay LAN core.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sessions, adapters and the switch.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Transport is not connected
    #[error("Transport is not connected")]
    NotConnected,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed wire frame
    #[error("Frame format error: {0}")]
    Format(String),

    /// JSON body could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Virtual device error
    #[error("Device error: {0}")]
    Device(String),

    /// Timeout
    #[error("Operation timed out")]
    Timeout,

    /// Component was stopped by its owner
    #[error("Terminated")]
    Terminated,

    /// Channel closed
    #[error("Internal channel closed unexpectedly")]
    ChannelClosed,
}

impl Error {
    /// Create a new connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    /// Create a new frame format error.
    pub fn format<S: Into<String>>(msg: S) -> Self {
        Self::Format(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new device error.
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::Device(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// Transport-level failures are recovered by reconnecting.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::NotConnected
                | Self::Io(_)
                | Self::Timeout
                | Self::ChannelClosed
        )
    }
}
