//! Network error types.

use thiserror::Error;

/// Network layer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Request failed with status {status}: {message}")]
    RequestFailed { status: u16, message: String },

    #[error("Socket shut down")]
    Shutdown,

    #[error("HTTP transport error: {0}")]
    Http(String),
}

impl NetworkError {
    /// Returns true if the error means the underlying connection is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            NetworkError::ConnectionClosed
                | NetworkError::NotConnected
                | NetworkError::ReceiveFailed(_)
                | NetworkError::SendFailed(_)
        )
    }
}
