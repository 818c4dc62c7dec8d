//! Transport Trait
//!
//! Platform-agnostic abstraction for the persistent socket underneath
//! [`RelaySocket`](super::RelaySocket).

use async_trait::async_trait;

use super::error::NetworkError;
use super::protocol::WireMessage;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, NetworkError>;

/// Connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected to any server.
    Disconnected,
    /// Connection in progress.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Connecting again after an earlier connection.
    Reconnecting { attempt: u32 },
    /// Shut down; no further connects are accepted.
    Closed,
}

/// Configuration for transport connections.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Socket URL (`ws://` or `wss://`).
    pub server_url: String,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            server_url: String::new(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl TransportConfig {
    pub fn new(server_url: &str) -> Self {
        TransportConfig {
            server_url: server_url.to_string(),
            ..Default::default()
        }
    }
}

/// Transport trait for a single persistent, framed connection.
///
/// # Cancellation
///
/// [`Transport::receive`] is raced against timers and commands, so it must be
/// cancel safe: dropping the future before it resolves must not lose a frame.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Opens the connection. Resolves once it is usable.
    async fn connect(&mut self, config: &TransportConfig) -> TransportResult<()>;

    /// Closes the connection with a close code and reason.
    ///
    /// Safe to call even if not connected.
    async fn disconnect(&mut self, code: u16, reason: &str) -> TransportResult<()>;

    /// Returns the current connection state.
    fn state(&self) -> ConnectionState;

    /// Sends one frame.
    async fn send(&mut self, message: &WireMessage) -> TransportResult<()>;

    /// Waits for the next frame.
    ///
    /// Returns `Ok(None)` for control traffic that carries no frame (pings).
    /// A peer close surfaces as [`NetworkError::ConnectionClosed`].
    async fn receive(&mut self) -> TransportResult<Option<WireMessage>>;
}
