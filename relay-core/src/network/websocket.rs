// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Transport
//!
//! Real transport implementation using tokio-tungstenite. TLS comes from the
//! `network-rustls` or `network-native-tls` feature.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::error::NetworkError;
use super::protocol::{decode_message, encode_message, WireMessage};
use super::transport::{ConnectionState, Transport, TransportConfig, TransportResult};

/// WebSocket transport for relay communication.
///
/// Supports both ws:// (plaintext) and wss:// (TLS) connections.
///
/// # Example
///
/// ```ignore
/// use relay_core::network::{WebSocketTransport, TransportConfig, Transport};
///
/// let mut transport = WebSocketTransport::new();
/// transport.connect(&TransportConfig::new("wss://relay.example.com/v1/websocket/")).await?;
/// ```
pub struct WebSocketTransport {
    socket: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    state: ConnectionState,
}

impl WebSocketTransport {
    /// Creates a new WebSocket transport.
    pub fn new() -> Self {
        WebSocketTransport {
            socket: None,
            state: ConnectionState::Disconnected,
        }
    }

    fn check_scheme(url: &str) -> TransportResult<()> {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            Ok(())
        } else {
            Err(NetworkError::ConnectionFailed(
                "Invalid URL scheme (expected ws:// or wss://)".into(),
            ))
        }
    }

    fn map_error(&mut self, err: tungstenite::Error) -> NetworkError {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                self.socket = None;
                self.state = ConnectionState::Disconnected;
                NetworkError::ConnectionClosed
            }
            other => NetworkError::ReceiveFailed(other.to_string()),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self, config: &TransportConfig) -> TransportResult<()> {
        if matches!(self.state, ConnectionState::Connected) {
            return Ok(());
        }
        Self::check_scheme(&config.server_url)?;
        self.state = ConnectionState::Connecting;

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let result = tokio::time::timeout(timeout, connect_async(config.server_url.as_str())).await;
        match result {
            Ok(Ok((socket, _response))) => {
                self.socket = Some(socket);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                Err(NetworkError::ConnectionFailed(format!(
                    "WebSocket handshake failed: {}",
                    e
                )))
            }
            Err(_) => {
                self.state = ConnectionState::Disconnected;
                Err(NetworkError::ConnectionFailed("Connect timed out".into()))
            }
        }
    }

    async fn disconnect(&mut self, code: u16, reason: &str) -> TransportResult<()> {
        if let Some(mut socket) = self.socket.take() {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            };
            // Ignore errors on close
            let _ = socket.close(Some(frame)).await;
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.clone()
    }

    async fn send(&mut self, message: &WireMessage) -> TransportResult<()> {
        let socket = self.socket.as_mut().ok_or(NetworkError::NotConnected)?;
        let encoded = encode_message(message)?;
        if let Err(e) = socket.send(Message::Binary(encoded)).await {
            return Err(match self.map_error(e) {
                NetworkError::ReceiveFailed(msg) => NetworkError::SendFailed(msg),
                other => other,
            });
        }
        Ok(())
    }

    async fn receive(&mut self) -> TransportResult<Option<WireMessage>> {
        let socket = self.socket.as_mut().ok_or(NetworkError::NotConnected)?;
        match socket.next().await {
            Some(Ok(Message::Binary(data))) => Ok(Some(decode_message(&data)?)),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                // tungstenite answers pings on the next read/write
                Ok(None)
            }
            Some(Ok(Message::Close(frame))) => {
                debug!("WebSocket closed by peer: {:?}", frame);
                self.socket = None;
                self.state = ConnectionState::Disconnected;
                Err(NetworkError::ConnectionClosed)
            }
            Some(Ok(Message::Text(_))) => Err(NetworkError::InvalidMessage(
                "Unexpected text message".into(),
            )),
            Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Err(e)) => Err(self.map_error(e)),
            None => {
                self.socket = None;
                self.state = ConnectionState::Disconnected;
                Err(NetworkError::ConnectionClosed)
            }
        }
    }
}
