//! Mock Transport
//!
//! In-process transport for tests. [`MockTransport::pair`] returns the client
//! end, handed to a [`RelaySocket`](super::RelaySocket), and a [`MockPeer`]
//! that plays the server.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::error::NetworkError;
use super::protocol::{WireMessage, WireRequest, WireResponse};
use super::transport::{ConnectionState, Transport, TransportConfig, TransportResult};

/// What the peer pushes toward the client.
#[derive(Debug)]
enum PeerFrame {
    Message(WireMessage),
    Invalid(String),
    Close,
}

#[derive(Debug, Default)]
struct Shared {
    connected: bool,
    fail_connects: u32,
    close_codes: Vec<(u16, String)>,
    urls: Vec<String>,
}

/// Client end of an in-process connection.
pub struct MockTransport {
    shared: Arc<Mutex<Shared>>,
    connects: watch::Sender<u32>,
    to_peer: mpsc::UnboundedSender<WireMessage>,
    from_peer: mpsc::UnboundedReceiver<PeerFrame>,
    state: ConnectionState,
}

/// Server end of a [`MockTransport`].
pub struct MockPeer {
    shared: Arc<Mutex<Shared>>,
    connects: watch::Receiver<u32>,
    to_client: mpsc::UnboundedSender<PeerFrame>,
    from_client: mpsc::UnboundedReceiver<WireMessage>,
}

impl MockTransport {
    /// Creates a connected client/peer pair.
    pub fn pair() -> (MockTransport, MockPeer) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (connects_tx, connects_rx) = watch::channel(0);
        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();
        let transport = MockTransport {
            shared: shared.clone(),
            connects: connects_tx,
            to_peer,
            from_peer,
            state: ConnectionState::Disconnected,
        };
        let peer = MockPeer {
            shared,
            connects: connects_rx,
            to_client,
            from_client,
        };
        (transport, peer)
    }

    fn set_connected(&mut self, connected: bool) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.connected = connected;
        }
        self.state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, config: &TransportConfig) -> TransportResult<()> {
        let fail = {
            let mut shared = self
                .shared
                .lock()
                .map_err(|_| NetworkError::ConnectionFailed("mock poisoned".into()))?;
            shared.urls.push(config.server_url.clone());
            if shared.fail_connects > 0 {
                shared.fail_connects -= 1;
                true
            } else {
                false
            }
        };
        self.connects.send_modify(|count| *count += 1);
        if fail {
            return Err(NetworkError::ConnectionFailed("mock refused".into()));
        }
        self.set_connected(true);
        Ok(())
    }

    async fn disconnect(&mut self, code: u16, reason: &str) -> TransportResult<()> {
        if self.state == ConnectionState::Connected {
            if let Ok(mut shared) = self.shared.lock() {
                shared.close_codes.push((code, reason.to_string()));
            }
        }
        self.set_connected(false);
        // Frames in flight on a dead connection are lost.
        while self.from_peer.try_recv().is_ok() {}
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.clone()
    }

    async fn send(&mut self, message: &WireMessage) -> TransportResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(NetworkError::NotConnected);
        }
        self.to_peer
            .send(message.clone())
            .map_err(|_| NetworkError::SendFailed("peer dropped".into()))
    }

    async fn receive(&mut self) -> TransportResult<Option<WireMessage>> {
        if self.state != ConnectionState::Connected {
            return Err(NetworkError::NotConnected);
        }
        match self.from_peer.recv().await {
            Some(PeerFrame::Message(message)) => Ok(Some(message)),
            Some(PeerFrame::Invalid(reason)) => Err(NetworkError::InvalidMessage(reason)),
            Some(PeerFrame::Close) | None => {
                self.set_connected(false);
                Err(NetworkError::ConnectionClosed)
            }
        }
    }
}

impl MockPeer {
    /// Next frame written by the client.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.from_client.recv().await
    }

    /// Next request written by the client, skipping responses.
    pub async fn recv_request(&mut self) -> Option<WireRequest> {
        while let Some(message) = self.from_client.recv().await {
            if let WireMessage::Request(request) = message {
                return Some(request);
            }
        }
        None
    }

    /// Next response written by the client, skipping requests.
    pub async fn recv_response(&mut self) -> Option<WireResponse> {
        while let Some(message) = self.from_client.recv().await {
            if let WireMessage::Response(response) = message {
                return Some(response);
            }
        }
        None
    }

    /// Frame already written by the client, if any.
    pub fn try_recv(&mut self) -> Option<WireMessage> {
        self.from_client.try_recv().ok()
    }

    pub fn send(&self, message: WireMessage) {
        let _ = self.to_client.send(PeerFrame::Message(message));
    }

    /// Sends a server-initiated request.
    pub fn send_request(&self, id: u64, verb: &str, path: &str, body: Option<Vec<u8>>) {
        self.send(WireMessage::Request(WireRequest {
            id,
            verb: verb.to_string(),
            path: path.to_string(),
            body,
        }));
    }

    /// Answers a client request.
    pub fn respond(&self, id: u64, status: u16, message: &str, body: Option<Vec<u8>>) {
        self.send(WireMessage::Response(WireResponse {
            id,
            status,
            message: message.to_string(),
            body,
        }));
    }

    /// Delivers a frame that fails to decode.
    pub fn send_invalid(&self, reason: &str) {
        let _ = self.to_client.send(PeerFrame::Invalid(reason.to_string()));
    }

    /// Drops the current connection from the server side.
    pub fn drop_connection(&self) {
        let connected = self.shared.lock().map(|s| s.connected).unwrap_or(false);
        if connected {
            let _ = self.to_client.send(PeerFrame::Close);
        }
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.fail_connects = count;
        }
    }

    /// Number of connection attempts so far.
    pub fn connect_count(&self) -> u32 {
        *self.connects.borrow()
    }

    /// Waits until at least `count` connection attempts were made.
    pub async fn wait_for_connects(&mut self, count: u32) {
        let _ = self.connects.wait_for(|n| *n >= count).await;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().map(|s| s.connected).unwrap_or(false)
    }

    /// Close codes and reasons the client sent, oldest first.
    pub fn close_codes(&self) -> Vec<(u16, String)> {
        self.shared
            .lock()
            .map(|s| s.close_codes.clone())
            .unwrap_or_default()
    }

    /// URLs the client connected to, oldest first.
    pub fn urls(&self) -> Vec<String> {
        self.shared
            .lock()
            .map(|s| s.urls.clone())
            .unwrap_or_default()
    }
}
