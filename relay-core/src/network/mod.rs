//! Network + Transport Layer
//!
//! Carries request/response exchanges between a device and the relay server
//! over one persistent socket.
//!
//! # Architecture
//!
//! The network layer consists of:
//! - **Transport trait**: Platform-agnostic interface for framed socket I/O
//! - **Protocol layer**: Request/response frames and their serialization
//! - **Relay socket**: Request multiplexing, keepalive and reconnect throttling
//!
//! # Example
//!
//! ```ignore
//! use relay_core::network::{MockTransport, RelaySocket, SocketOptions};
//!
//! let (transport, peer) = MockTransport::pair();
//! let (socket, mut requests) = RelaySocket::new(transport, SocketOptions::new("ws://relay"));
//! socket.connect().await?;
//!
//! let response = socket.request("GET", "/v1/keepalive", None).await?;
//! while let Some(request) = requests.recv().await {
//!     request.respond(200, "OK");
//! }
//! ```

mod error;
mod mock;
mod protocol;
mod socket;
mod transport;
mod websocket;

// Error types
pub use error::NetworkError;

// Wire protocol
pub use protocol::{
    decode_message, encode_message, read_frame_length, write_frame_length, WireMessage,
    WireRequest, WireResponse, FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE,
};

// Transport
pub use mock::{MockPeer, MockTransport};
pub use transport::{ConnectionState, Transport, TransportConfig, TransportResult};
pub use websocket::WebSocketTransport;

// Socket
pub use socket::{
    IncomingRequest, IncomingRequests, KeepaliveOptions, ReconnectPolicy, RelaySocket,
    SocketEvent, SocketOptions, ABNORMAL_CLOSE_CODE, KEEPALIVE_CLOSE_CODE,
};
