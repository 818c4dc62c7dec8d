// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Core Library
//!
//! Client-side transport and session-reconciliation engine for a
//! Signal-protocol relay: a duplexed request/response socket with keepalive
//! and reconnect, the incoming envelope pipeline, multi-device outgoing
//! fan-out with bounded reconciliation, and account/key lifecycle including
//! device provisioning.
//!
//! The double-ratchet session cipher is consumed through [`SessionCipher`];
//! key material and sessions persist through [`ProtocolStore`].

pub mod account;
pub mod address;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod events;
pub mod keys;
pub mod message;
pub mod network;
pub mod padding;
pub mod provisioning;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;
pub mod storage;

pub use account::{
    AccountEvent, AccountEventKind, AccountManager, DeviceRegistration, KeyProgress,
    ProvisionDelegate,
};
pub use address::{Address, AddressError};
pub use config::{RelayConfig, RelayConfigBuilder};
pub use context::RelayContext;
pub use error::{RelayError, RelayResult};
pub use events::{CallbackHandler, EventBus, EventHandler, EventKind, KeyChangeEvent, Subscription};
pub use keys::{GeneratedKeys, IdentityKeyPair, PreKey, PreKeyBundle, PreKeyPair, SignedPreKey};
pub use message::{
    AttachmentPointer, Content, DataMessage, Envelope, EnvelopeType, ReadEntry, SentTranscript,
    SyncMessage,
};
pub use network::{
    ConnectionState, IncomingRequest, MockPeer, MockTransport, NetworkError, RelaySocket,
    SocketEvent, SocketOptions, Transport, WebSocketTransport,
};
pub use padding::{pad, unpad, PaddingError};
pub use provisioning::{
    ProvisionEnvelope, ProvisionMessage, ProvisioningCipher, ProvisioningError, ProvisioningUrl,
};
pub use receiver::{
    ActivityState, FetchedAttachment, MessageEvent, MessageOrigin, MessageReceiver, ReadEvent,
    ReceiverEvent, ReceiverEventKind, ReceiverIdentity, ReceiverMode,
};
pub use sender::{
    ErrorEntry, MessageSender, OutgoingAttachment, OutgoingEvent, OutgoingEventKind,
    OutgoingMessage, SendRequest, SenderEvent, SenderEventKind, SentEntry,
};
pub use server::{HttpRelayServer, RelayServer};
pub use session::{CiphertextMessage, SessionCipher, SessionError};
pub use storage::{DeviceState, MemoryStore, ProtocolStore, SqliteStore, StoreError};
