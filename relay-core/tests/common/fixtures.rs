// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Test Fixtures
//!
//! A registered device wired to the fakes, plus envelope builders. Envelope
//! payloads are padded plaintext since [`FakeSessions`] passes them through.

use std::sync::Arc;
use std::time::Duration;

use relay_core::crypto::SignalingKey;
use relay_core::receiver::ReceiverIdentity;
use relay_core::{
    Content, DataMessage, DeviceState, Envelope, EnvelopeType, IdentityKeyPair, MemoryStore,
    ProtocolStore, RelayConfig, RelayContext, SyncMessage,
};

use super::fakes::{FakeServer, FakeSessions};

pub const OUR_ADDR: &str = "alice";
pub const OUR_DEVICE: u32 = 1;
pub const BOB: &str = "bob";
pub const CAROL: &str = "carol";

pub fn config() -> RelayConfig {
    RelayConfig::builder()
        .server_url("https://relay.test")
        .credentials(format!("{OUR_ADDR}.{OUR_DEVICE}"), "secret")
        .pre_key_water_marks(2, 5)
        .idle_debounce(Duration::from_millis(100))
        .build()
        .unwrap()
}

pub fn device_state() -> DeviceState {
    DeviceState {
        addr: OUR_ADDR.to_string(),
        device_id: OUR_DEVICE,
        name: "test device".to_string(),
        password: "secret".to_string(),
        registration_id: 42,
        signaling_key: SignalingKey::generate().unwrap(),
        identity: IdentityKeyPair::generate().unwrap(),
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub sessions: Arc<FakeSessions>,
    pub server: Arc<FakeServer>,
    pub ctx: RelayContext,
    pub state: DeviceState,
}

impl Harness {
    pub fn identity(&self) -> ReceiverIdentity {
        ReceiverIdentity {
            addr: self.state.addr.clone(),
            device_id: self.state.device_id,
            signaling_key: self.state.signaling_key.clone(),
        }
    }
}

/// Fakes wired together, nothing registered yet.
pub fn unregistered_harness_with(config: RelayConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let sessions = Arc::new(FakeSessions::new(store.clone()));
    let server = Arc::new(FakeServer::new());
    let ctx = RelayContext::new(store.clone(), sessions.clone(), server.clone(), config);
    Harness {
        store,
        sessions,
        server,
        ctx,
        state: device_state(),
    }
}

pub fn unregistered_harness() -> Harness {
    unregistered_harness_with(config())
}

/// Harness registered as `alice.1`.
pub async fn harness() -> Harness {
    harness_with(config()).await
}

pub async fn harness_with(config: RelayConfig) -> Harness {
    let harness = unregistered_harness_with(config);
    harness.store.save_device_state(&harness.state).await.unwrap();
    harness
}

pub fn text(body: &str) -> DataMessage {
    DataMessage {
        body: Some(body.to_string()),
        ..DataMessage::default()
    }
}

fn padded(bytes: Vec<u8>) -> Vec<u8> {
    relay_core::pad(&bytes)
}

/// Content envelope of `envelope_type` from `source.device`.
pub fn content_envelope(
    envelope_type: EnvelopeType,
    source: &str,
    device: u32,
    timestamp: u64,
    content: &Content,
) -> Envelope {
    Envelope {
        envelope_type,
        source: source.to_string(),
        source_device: device,
        timestamp,
        legacy_message: None,
        content: Some(padded(content.encode().unwrap())),
    }
}

/// Data message that opens a session on receipt.
pub fn data_envelope(source: &str, device: u32, timestamp: u64, message: DataMessage) -> Envelope {
    content_envelope(
        EnvelopeType::PrekeyBundle,
        source,
        device,
        timestamp,
        &Content::data(message),
    )
}

/// Sync message from one of our own devices.
pub fn sync_envelope(device: u32, timestamp: u64, sync: SyncMessage) -> Envelope {
    content_envelope(
        EnvelopeType::PrekeyBundle,
        OUR_ADDR,
        device,
        timestamp,
        &Content::sync(sync),
    )
}

/// Data message in the legacy field instead of `content`.
pub fn legacy_envelope(source: &str, device: u32, timestamp: u64, message: DataMessage) -> Envelope {
    Envelope {
        envelope_type: EnvelopeType::PrekeyBundle,
        source: source.to_string(),
        source_device: device,
        timestamp,
        legacy_message: Some(padded(serde_json::to_vec(&message).unwrap())),
        content: None,
    }
}

pub fn receipt_envelope(source: &str, device: u32, timestamp: u64) -> Envelope {
    Envelope {
        envelope_type: EnvelopeType::Receipt,
        source: source.to_string(),
        source_device: device,
        timestamp,
        legacy_message: None,
        content: None,
    }
}
