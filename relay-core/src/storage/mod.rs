// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Protocol Store
//!
//! The single source of truth for device lists, sessions, identities and key
//! material. The relay client only consumes [`ProtocolStore`]; two
//! implementations ship with the crate: [`MemoryStore`] for tests and
//! ephemeral clients, and [`SqliteStore`] for persistence.
//!
//! Session records are opaque bytes owned by the session cipher. The set of
//! device ids known for a user is the set of devices with a session record.

mod error;
mod memory;
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::address::Address;
use crate::crypto::SignalingKey;
use crate::keys::{IdentityKeyPair, PreKeyPair};

/// Well-known keys of the state table.
pub mod state_keys {
    pub const ADDR: &str = "addr";
    pub const DEVICE_ID: &str = "deviceId";
    pub const NAME: &str = "name";
    pub const PASSWORD: &str = "password";
    pub const REGISTRATION_ID: &str = "registrationId";
    pub const SIGNALING_KEY: &str = "signalingKey";
    pub const USERNAME: &str = "username";
    pub const MAX_PRE_KEY_ID: &str = "maxPreKeyId";
    pub const SIGNED_KEY_ID: &str = "signedKeyId";

    /// Per-device keys wiped whenever device state is replaced.
    pub const DEVICE_STATE: &[&str] = &[
        DEVICE_ID,
        NAME,
        PASSWORD,
        REGISTRATION_ID,
        SIGNALING_KEY,
        USERNAME,
    ];
}

/// Everything persisted about this device after registration or linking.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub addr: String,
    pub device_id: u32,
    pub name: String,
    pub password: String,
    pub registration_id: u32,
    pub signaling_key: SignalingKey,
    pub identity: IdentityKeyPair,
}

impl DeviceState {
    /// Login name used for server auth: `addr.deviceId`.
    pub fn username(&self) -> String {
        Address::device(self.addr.clone(), self.device_id).to_string()
    }

    /// State table rows written for this device, `addr` included.
    pub(crate) fn state_entries(&self) -> Vec<(&'static str, Value)> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

        vec![
            (state_keys::ADDR, Value::from(self.addr.clone())),
            (state_keys::DEVICE_ID, Value::from(self.device_id)),
            (state_keys::NAME, Value::from(self.name.clone())),
            (state_keys::PASSWORD, Value::from(self.password.clone())),
            (state_keys::REGISTRATION_ID, Value::from(self.registration_id)),
            (
                state_keys::SIGNALING_KEY,
                Value::from(BASE64.encode(self.signaling_key.as_bytes())),
            ),
            (state_keys::USERNAME, Value::from(self.username())),
        ]
    }
}

/// Storage operations the relay client needs.
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    // === State ===

    async fn get_state(&self, key: &str) -> StoreResult<Option<Value>>;

    async fn put_state(&self, key: &str, value: Value) -> StoreResult<()>;

    async fn remove_state(&self, key: &str) -> StoreResult<()>;

    /// Writes several state values atomically.
    async fn put_states(&self, entries: &[(&str, Value)]) -> StoreResult<()>;

    // === Identities ===

    async fn get_our_identity(&self) -> StoreResult<Option<IdentityKeyPair>>;

    async fn save_our_identity(&self, pair: &IdentityKeyPair) -> StoreResult<()>;

    async fn remove_our_identity(&self) -> StoreResult<()>;

    /// Trusted identity key for a remote user.
    async fn load_identity(&self, user_id: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn save_identity(&self, user_id: &str, identity_key: &[u8]) -> StoreResult<()>;

    async fn remove_identity(&self, user_id: &str) -> StoreResult<()>;

    // === Prekeys ===

    async fn load_pre_key(&self, key_id: u32) -> StoreResult<Option<PreKeyPair>>;

    async fn store_pre_key(&self, key_id: u32, pair: &PreKeyPair) -> StoreResult<()>;

    async fn remove_pre_key(&self, key_id: u32) -> StoreResult<()>;

    async fn load_signed_pre_key(&self, key_id: u32) -> StoreResult<Option<PreKeyPair>>;

    async fn store_signed_pre_key(&self, key_id: u32, pair: &PreKeyPair) -> StoreResult<()>;

    async fn remove_signed_pre_key(&self, key_id: u32) -> StoreResult<()>;

    /// Ids of every stored signed prekey, ascending.
    async fn signed_pre_key_ids(&self) -> StoreResult<Vec<u32>>;

    // === Sessions ===

    async fn load_session(&self, addr: &Address) -> StoreResult<Option<Vec<u8>>>;

    async fn store_session(&self, addr: &Address, record: &[u8]) -> StoreResult<()>;

    async fn remove_session(&self, addr: &Address) -> StoreResult<()>;

    async fn remove_all_sessions(&self, user_id: &str) -> StoreResult<()>;

    async fn clear_session_store(&self) -> StoreResult<()>;

    /// Devices of `user_id` that have a session record, ascending.
    async fn device_ids(&self, user_id: &str) -> StoreResult<Vec<u32>>;

    // === Device state ===

    /// Replaces this device's registration in one step: sessions and our
    /// identity are cleared, per-device state keys are rewritten, and our
    /// own identity key is trusted for `state.addr`.
    async fn save_device_state(&self, state: &DeviceState) -> StoreResult<()>;

    // === Blocking ===

    async fn is_blocked(&self, _user_id: &str) -> StoreResult<bool> {
        Ok(false)
    }

    // === Typed state helpers ===

    async fn get_state_u32(&self, key: &str) -> StoreResult<Option<u32>> {
        match self.get_state(key).await? {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(Some)
                .ok_or_else(|| StoreError::Serialization(format!("{key} is not a u32"))),
        }
    }

    async fn get_state_string(&self, key: &str) -> StoreResult<Option<String>> {
        match self.get_state(key).await? {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(StoreError::Serialization(format!("{key} is not a string"))),
        }
    }
}
