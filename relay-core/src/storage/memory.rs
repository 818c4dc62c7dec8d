//! In-memory protocol store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::{state_keys, DeviceState, ProtocolStore, StoreError, StoreResult};
use crate::address::Address;
use crate::keys::{IdentityKeyPair, PreKeyPair};

#[derive(Default)]
struct Inner {
    state: HashMap<String, Value>,
    our_identity: Option<IdentityKeyPair>,
    identities: HashMap<String, Vec<u8>>,
    pre_keys: HashMap<u32, PreKeyPair>,
    signed_pre_keys: BTreeMap<u32, PreKeyPair>,
    /// user id -> device id -> session record
    sessions: HashMap<String, BTreeMap<u32, Vec<u8>>>,
    blocked: HashSet<String>,
}

/// Protocol store held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Marks `user_id` as blocked.
    pub fn block(&self, user_id: &str) -> StoreResult<()> {
        self.lock()?.blocked.insert(user_id.to_string());
        Ok(())
    }

    pub fn unblock(&self, user_id: &str) -> StoreResult<()> {
        self.lock()?.blocked.remove(user_id);
        Ok(())
    }

    /// Number of stored one-time prekeys.
    pub fn pre_key_count(&self) -> StoreResult<usize> {
        Ok(self.lock()?.pre_keys.len())
    }
}

fn device_of(addr: &Address) -> StoreResult<u32> {
    addr.device_id()
        .ok_or_else(|| StoreError::NotFound(format!("session address without device: {addr}")))
}

#[async_trait]
impl ProtocolStore for MemoryStore {
    async fn get_state(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.lock()?.state.get(key).cloned())
    }

    async fn put_state(&self, key: &str, value: Value) -> StoreResult<()> {
        self.lock()?.state.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_state(&self, key: &str) -> StoreResult<()> {
        self.lock()?.state.remove(key);
        Ok(())
    }

    async fn put_states(&self, entries: &[(&str, Value)]) -> StoreResult<()> {
        let mut inner = self.lock()?;
        for (key, value) in entries {
            inner.state.insert(key.to_string(), value.clone());
        }
        Ok(())
    }

    async fn get_our_identity(&self) -> StoreResult<Option<IdentityKeyPair>> {
        Ok(self.lock()?.our_identity.clone())
    }

    async fn save_our_identity(&self, pair: &IdentityKeyPair) -> StoreResult<()> {
        self.lock()?.our_identity = Some(pair.clone());
        Ok(())
    }

    async fn remove_our_identity(&self) -> StoreResult<()> {
        self.lock()?.our_identity = None;
        Ok(())
    }

    async fn load_identity(&self, user_id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.lock()?.identities.get(user_id).cloned())
    }

    async fn save_identity(&self, user_id: &str, identity_key: &[u8]) -> StoreResult<()> {
        self.lock()?
            .identities
            .insert(user_id.to_string(), identity_key.to_vec());
        Ok(())
    }

    async fn remove_identity(&self, user_id: &str) -> StoreResult<()> {
        self.lock()?.identities.remove(user_id);
        Ok(())
    }

    async fn load_pre_key(&self, key_id: u32) -> StoreResult<Option<PreKeyPair>> {
        Ok(self.lock()?.pre_keys.get(&key_id).cloned())
    }

    async fn store_pre_key(&self, key_id: u32, pair: &PreKeyPair) -> StoreResult<()> {
        self.lock()?.pre_keys.insert(key_id, pair.clone());
        Ok(())
    }

    async fn remove_pre_key(&self, key_id: u32) -> StoreResult<()> {
        self.lock()?.pre_keys.remove(&key_id);
        Ok(())
    }

    async fn load_signed_pre_key(&self, key_id: u32) -> StoreResult<Option<PreKeyPair>> {
        Ok(self.lock()?.signed_pre_keys.get(&key_id).cloned())
    }

    async fn store_signed_pre_key(&self, key_id: u32, pair: &PreKeyPair) -> StoreResult<()> {
        self.lock()?.signed_pre_keys.insert(key_id, pair.clone());
        Ok(())
    }

    async fn remove_signed_pre_key(&self, key_id: u32) -> StoreResult<()> {
        self.lock()?.signed_pre_keys.remove(&key_id);
        Ok(())
    }

    async fn signed_pre_key_ids(&self) -> StoreResult<Vec<u32>> {
        Ok(self.lock()?.signed_pre_keys.keys().copied().collect())
    }

    async fn load_session(&self, addr: &Address) -> StoreResult<Option<Vec<u8>>> {
        let device = device_of(addr)?;
        Ok(self
            .lock()?
            .sessions
            .get(addr.user_id())
            .and_then(|devices| devices.get(&device))
            .cloned())
    }

    async fn store_session(&self, addr: &Address, record: &[u8]) -> StoreResult<()> {
        let device = device_of(addr)?;
        self.lock()?
            .sessions
            .entry(addr.user_id().to_string())
            .or_default()
            .insert(device, record.to_vec());
        Ok(())
    }

    async fn remove_session(&self, addr: &Address) -> StoreResult<()> {
        let device = device_of(addr)?;
        let mut inner = self.lock()?;
        if let Some(devices) = inner.sessions.get_mut(addr.user_id()) {
            devices.remove(&device);
            if devices.is_empty() {
                inner.sessions.remove(addr.user_id());
            }
        }
        Ok(())
    }

    async fn remove_all_sessions(&self, user_id: &str) -> StoreResult<()> {
        self.lock()?.sessions.remove(user_id);
        Ok(())
    }

    async fn clear_session_store(&self) -> StoreResult<()> {
        self.lock()?.sessions.clear();
        Ok(())
    }

    async fn device_ids(&self, user_id: &str) -> StoreResult<Vec<u32>> {
        Ok(self
            .lock()?
            .sessions
            .get(user_id)
            .map(|devices| devices.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn save_device_state(&self, state: &DeviceState) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.sessions.clear();
        inner.our_identity = None;
        for key in state_keys::DEVICE_STATE {
            inner.state.remove(*key);
        }
        inner.identities.remove(&state.addr);
        for (key, value) in state.state_entries() {
            inner.state.insert(key.to_string(), value);
        }
        inner
            .identities
            .insert(state.addr.clone(), state.identity.public_key().to_vec());
        inner.our_identity = Some(state.identity.clone());
        Ok(())
    }

    async fn is_blocked(&self, user_id: &str) -> StoreResult<bool> {
        Ok(self.lock()?.blocked.contains(user_id))
    }
}
