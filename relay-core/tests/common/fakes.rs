//! Fake collaborators: a pass-through session cipher and a scriptable server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use relay_core::keys::{DeviceKeys, KeysResponse};
use relay_core::message::{Envelope, OutgoingDeviceMessage};
use relay_core::server::{AccountCreated, DeviceInfo, IncomingMessages, NewDeviceInfo};
use relay_core::{
    Address, CiphertextMessage, GeneratedKeys, MemoryStore, PreKey, PreKeyBundle, ProtocolStore,
    ProvisionEnvelope, RelayError, RelayResult, RelayServer, SessionCipher, SessionError,
    SignedPreKey,
};

use super::fixtures::{OUR_ADDR, OUR_DEVICE};

const OPEN: &[u8] = b"open";
const CLOSED: &[u8] = b"closed";

// ============================================================
// Session cipher
// ============================================================

#[derive(Default)]
struct SessionState {
    /// user -> identity key the peer currently presents
    presented: HashMap<String, Vec<u8>>,
    /// device addresses whose next decrypt is a replay
    replays: HashSet<String>,
    registration_ids: HashMap<String, u32>,
    ops: Vec<String>,
}

/// Session cipher that passes plaintext through and keeps session records
/// (`open` / `closed`) in a [`MemoryStore`].
pub struct FakeSessions {
    store: Arc<MemoryStore>,
    state: Mutex<SessionState>,
}

impl FakeSessions {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        FakeSessions {
            store,
            state: Mutex::new(SessionState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }

    fn log(&self, op: &str, addr: &Address) {
        self.state().ops.push(format!("{op} {addr}"));
    }

    /// Operations in call order, e.g. `"close bob.1"`.
    pub fn ops(&self) -> Vec<String> {
        self.state().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state().ops.clear();
    }

    /// Makes `user` present `identity_key` from now on.
    pub fn present_identity(&self, user: &str, identity_key: &[u8]) {
        self.state()
            .presented
            .insert(user.to_string(), identity_key.to_vec());
    }

    /// Makes the next decrypt from `addr` fail as a duplicate.
    pub fn replay_next(&self, addr: &str) {
        self.state().replays.insert(addr.to_string());
    }

    /// Opens a session with `addr` without going through a bundle.
    pub async fn open(&self, addr: &Address) {
        self.store.store_session(addr, OPEN).await.unwrap();
    }

    pub async fn is_open(&self, addr: &Address) -> bool {
        self.store.load_session(addr).await.unwrap().as_deref() == Some(OPEN)
    }

    async fn check_identity(&self, user: &str) -> Result<(), SessionError> {
        let presented = self.state().presented.get(user).cloned();
        let Some(presented) = presented else {
            return Ok(());
        };
        let trusted = self
            .store
            .load_identity(user)
            .await
            .map_err(|e| SessionError::Failed(e.to_string()))?;
        if trusted.as_deref() == Some(presented.as_slice()) {
            Ok(())
        } else {
            Err(SessionError::UntrustedIdentity {
                addr: user.to_string(),
                identity_key: presented,
            })
        }
    }

    async fn store_record(&self, addr: &Address, record: &[u8]) -> Result<(), SessionError> {
        self.store
            .store_session(addr, record)
            .await
            .map_err(|e| SessionError::Failed(e.to_string()))
    }
}

#[async_trait]
impl SessionCipher for FakeSessions {
    async fn encrypt(
        &self,
        addr: &Address,
        plaintext: &[u8],
    ) -> Result<CiphertextMessage, SessionError> {
        self.log("encrypt", addr);
        self.check_identity(addr.user_id()).await?;
        if !self.is_open(addr).await {
            return Err(SessionError::NoSession(addr.to_string()));
        }
        let registration_id = self
            .state()
            .registration_ids
            .get(&addr.to_string())
            .copied()
            .unwrap_or_default();
        Ok(CiphertextMessage {
            message_type: 1,
            body: plaintext.to_vec(),
            registration_id,
        })
    }

    async fn decrypt_whisper(
        &self,
        addr: &Address,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        self.log("decrypt", addr);
        if self.state().replays.remove(&addr.to_string()) {
            return Err(SessionError::MessageCounter(format!("old counter from {addr}")));
        }
        self.check_identity(addr.user_id()).await?;
        if !self.is_open(addr).await {
            return Err(SessionError::NoSession(addr.to_string()));
        }
        Ok(ciphertext.to_vec())
    }

    async fn decrypt_prekey_whisper(
        &self,
        addr: &Address,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        self.log("decrypt", addr);
        if self.state().replays.remove(&addr.to_string()) {
            return Err(SessionError::MessageCounter(format!("old counter from {addr}")));
        }
        self.check_identity(addr.user_id()).await?;
        self.store_record(addr, OPEN).await?;
        Ok(ciphertext.to_vec())
    }

    async fn has_open_session(&self, addr: &Address) -> Result<bool, SessionError> {
        Ok(self.is_open(addr).await)
    }

    async fn close_open_session(&self, addr: &Address) -> Result<(), SessionError> {
        self.log("close", addr);
        let existing = self
            .store
            .load_session(addr)
            .await
            .map_err(|e| SessionError::Failed(e.to_string()))?;
        if existing.is_some() {
            self.store_record(addr, CLOSED).await?;
        }
        Ok(())
    }

    async fn init_outgoing(
        &self,
        addr: &Address,
        bundle: &PreKeyBundle,
    ) -> Result<(), SessionError> {
        self.log("init", addr);
        let user = addr.user_id();
        let trusted = self
            .store
            .load_identity(user)
            .await
            .map_err(|e| SessionError::Failed(e.to_string()))?;
        match trusted {
            Some(key) if key != bundle.identity_key => {
                return Err(SessionError::UntrustedIdentity {
                    addr: user.to_string(),
                    identity_key: bundle.identity_key.clone(),
                });
            }
            Some(_) => {}
            None => self
                .store
                .save_identity(user, &bundle.identity_key)
                .await
                .map_err(|e| SessionError::Failed(e.to_string()))?,
        }
        self.state()
            .registration_ids
            .insert(addr.to_string(), bundle.device.registration_id);
        self.store_record(addr, OPEN).await
    }
}

// ============================================================
// Relay server
// ============================================================

/// One `send_messages` call.
#[derive(Debug, Clone)]
pub struct SentBatch {
    pub destination: String,
    pub timestamp: u64,
    pub messages: Vec<OutgoingDeviceMessage>,
}

impl SentBatch {
    pub fn device_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .messages
            .iter()
            .map(|m| m.destination_device_id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Everything the fake server records or serves. Tests arrange and inspect
/// it through [`FakeServer::state`].
#[derive(Default)]
pub struct ServerState {
    /// destination -> scripted outcomes of its next submissions
    pub send_scripts: HashMap<String, VecDeque<Result<(), (i64, Value)>>>,
    /// destination -> time each submission spends in flight
    pub send_delays: HashMap<String, Duration>,
    pub sends: Vec<SentBatch>,
    pub key_requests: Vec<(String, Option<u32>)>,
    pub directory: HashMap<String, KeysResponse>,
    /// addr -> status for every key lookup
    pub key_failures: HashMap<String, i64>,
    pub attachments: HashMap<String, Vec<u8>>,
    pub pages: VecDeque<IncomingMessages>,
    pub deleted: Vec<(String, u64)>,
    pub devices_error: Option<i64>,
    pub provisioning_error: Option<i64>,
    pub provisioned: Vec<(String, ProvisionEnvelope)>,
    pub key_count: u32,
    pub registered_keys: Vec<GeneratedKeys>,
    pub created: Vec<NewDeviceInfo>,
    pub added: Vec<(String, String)>,
    pub deleted_devices: Vec<u32>,
    pub push_registrations: Vec<String>,
}

#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    /// Publishes bundles for `device_ids` of `addr` under `identity_key`.
    pub fn publish_keys(&self, addr: &str, identity_key: &[u8], device_ids: &[u32]) {
        let devices = device_ids.iter().map(|id| device_keys(*id)).collect();
        self.state().directory.insert(
            addr.to_string(),
            KeysResponse {
                identity_key: identity_key.to_vec(),
                devices,
            },
        );
    }

    /// Queues outcomes for the next submissions to `destination`.
    pub fn script_sends(&self, destination: &str, outcomes: Vec<Result<(), (i64, Value)>>) {
        self.state()
            .send_scripts
            .entry(destination.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Keeps every submission to `destination` in flight for `delay`.
    pub fn delay_sends(&self, destination: &str, delay: Duration) {
        self.state()
            .send_delays
            .insert(destination.to_string(), delay);
    }

    pub fn sends_to(&self, destination: &str) -> Vec<SentBatch> {
        self.state()
            .sends
            .iter()
            .filter(|batch| batch.destination == destination)
            .cloned()
            .collect()
    }

    pub fn key_requests(&self) -> Vec<(String, Option<u32>)> {
        self.state().key_requests.clone()
    }

    pub fn queue_page(&self, messages: Vec<Envelope>, more: bool) {
        self.state()
            .pages
            .push_back(IncomingMessages { messages, more });
    }
}

/// Key material the fake server hands out for one device.
pub fn device_keys(device_id: u32) -> DeviceKeys {
    DeviceKeys {
        device_id,
        registration_id: 100 + device_id,
        signed_pre_key: SignedPreKey {
            key_id: 1,
            public_key: vec![device_id as u8; 32],
            signature: vec![0; 64],
        },
        pre_key: Some(PreKey {
            key_id: device_id,
            public_key: vec![device_id as u8; 32],
        }),
    }
}

fn status(code: i64) -> RelayError {
    RelayError::protocol(code, Value::Null)
}

#[async_trait]
impl RelayServer for FakeServer {
    async fn create_account(&self, info: &NewDeviceInfo) -> RelayResult<AccountCreated> {
        self.state().created.push(info.clone());
        Ok(AccountCreated {
            addr: OUR_ADDR.to_string(),
            device_id: OUR_DEVICE,
            server_url: None,
        })
    }

    async fn add_device(&self, code: &str, addr: &str, _info: &NewDeviceInfo) -> RelayResult<u32> {
        self.state()
            .added
            .push((code.to_string(), addr.to_string()));
        Ok(2)
    }

    async fn get_devices(&self) -> RelayResult<Vec<DeviceInfo>> {
        if let Some(code) = self.state().devices_error {
            return Err(status(code));
        }
        Ok(vec![DeviceInfo {
            id: OUR_DEVICE,
            name: Some("test".to_string()),
            last_seen: None,
            created: None,
        }])
    }

    async fn delete_device(&self, device_id: u32) -> RelayResult<()> {
        self.state().deleted_devices.push(device_id);
        Ok(())
    }

    async fn get_link_device_verification_code(&self) -> RelayResult<String> {
        Ok("123456".to_string())
    }

    async fn update_push_registration(&self, registration_id: &str) -> RelayResult<()> {
        self.state()
            .push_registrations
            .push(registration_id.to_string());
        Ok(())
    }

    async fn register_keys(&self, keys: &GeneratedKeys) -> RelayResult<()> {
        let mut state = self.state();
        state.key_count = keys.pre_keys.len() as u32;
        state.registered_keys.push(keys.clone());
        Ok(())
    }

    async fn get_my_key_count(&self) -> RelayResult<u32> {
        Ok(self.state().key_count)
    }

    async fn get_keys_for_addr(
        &self,
        addr: &str,
        device_id: Option<u32>,
    ) -> RelayResult<KeysResponse> {
        let mut state = self.state();
        state.key_requests.push((addr.to_string(), device_id));
        if let Some(code) = state.key_failures.get(addr) {
            return Err(status(*code));
        }
        let mut response = state.directory.get(addr).cloned().ok_or_else(|| status(404))?;
        if let Some(id) = device_id {
            response.devices.retain(|d| d.device_id == id);
            if response.devices.is_empty() {
                return Err(status(404));
            }
        }
        Ok(response)
    }

    async fn send_messages(
        &self,
        destination: &str,
        messages: &[OutgoingDeviceMessage],
        timestamp: u64,
    ) -> RelayResult<()> {
        let delay = self.state().send_delays.get(destination).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.sends.push(SentBatch {
            destination: destination.to_string(),
            timestamp,
            messages: messages.to_vec(),
        });
        let outcome = state
            .send_scripts
            .get_mut(destination)
            .and_then(|script| script.pop_front())
            .unwrap_or(Ok(()));
        outcome.map_err(|(code, body)| RelayError::protocol(code, body))
    }

    async fn get_messages(&self) -> RelayResult<IncomingMessages> {
        Ok(self.state().pages.pop_front().unwrap_or_default())
    }

    async fn delete_message(&self, source: &str, timestamp: u64) -> RelayResult<()> {
        self.state()
            .deleted
            .push((source.to_string(), timestamp));
        Ok(())
    }

    async fn get_attachment(&self, id: &str) -> RelayResult<Vec<u8>> {
        self.state()
            .attachments
            .get(id)
            .cloned()
            .ok_or_else(|| status(404))
    }

    async fn put_attachment(&self, data: &[u8]) -> RelayResult<String> {
        let mut state = self.state();
        let id = format!("att-{}", state.attachments.len() + 1);
        state.attachments.insert(id.clone(), data.to_vec());
        Ok(id)
    }

    async fn put_provisioning(&self, uuid: &str, envelope: &ProvisionEnvelope) -> RelayResult<()> {
        let mut state = self.state();
        if let Some(code) = state.provisioning_error {
            return Err(status(code));
        }
        state.provisioned.push((uuid.to_string(), envelope.clone()));
        Ok(())
    }
}
