// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Server API
//!
//! The HTTP surface of the relay server, as consumed by the receiver, sender
//! and account manager. [`HttpRelayServer`] talks to a real server; tests
//! substitute their own [`RelayServer`] implementation.
//!
//! Non-2xx responses surface as [`RelayError::Protocol`](crate::RelayError)
//! carrying the decoded response body, so callers can read reconciliation
//! details such as [`MismatchedDevices`] out of it.

mod http;

pub use http::HttpRelayServer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::SignalingKey;
use crate::error::RelayResult;
use crate::keys::{GeneratedKeys, KeysResponse};
use crate::message::{Envelope, OutgoingDeviceMessage};
use crate::provisioning::ProvisionEnvelope;

/// Credentials and keys a device registers with.
#[derive(Debug, Clone)]
pub struct NewDeviceInfo {
    pub name: String,
    pub registration_id: u32,
    pub password: String,
    pub signaling_key: SignalingKey,
}

/// Server answer to account creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCreated {
    #[serde(rename = "userId")]
    pub addr: String,
    pub device_id: u32,
    #[serde(default)]
    pub server_url: Option<String>,
}

/// One registered device of our account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_seen: Option<u64>,
    #[serde(default)]
    pub created: Option<u64>,
}

/// Body of a 409 response to a message submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchedDevices {
    #[serde(default)]
    pub missing_devices: Vec<u32>,
    #[serde(default)]
    pub extra_devices: Vec<u32>,
}

/// Body of a 410 response to a message submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleDevices {
    #[serde(default)]
    pub stale_devices: Vec<u32>,
}

/// One page of queued messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessages {
    pub messages: Vec<Envelope>,
    #[serde(default)]
    pub more: bool,
}

/// Relay server operations.
#[async_trait]
pub trait RelayServer: Send + Sync {
    // === Accounts and devices ===

    /// Creates a new account with this as its first device.
    async fn create_account(&self, info: &NewDeviceInfo) -> RelayResult<AccountCreated>;

    /// Adds a device to `addr` using a provisioning code. Returns the new device id.
    async fn add_device(&self, code: &str, addr: &str, info: &NewDeviceInfo) -> RelayResult<u32>;

    async fn get_devices(&self) -> RelayResult<Vec<DeviceInfo>>;

    async fn delete_device(&self, device_id: u32) -> RelayResult<()>;

    /// One-time code a new device presents when it is added.
    async fn get_link_device_verification_code(&self) -> RelayResult<String>;

    /// Registers a push token for wakeups.
    async fn update_push_registration(&self, registration_id: &str) -> RelayResult<()>;

    // === Keys ===

    /// Replaces our published prekeys.
    async fn register_keys(&self, keys: &GeneratedKeys) -> RelayResult<()>;

    /// Number of our one-time prekeys the server still holds.
    async fn get_my_key_count(&self) -> RelayResult<u32>;

    /// Key bundles of one device, or of all devices when `device_id` is `None`.
    async fn get_keys_for_addr(&self, addr: &str, device_id: Option<u32>)
        -> RelayResult<KeysResponse>;

    // === Messages ===

    /// Submits one ciphertext per destination device.
    async fn send_messages(
        &self,
        destination: &str,
        messages: &[OutgoingDeviceMessage],
        timestamp: u64,
    ) -> RelayResult<()>;

    /// Pops queued messages (polling mode).
    async fn get_messages(&self) -> RelayResult<IncomingMessages>;

    async fn delete_message(&self, source: &str, timestamp: u64) -> RelayResult<()>;

    // === Attachments ===

    /// Downloads an encrypted attachment.
    async fn get_attachment(&self, id: &str) -> RelayResult<Vec<u8>>;

    /// Uploads an encrypted attachment and returns its id.
    async fn put_attachment(&self, data: &[u8]) -> RelayResult<String>;

    // === Provisioning ===

    /// Relays a provisioning envelope to the device waiting on `uuid`.
    async fn put_provisioning(&self, uuid: &str, envelope: &ProvisionEnvelope) -> RelayResult<()>;
}
