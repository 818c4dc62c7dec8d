// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Envelope and Content Types
//!
//! Wire shapes exchanged with the relay server and, once decrypted, with
//! peers. Byte fields travel as base64 inside JSON.

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::address::Address;
use crate::error::{RelayError, RelayResult};

/// Envelope routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum EnvelopeType {
    /// Message under an established session.
    Ciphertext,
    /// Message that may establish a new session from a prekey bundle.
    PrekeyBundle,
    /// Delivery receipt, no payload.
    Receipt,
    /// Anything this client does not understand.
    Other(u8),
}

impl From<u8> for EnvelopeType {
    fn from(value: u8) -> Self {
        match value {
            1 => EnvelopeType::Ciphertext,
            3 => EnvelopeType::PrekeyBundle,
            5 => EnvelopeType::Receipt,
            other => EnvelopeType::Other(other),
        }
    }
}

impl From<EnvelopeType> for u8 {
    fn from(value: EnvelopeType) -> Self {
        match value {
            EnvelopeType::Ciphertext => 1,
            EnvelopeType::PrekeyBundle => 3,
            EnvelopeType::Receipt => 5,
            EnvelopeType::Other(other) => other,
        }
    }
}

/// Inbound wire unit.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,
    pub source: String,
    pub source_device: u32,
    pub timestamp: u64,
    #[serde_as(as = "Option<Base64>")]
    #[serde(alias = "message", skip_serializing_if = "Option::is_none")]
    pub legacy_message: Option<Vec<u8>>,
    #[serde_as(as = "Option<Base64>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
}

impl Envelope {
    /// Address of the sending device.
    pub fn source_address(&self) -> Address {
        Address::device(self.source.clone(), self.source_device)
    }

    pub fn encode(&self) -> RelayResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> RelayResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Reference to an uploaded, encrypted attachment.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPointer {
    pub id: String,
    #[serde_as(as = "Base64")]
    pub key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// User-visible message payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPointer>,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub expire_timer: u32,
    /// Legacy group context. Rejected on receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<serde_json::Value>,
}

impl DataMessage {
    /// Flag bit asking the peer to close its session with us.
    pub const END_SESSION: u32 = 1;

    pub fn is_end_session(&self) -> bool {
        self.flags & Self::END_SESSION != 0
    }

    pub fn decode(bytes: &[u8]) -> RelayResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Copy of a message we sent from another of our devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentTranscript {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub timestamp: u64,
    pub message: DataMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_start_timestamp: Option<u64>,
}

/// One message marked read on another of our devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadEntry {
    pub sender: String,
    pub timestamp: u64,
}

/// Multi-device sync payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<SentTranscript>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<ReadEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contacts: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<serde_json::Value>,
}

/// What a sync message asks us to do. The first populated field wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind<'a> {
    Sent(&'a SentTranscript),
    Read(&'a [ReadEntry]),
    /// A variant that is no longer supported; carries its name.
    Deprecated(&'static str),
    Empty,
}

impl SyncMessage {
    pub fn kind(&self) -> SyncKind<'_> {
        if let Some(sent) = &self.sent {
            SyncKind::Sent(sent)
        } else if !self.read.is_empty() {
            SyncKind::Read(&self.read)
        } else if self.contacts.is_some() {
            SyncKind::Deprecated("contacts")
        } else if self.groups.is_some() {
            SyncKind::Deprecated("groups")
        } else if self.blocked.is_some() {
            SyncKind::Deprecated("blocked")
        } else if self.request.is_some() {
            SyncKind::Deprecated("request")
        } else {
            SyncKind::Empty
        }
    }
}

/// Decrypted envelope payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_message: Option<DataMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_message: Option<SyncMessage>,
}

impl Content {
    pub fn data(message: DataMessage) -> Self {
        Content {
            data_message: Some(message),
            sync_message: None,
        }
    }

    pub fn sync(message: SyncMessage) -> Self {
        Content {
            data_message: None,
            sync_message: Some(message),
        }
    }

    pub fn encode(&self) -> RelayResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> RelayResult<Self> {
        let content: Content = serde_json::from_slice(bytes)?;
        if content.data_message.is_none() && content.sync_message.is_none() {
            return Err(RelayError::ProtocolViolation(
                "content with no data or sync message".to_string(),
            ));
        }
        Ok(content)
    }
}

/// Ciphertext for one destination device, as submitted to the server.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingDeviceMessage {
    #[serde(rename = "type")]
    pub message_type: u8,
    pub destination_device_id: u32,
    pub destination_registration_id: u32,
    #[serde_as(as = "Base64")]
    pub content: Vec<u8>,
    pub timestamp: u64,
}
