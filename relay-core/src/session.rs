// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Cipher Interface
//!
//! The per-device double-ratchet session cipher is an external collaborator.
//! This module defines the narrow surface the relay client drives.

use async_trait::async_trait;
use thiserror::Error;

use crate::address::Address;
use crate::keys::PreKeyBundle;

/// Session cipher errors the relay client reacts to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Replayed or duplicate message counter.
    #[error("message counter error: {0}")]
    MessageCounter(String),

    /// The peer's identity key differs from the trusted one.
    #[error("untrusted identity key for {addr}")]
    UntrustedIdentity { addr: String, identity_key: Vec<u8> },

    #[error("no session for {0}")]
    NoSession(String),

    #[error("prekey error: {0}")]
    PreKey(String),

    #[error("session failure: {0}")]
    Failed(String),
}

/// Ciphertext produced for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextMessage {
    /// Envelope type the recipient should decrypt it as.
    pub message_type: u8,
    pub body: Vec<u8>,
    pub registration_id: u32,
}

/// Double-ratchet operations, keyed by device address.
#[async_trait]
pub trait SessionCipher: Send + Sync {
    async fn encrypt(&self, addr: &Address, plaintext: &[u8])
        -> Result<CiphertextMessage, SessionError>;

    async fn decrypt_whisper(&self, addr: &Address, ciphertext: &[u8])
        -> Result<Vec<u8>, SessionError>;

    /// Decrypts a message that may establish a new session.
    async fn decrypt_prekey_whisper(
        &self,
        addr: &Address,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError>;

    async fn has_open_session(&self, addr: &Address) -> Result<bool, SessionError>;

    async fn close_open_session(&self, addr: &Address) -> Result<(), SessionError>;

    /// Builds an outgoing session from a fetched prekey bundle.
    async fn init_outgoing(&self, addr: &Address, bundle: &PreKeyBundle)
        -> Result<(), SessionError>;
}
