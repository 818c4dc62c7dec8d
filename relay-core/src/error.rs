// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Error Types
//!
//! Single error type for the relay client. Per-envelope and per-device
//! failures are carried as values of this type into events and delivery logs;
//! only auth failures and framing errors abort an operation outright.

use thiserror::Error;

use crate::address::AddressError;
use crate::crypto::CryptoError;
use crate::network::NetworkError;
use crate::padding::PaddingError;
use crate::provisioning::ProvisioningError;
use crate::session::SessionError;
use crate::storage::StoreError;

/// Result alias used throughout the crate.
pub type RelayResult<T> = Result<T, RelayError>;

/// Unified error type for relay operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Transport or connectivity failure. Generally retryable by the caller.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Non-2xx response from the server.
    #[error("protocol error ({code}): {message}")]
    Protocol {
        /// HTTP status, or -1 when the server returned something outside 100..=999.
        code: i32,
        message: String,
        /// Decoded response body, `Null` when empty.
        response: serde_json::Value,
    },

    /// The server does not know this address.
    #[error("address is not registered: {addr}")]
    UnregisteredUser { addr: String },

    /// An inbound message was signed by an identity we do not trust yet.
    #[error("incoming identity key changed for {addr}")]
    IncomingIdentityKey { addr: String, identity_key: Vec<u8> },

    /// An outbound session refused to encrypt under a changed identity.
    #[error("outgoing identity key changed for {addr}")]
    OutgoingIdentityKey { addr: String, identity_key: Vec<u8> },

    #[error("deprecated feature: {0}")]
    DeprecatedFeature(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unknown envelope type: {0}")]
    UnknownEnvelopeType(u8),

    #[error("invalid padding: {0}")]
    InvalidPadding(#[from] PaddingError),

    #[error("provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Device-list reconciliation failed again after its one retry.
    #[error("retry limit reached: {0}")]
    RetryLimit(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Decode(err.to_string())
    }
}

/// Human readable text for the status codes the relay server documents.
pub fn http_status_message(code: i32) -> String {
    match code {
        401 => "Invalid authentication or invalidated registration".to_string(),
        403 => "Invalid code".to_string(),
        404 => "Address is not registered".to_string(),
        413 => "Server rate limit exceeded".to_string(),
        417 => "Address already registered".to_string(),
        other => format!("Status code: {other}"),
    }
}

impl RelayError {
    /// Builds a protocol error, normalising codes outside `100..=999` to -1.
    pub fn protocol(status: i64, response: serde_json::Value) -> Self {
        let code = if (100..=999).contains(&status) {
            status as i32
        } else {
            -1
        };
        RelayError::Protocol {
            code,
            message: http_status_message(code),
            response,
        }
    }

    /// Status code of a protocol error, if this is one.
    pub fn status(&self) -> Option<i32> {
        match self {
            RelayError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true for 401/403, which abort the whole operation.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, RelayError::Network(_))
    }

    /// Identity key carried by either identity-change variant.
    pub fn identity_key(&self) -> Option<(&str, &[u8])> {
        match self {
            RelayError::IncomingIdentityKey { addr, identity_key }
            | RelayError::OutgoingIdentityKey { addr, identity_key } => {
                Some((addr.as_str(), identity_key.as_slice()))
            }
            _ => None,
        }
    }
}
