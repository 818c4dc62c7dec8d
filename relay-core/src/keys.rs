// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Key Material
//!
//! Identity keys (Ed25519, so signed prekeys can be attested with `ring`),
//! X25519 prekeys, and the wire shapes used to publish and fetch them.

use ring::signature::{self, Ed25519KeyPair, KeyPair as _};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{random_array, CryptoError};

/// Fixed id of the optional last-resort prekey.
pub const LAST_RESORT_KEY_ID: u32 = 0xdead_beef & 0x7fff_ffff;

/// Long-term identity key pair. The private half is the 32-byte Ed25519 seed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    private_key: [u8; 32],
    #[zeroize(skip)]
    public_key: [u8; 32],
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("private_key", &"[REDACTED]")
            .field("public_key", &hex::encode(self.public_key))
            .finish()
    }
}

impl IdentityKeyPair {
    /// Generates a new random identity.
    pub fn generate() -> Result<Self, CryptoError> {
        Self::from_private_key(&random_array::<32>()?)
    }

    /// Rebuilds the pair from its private half.
    pub fn from_private_key(private_key: &[u8]) -> Result<Self, CryptoError> {
        let seed: [u8; 32] = private_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: private_key.len(),
            })?;
        let pair = Ed25519KeyPair::from_seed_unchecked(&seed).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: seed.len(),
            }
        })?;
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(pair.public_key().as_ref());
        Ok(IdentityKeyPair {
            private_key: seed,
            public_key,
        })
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }

    /// Signs `message` with the identity key.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64], CryptoError> {
        let pair = Ed25519KeyPair::from_seed_unchecked(&self.private_key).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 32,
            }
        })?;
        let mut out = [0u8; 64];
        out.copy_from_slice(pair.sign(message).as_ref());
        Ok(out)
    }

    /// Verifies a signature made by the holder of `public_key`.
    pub fn verify(public_key: &[u8], message: &[u8], sig: &[u8]) -> bool {
        signature::UnparsedPublicKey::new(&signature::ED25519, public_key)
            .verify(message, sig)
            .is_ok()
    }

    /// Short hex fingerprint for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.public_key[..8])
    }
}

/// X25519 key pair backing a prekey.
#[serde_as]
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyPair {
    #[serde_as(as = "Base64")]
    #[zeroize(skip)]
    pub public_key: [u8; 32],
    #[serde_as(as = "Base64")]
    pub private_key: [u8; 32],
}

impl std::fmt::Debug for PreKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl PreKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let private_key = random_array::<32>()?;
        let secret = StaticSecret::from(private_key);
        Ok(PreKeyPair {
            public_key: X25519Public::from(&secret).to_bytes(),
            private_key,
        })
    }
}

/// Public half of a one-time prekey, as published to the server.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKey {
    pub key_id: u32,
    #[serde_as(as = "Base64")]
    pub public_key: Vec<u8>,
}

/// Public half of a signed prekey and its identity signature.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKey {
    pub key_id: u32,
    #[serde_as(as = "Base64")]
    pub public_key: Vec<u8>,
    #[serde_as(as = "Base64")]
    pub signature: Vec<u8>,
}

/// Output of one key generation round, in the server's registration shape.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedKeys {
    #[serde_as(as = "Base64")]
    pub identity_key: Vec<u8>,
    pub signed_pre_key: SignedPreKey,
    pub pre_keys: Vec<PreKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resort_key: Option<PreKey>,
}

/// Key material the server hands out for one remote device.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeys {
    pub device_id: u32,
    #[serde(default)]
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKey,
    #[serde(default)]
    pub pre_key: Option<PreKey>,
}

/// Response to a key lookup for `addr[/device]`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysResponse {
    #[serde_as(as = "Base64")]
    pub identity_key: Vec<u8>,
    pub devices: Vec<DeviceKeys>,
}

/// Everything needed to open an outgoing session with one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub identity_key: Vec<u8>,
    pub device: DeviceKeys,
}

impl KeysResponse {
    /// Splits the response into one bundle per device.
    pub fn into_bundles(self) -> Vec<PreKeyBundle> {
        let identity_key = self.identity_key;
        self.devices
            .into_iter()
            .map(|device| PreKeyBundle {
                identity_key: identity_key.clone(),
                device,
            })
            .collect()
    }
}

/// Random registration id in `1..=0x3fff`.
pub fn generate_registration_id() -> Result<u32, CryptoError> {
    let raw = u16::from_be_bytes(random_array::<2>()?);
    Ok(u32::from(raw % 0x3fff) + 1)
}

/// Generates the one-time prekey `key_id`.
pub fn generate_pre_key(key_id: u32) -> Result<(PreKey, PreKeyPair), CryptoError> {
    let pair = PreKeyPair::generate()?;
    let public = PreKey {
        key_id,
        public_key: pair.public_key.to_vec(),
    };
    Ok((public, pair))
}

/// Generates signed prekey `key_id`, attested by `identity`.
pub fn generate_signed_pre_key(
    identity: &IdentityKeyPair,
    key_id: u32,
) -> Result<(SignedPreKey, PreKeyPair), CryptoError> {
    let pair = PreKeyPair::generate()?;
    let signature = identity.sign(&pair.public_key)?;
    let public = SignedPreKey {
        key_id,
        public_key: pair.public_key.to_vec(),
        signature: signature.to_vec(),
    };
    Ok((public, pair))
}
