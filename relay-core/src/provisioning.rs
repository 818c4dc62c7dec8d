// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Provisioning Cipher
//!
//! Transfers identity material from a primary device to a newly linked one.
//! The new device shows an ephemeral X25519 public key (as a URL / QR code);
//! the primary encrypts a [`ProvisionMessage`] to it.
//!
//! Key schedule: `ECDH(ephemeral, static)` → HKDF-SHA256 with a 32-byte zero
//! salt and info `"TextSecure Provisioning Message"` → 32-byte AES key and
//! 32-byte MAC key. Body layout: `version(1)=1 | iv(16) | ciphertext | mac(32)`,
//! MAC over everything before it. The sender's ephemeral public key travels
//! beside the body in the [`ProvisionEnvelope`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{
    aes_cbc_decrypt, aes_cbc_encrypt, derive_secrets, hmac_sha256, random_array, verify_mac,
    CryptoError,
};
use crate::keys::IdentityKeyPair;

const VERSION: u8 = 1;
const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;
const SECRETS_INFO: &[u8] = b"TextSecure Provisioning Message";

/// Provisioning errors.
#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("bad provisioning version: {0}")]
    BadVersion(u8),

    #[error("provisioning message too short")]
    Truncated,

    #[error("provisioning MAC verification failed")]
    BadMac,

    #[error("invalid public key length: {0}")]
    InvalidPublicKey(usize),

    #[error("malformed provisioning message: {0}")]
    Malformed(String),

    #[error("crypto failure: {0}")]
    Crypto(CryptoError),
}

impl From<CryptoError> for ProvisioningError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::BadMac => ProvisioningError::BadMac,
            CryptoError::Truncated => ProvisioningError::Truncated,
            other => ProvisioningError::Crypto(other),
        }
    }
}

/// Encrypted provisioning payload plus the sender's ephemeral public key.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionEnvelope {
    #[serde_as(as = "Base64")]
    pub public_key: Vec<u8>,
    #[serde_as(as = "Base64")]
    pub body: Vec<u8>,
}

/// Plaintext carried inside a [`ProvisionEnvelope`].
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionMessage {
    #[serde_as(as = "Base64")]
    pub identity_key_private: Vec<u8>,
    pub addr: String,
    pub provisioning_code: String,
    pub user_agent: String,
}

impl std::fmt::Debug for ProvisionMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionMessage")
            .field("identity_key_private", &"[REDACTED]")
            .field("addr", &self.addr)
            .field("provisioning_code", &self.provisioning_code)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Decrypted provisioning result with the identity rebuilt from its private key.
#[derive(Debug, Clone)]
pub struct ProvisionedIdentity {
    pub identity_key_pair: IdentityKeyPair,
    pub addr: String,
    pub provisioning_code: String,
    pub user_agent: String,
}

/// Server-assigned channel id for a provisioning socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningUuid {
    pub uuid: String,
}

/// Ephemeral X25519 key pair of the device awaiting provisioning.
pub struct ProvisioningCipher {
    secret: StaticSecret,
    public: [u8; 32],
}

impl std::fmt::Debug for ProvisioningCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningCipher")
            .field("public", &hex::encode(self.public))
            .finish()
    }
}

fn parse_public(bytes: &[u8]) -> Result<PublicKey, ProvisioningError> {
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ProvisioningError::InvalidPublicKey(bytes.len()))?;
    Ok(PublicKey::from(raw))
}

impl ProvisioningCipher {
    /// Generates the ephemeral key pair shown to the primary device.
    pub fn new() -> Result<Self, ProvisioningError> {
        let secret = StaticSecret::from(random_array::<32>()?);
        let public = PublicKey::from(&secret).to_bytes();
        Ok(ProvisioningCipher { secret, public })
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Base64 public key, as embedded in the provisioning URL.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public)
    }

    /// Encrypts raw bytes to `their_public_key` under a fresh ephemeral key.
    pub fn seal(
        their_public_key: &[u8],
        plaintext: &[u8],
    ) -> Result<ProvisionEnvelope, ProvisioningError> {
        let theirs = parse_public(their_public_key)?;
        let ours = StaticSecret::from(random_array::<32>()?);
        let shared = ours.diffie_hellman(&theirs);
        let (cipher_key, mac_key) = derive_secrets(shared.as_bytes(), &[0u8; 32], SECRETS_INFO)?;

        let iv: [u8; IV_LEN] = random_array()?;
        let ciphertext = aes_cbc_encrypt(&cipher_key, &iv, plaintext)?;
        let mut body = Vec::with_capacity(1 + IV_LEN + ciphertext.len() + MAC_LEN);
        body.push(VERSION);
        body.extend_from_slice(&iv);
        body.extend_from_slice(&ciphertext);
        let mac = hmac_sha256(&mac_key, &[&body]);
        body.extend_from_slice(&mac);

        Ok(ProvisionEnvelope {
            public_key: PublicKey::from(&ours).to_bytes().to_vec(),
            body,
        })
    }

    /// Reverses [`ProvisioningCipher::seal`]. The MAC is checked before any
    /// decryption; no plaintext is returned on failure.
    pub fn open(&self, envelope: &ProvisionEnvelope) -> Result<Vec<u8>, ProvisioningError> {
        let body = &envelope.body;
        if body.is_empty() {
            return Err(ProvisioningError::Truncated);
        }
        if body[0] != VERSION {
            return Err(ProvisioningError::BadVersion(body[0]));
        }
        if body.len() < 1 + IV_LEN + MAC_LEN {
            return Err(ProvisioningError::Truncated);
        }
        let theirs = parse_public(&envelope.public_key)?;
        let shared = self.secret.diffie_hellman(&theirs);
        let (cipher_key, mac_key) = derive_secrets(shared.as_bytes(), &[0u8; 32], SECRETS_INFO)?;

        let (signed, mac) = body.split_at(body.len() - MAC_LEN);
        verify_mac(&mac_key, signed, mac)?;
        let iv = &signed[1..1 + IV_LEN];
        let ciphertext = &signed[1 + IV_LEN..];
        Ok(aes_cbc_decrypt(&cipher_key, iv, ciphertext)?)
    }

    /// Encrypts a provisioning message for the device showing `their_public_key`.
    pub fn encrypt(
        their_public_key: &[u8],
        message: &ProvisionMessage,
    ) -> Result<ProvisionEnvelope, ProvisioningError> {
        let plaintext = serde_json::to_vec(message)
            .map_err(|e| ProvisioningError::Malformed(e.to_string()))?;
        Self::seal(their_public_key, &plaintext)
    }

    /// Decrypts and decodes a provisioning message.
    pub fn decrypt(
        &self,
        envelope: &ProvisionEnvelope,
    ) -> Result<ProvisionedIdentity, ProvisioningError> {
        let plaintext = self.open(envelope)?;
        let message: ProvisionMessage = serde_json::from_slice(&plaintext)
            .map_err(|e| ProvisioningError::Malformed(e.to_string()))?;
        let identity_key_pair = IdentityKeyPair::from_private_key(&message.identity_key_private)?;
        Ok(ProvisionedIdentity {
            identity_key_pair,
            addr: message.addr.clone(),
            provisioning_code: message.provisioning_code.clone(),
            user_agent: message.user_agent.clone(),
        })
    }
}

/// `scheme:/?uuid=<uuid>&pub_key=<base64>` link rendered for the primary device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningUrl {
    pub scheme: String,
    pub uuid: String,
    pub public_key: String,
}

impl ProvisioningUrl {
    pub fn new(scheme: &str, uuid: &str, public_key_base64: &str) -> Self {
        ProvisioningUrl {
            scheme: scheme.to_string(),
            uuid: uuid.to_string(),
            public_key: public_key_base64.to_string(),
        }
    }

    /// Parses a link produced by [`ProvisioningUrl::to_string`].
    pub fn parse(link: &str) -> Result<Self, ProvisioningError> {
        let parsed =
            url::Url::parse(link).map_err(|e| ProvisioningError::Malformed(e.to_string()))?;
        let mut uuid = None;
        let mut public_key = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "uuid" => uuid = Some(value.into_owned()),
                "pub_key" => public_key = Some(value.into_owned()),
                _ => {}
            }
        }
        match (uuid, public_key) {
            (Some(uuid), Some(public_key)) => Ok(ProvisioningUrl {
                scheme: parsed.scheme().to_string(),
                uuid,
                public_key,
            }),
            _ => Err(ProvisioningError::Malformed(
                "missing uuid or pub_key".to_string(),
            )),
        }
    }

    /// Decoded ephemeral public key.
    pub fn public_key_bytes(&self) -> Result<Vec<u8>, ProvisioningError> {
        BASE64
            .decode(&self.public_key)
            .map_err(|e| ProvisioningError::Malformed(e.to_string()))
    }

    /// Renders the link as a terminal QR code.
    pub fn to_qr_image_string(&self) -> Result<String, ProvisioningError> {
        use qrcode::QrCode;

        let code = QrCode::new(self.to_string())
            .map_err(|e| ProvisioningError::Malformed(e.to_string()))?;
        Ok(code
            .render()
            .light_color(' ')
            .dark_color('█')
            .quiet_zone(false)
            .build())
    }
}

impl std::fmt::Display for ProvisioningUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("uuid", &self.uuid)
            .append_pair("pub_key", &self.public_key)
            .finish();
        write!(f, "{}:/?{}", self.scheme, query)
    }
}
