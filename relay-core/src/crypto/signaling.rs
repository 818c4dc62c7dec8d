//! Signaling Key
//!
//! The server wraps every envelope it pushes over the message socket with
//! the device's signaling key: `version(1)=1 | iv(16) | ciphertext | mac(10)`,
//! AES-256-CBC under the first 32 key bytes and truncated HMAC-SHA256 under
//! the remaining 20.

use zeroize::{Zeroize, ZeroizeOnDrop};

use super::cipher::{aes_cbc_decrypt, aes_cbc_encrypt, hmac_sha256, verify_mac};
use super::{random_array, CryptoError};

/// Signaling keys are 32 bytes AES followed by 20 bytes MAC.
pub const SIGNALING_KEY_LEN: usize = 52;

const VERSION: u8 = 1;
const IV_LEN: usize = 16;
const MAC_LEN: usize = 10;

/// Per-device key shared with the server at registration.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SignalingKey([u8; SIGNALING_KEY_LEN]);

impl std::fmt::Debug for SignalingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SignalingKey").field(&"[REDACTED]").finish()
    }
}

impl SignalingKey {
    /// Generates a fresh random key.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(SignalingKey(random_array()?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; SIGNALING_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: SIGNALING_KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(SignalingKey(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn aes_key(&self) -> &[u8] {
        &self.0[..32]
    }

    fn mac_key(&self) -> &[u8] {
        &self.0[32..]
    }

    /// Unwraps a socket message body.
    pub fn decrypt(&self, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if body.len() < 1 + IV_LEN + MAC_LEN {
            return Err(CryptoError::Truncated);
        }
        if body[0] != VERSION {
            return Err(CryptoError::BadVersion(body[0]));
        }
        let (signed, mac) = body.split_at(body.len() - MAC_LEN);
        verify_mac(self.mac_key(), signed, mac)?;
        let iv = &signed[1..1 + IV_LEN];
        let ciphertext = &signed[1 + IV_LEN..];
        aes_cbc_decrypt(self.aes_key(), iv, ciphertext)
    }

    /// Wraps `plaintext` the way the server does.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let iv: [u8; IV_LEN] = random_array()?;
        let ciphertext = aes_cbc_encrypt(self.aes_key(), &iv, plaintext)?;
        let mut out = Vec::with_capacity(1 + IV_LEN + ciphertext.len() + MAC_LEN);
        out.push(VERSION);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        let mac = hmac_sha256(self.mac_key(), &[&out]);
        out.extend_from_slice(&mac[..MAC_LEN]);
        Ok(out)
    }
}
