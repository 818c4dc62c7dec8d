// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Symmetric Crypto Helpers
//!
//! AES-256-CBC, HMAC-SHA256 and HKDF-SHA256 building blocks shared by the
//! provisioning, signaling and attachment ciphers. HMAC, HKDF and randomness
//! come from `ring`; CBC mode from the RustCrypto `aes`/`cbc` crates.

pub mod attachment;
pub mod cipher;
pub mod signaling;

use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

pub use attachment::{decrypt_attachment, encrypt_attachment, ATTACHMENT_KEY_LEN};
pub use cipher::{aes_cbc_decrypt, aes_cbc_encrypt, derive_secrets, hmac_sha256, verify_mac};
pub use signaling::{SignalingKey, SIGNALING_KEY_LEN};

/// Symmetric crypto errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("ciphertext too short")]
    Truncated,

    #[error("bad version byte: {0}")]
    BadVersion(u8),

    #[error("MAC verification failed")]
    BadMac,

    #[error("decryption failed")]
    Decrypt,

    #[error("random number generator failure")]
    Rng,

    #[error("key derivation failed")]
    Kdf,
}

/// Fills a fresh array from the system RNG.
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    SystemRandom::new()
        .fill(&mut out)
        .map_err(|_| CryptoError::Rng)?;
    Ok(out)
}

/// Returns `len` random bytes.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut out)
        .map_err(|_| CryptoError::Rng)?;
    Ok(out)
}
