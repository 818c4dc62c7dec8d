//! Attachment Cipher
//!
//! Attachments are uploaded as `iv(16) | AES-256-CBC(ciphertext) | mac(32)`
//! under a 64-byte key: 32 bytes AES, 32 bytes HMAC. The MAC covers
//! `iv | ciphertext`.

use super::cipher::{aes_cbc_decrypt, aes_cbc_encrypt, hmac_sha256, verify_mac};
use super::CryptoError;

/// Attachment keys are an AES key followed by a MAC key.
pub const ATTACHMENT_KEY_LEN: usize = 64;

const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;

fn split_key(key: &[u8]) -> Result<(&[u8], &[u8]), CryptoError> {
    if key.len() != ATTACHMENT_KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: ATTACHMENT_KEY_LEN,
            actual: key.len(),
        });
    }
    Ok(key.split_at(32))
}

/// Encrypts attachment bytes for upload.
pub fn encrypt_attachment(
    plaintext: &[u8],
    key: &[u8],
    iv: &[u8; 16],
) -> Result<Vec<u8>, CryptoError> {
    let (aes_key, mac_key) = split_key(key)?;
    let ciphertext = aes_cbc_encrypt(aes_key, iv, plaintext)?;
    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len() + MAC_LEN);
    out.extend_from_slice(iv);
    out.extend_from_slice(&ciphertext);
    let mac = hmac_sha256(mac_key, &[&out]);
    out.extend_from_slice(&mac);
    Ok(out)
}

/// Verifies and decrypts a downloaded attachment.
pub fn decrypt_attachment(data: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (aes_key, mac_key) = split_key(key)?;
    if data.len() < IV_LEN + MAC_LEN {
        return Err(CryptoError::Truncated);
    }
    let (signed, mac) = data.split_at(data.len() - MAC_LEN);
    verify_mac(mac_key, signed, mac)?;
    let (iv, ciphertext) = signed.split_at(IV_LEN);
    aes_cbc_decrypt(aes_key, iv, ciphertext)
}
