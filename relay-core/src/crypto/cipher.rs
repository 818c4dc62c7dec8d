//! CBC, HMAC and HKDF primitives.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ring::{hkdf, hmac};
use subtle::ConstantTimeEq;

use super::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-256-CBC with PKCS#7 padding.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: 32,
            actual: key.len(),
        }
    })?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Inverse of [`aes_cbc_encrypt`].
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: 32,
            actual: key.len(),
        }
    })?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let mut ctx = hmac::Context::with_key(&key);
    for part in parts {
        ctx.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(ctx.sign().as_ref());
    out
}

/// Checks a possibly truncated HMAC-SHA256 tag in constant time.
pub fn verify_mac(key: &[u8], data: &[u8], mac: &[u8]) -> Result<(), CryptoError> {
    let expected = hmac_sha256(key, &[data]);
    if mac.is_empty() || mac.len() > expected.len() {
        return Err(CryptoError::BadMac);
    }
    if expected[..mac.len()].ct_eq(mac).into() {
        Ok(())
    } else {
        Err(CryptoError::BadMac)
    }
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-SHA256 producing a `(cipher_key, mac_key)` pair.
pub fn derive_secrets(
    input: &[u8],
    salt: &[u8],
    info: &[u8],
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(input);
    let info = [info];
    let okm = prk.expand(&info, OkmLen(64)).map_err(|_| CryptoError::Kdf)?;
    let mut out = [0u8; 64];
    okm.fill(&mut out).map_err(|_| CryptoError::Kdf)?;
    let mut cipher_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    cipher_key.copy_from_slice(&out[..32]);
    mac_key.copy_from_slice(&out[32..]);
    Ok((cipher_key, mac_key))
}
