//! AES-256-GCM sealing of application payloads
//!
//! Each call draws a fresh random 96-bit IV; IVs are never derived or
//! counted, so reuse under one key is only possible by RNG collision.
//! Both ciphertext (with the 16-byte tag appended) and IV leave this module
//! as standard, padded base64 so they can be embedded in JSON frames as-is.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use scratchpad_core::{ScratchpadError, ScratchpadResult};

use crate::keys::SymmetricKey;
use crate::{IV_SIZE, TAG_SIZE};

/// Output of [`encrypt`]: transport-safe ciphertext and IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub ciphertext: String,
    pub iv: String,
}

/// Encrypt `plaintext` under `key` with a fresh random IV.
pub fn encrypt(plaintext: &[u8], key: &SymmetricKey) -> ScratchpadResult<SealedPayload> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| ScratchpadError::Encryption(format!("cipher init failed: {e}")))?;

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| ScratchpadError::Encryption(format!("encryption failed: {e}")))?;

    Ok(SealedPayload {
        ciphertext: STANDARD.encode(ciphertext),
        iv: STANDARD.encode(iv),
    })
}

/// Authenticated decryption. Any failure is a `Decryption` error; corrupted
/// plaintext is never returned.
pub fn decrypt(ciphertext: &str, key: &SymmetricKey, iv: &str) -> ScratchpadResult<Vec<u8>> {
    let iv = STANDARD
        .decode(iv)
        .map_err(|e| ScratchpadError::Decryption(format!("iv is not base64: {e}")))?;
    if iv.len() != IV_SIZE {
        return Err(ScratchpadError::Decryption(format!(
            "iv has {} bytes (expected {IV_SIZE})",
            iv.len()
        )));
    }

    let ciphertext = STANDARD
        .decode(ciphertext)
        .map_err(|e| ScratchpadError::Decryption(format!("ciphertext is not base64: {e}")))?;
    if ciphertext.len() < TAG_SIZE {
        return Err(ScratchpadError::Decryption(format!(
            "ciphertext too short: {} bytes (minimum {TAG_SIZE})",
            ciphertext.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| ScratchpadError::Decryption(format!("cipher init failed: {e}")))?;

    cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| {
            ScratchpadError::Decryption("authentication failed: wrong key or tampered data".into())
        })
}

/// [`decrypt`] followed by UTF-8 validation.
pub fn decrypt_to_string(ciphertext: &str, key: &SymmetricKey, iv: &str) -> ScratchpadResult<String> {
    let bytes = decrypt(ciphertext, key, iv)?;
    String::from_utf8(bytes)
        .map_err(|e| ScratchpadError::Decryption(format!("plaintext is not UTF-8: {e}")))
}
