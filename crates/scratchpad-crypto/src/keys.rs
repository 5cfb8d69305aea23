//! Per-connection symmetric key and its portable `oct` JWK form

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use scratchpad_core::{ScratchpadError, ScratchpadResult};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// A 256-bit AES-GCM key shared by the two parties of a connection. Zeroized on drop.
#[derive(Clone)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Random key, for tests and benches.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn to_jwk(&self) -> SymmetricJwk {
        SymmetricJwk {
            alg: "A256GCM".into(),
            ext: true,
            k: URL_SAFE_NO_PAD.encode(self.bytes),
            key_ops: vec!["encrypt".into(), "decrypt".into()],
            kty: "oct".into(),
        }
    }

    pub fn from_jwk(jwk: &SymmetricJwk) -> ScratchpadResult<Self> {
        if jwk.kty != "oct" {
            return Err(ScratchpadError::Storage(format!(
                "stored symmetric key has kty '{}', expected 'oct'",
                jwk.kty
            )));
        }
        let mut raw = URL_SAFE_NO_PAD
            .decode(jwk.k.trim_end_matches('='))
            .map_err(|e| ScratchpadError::Storage(format!("stored symmetric key: {e}")))?;
        if raw.len() != KEY_SIZE {
            let len = raw.len();
            raw.zeroize();
            return Err(ScratchpadError::Storage(format!(
                "stored symmetric key has {len} bytes (expected {KEY_SIZE})"
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self::from_bytes(bytes))
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for SymmetricKey {}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// JWK representation (`kty = "oct"`) used when the key is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricJwk {
    #[serde(default)]
    pub alg: String,
    #[serde(default)]
    pub ext: bool,
    pub k: String,
    #[serde(default)]
    pub key_ops: Vec<String>,
    pub kty: String,
}
