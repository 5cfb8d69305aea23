//! P-384 ECDH key agreement between the two parties of a connection.
//!
//! Public keys travel as JWKs (`{crv, ext, key_ops, kty, x, y}`, base64url
//! coordinates) because that is the shape the relay validates and stores in
//! the connection record's `a`/`b` slots.
//!
//! The derived AES-256-GCM key is the first 256 bits of the shared
//! x-coordinate, which is what a browser's
//! `deriveKey({name: "ECDH"}, .., {name: "AES-GCM", length: 256})` yields.
//! A native client and a browser client therefore agree on the same key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p384::elliptic_curve::sec1::ToEncodedPoint;
use p384::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use scratchpad_core::{ScratchpadError, ScratchpadResult};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::keys::SymmetricKey;
use crate::{CURVE, KEY_SIZE};

/// Byte length of a P-384 field element / coordinate
const COORD_SIZE: usize = 48;

/// Portable public key, as exchanged over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    pub crv: String,
    #[serde(default = "default_ext")]
    pub ext: bool,
    #[serde(default)]
    pub key_ops: Vec<String>,
    pub kty: String,
    pub x: String,
    pub y: String,
}

fn default_ext() -> bool {
    true
}

/// Portable private key, only ever written to the local key store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateJwk {
    pub crv: String,
    pub d: String,
    #[serde(default = "default_ext")]
    pub ext: bool,
    #[serde(default)]
    pub key_ops: Vec<String>,
    pub kty: String,
    pub x: String,
    pub y: String,
}

impl std::fmt::Debug for PrivateJwk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateJwk")
            .field("crv", &self.crv)
            .field("d", &"[REDACTED]")
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

impl PublicJwk {
    fn from_public_key(public: &PublicKey) -> Self {
        let point = public.to_encoded_point(false);
        // Uncompressed encoding always carries both coordinates.
        let x = point.x().map(|x| URL_SAFE_NO_PAD.encode(x)).unwrap_or_default();
        let y = point.y().map(|y| URL_SAFE_NO_PAD.encode(y)).unwrap_or_default();
        PublicJwk {
            crv: CURVE.into(),
            ext: true,
            key_ops: Vec::new(),
            kty: "EC".into(),
            x,
            y,
        }
    }

    /// Parse and validate the key: correct curve, correct sizes, point on the curve.
    pub fn to_public_key(&self) -> ScratchpadResult<PublicKey> {
        if self.kty != "EC" {
            return Err(ScratchpadError::KeyAgreement(format!(
                "expected kty 'EC', got '{}'",
                self.kty
            )));
        }
        if self.crv != CURVE {
            return Err(ScratchpadError::KeyAgreement(format!(
                "expected curve {CURVE}, got '{}'",
                self.crv
            )));
        }
        let x = decode_coordinate("x", &self.x)?;
        let y = decode_coordinate("y", &self.y)?;

        let mut sec1 = Vec::with_capacity(1 + 2 * COORD_SIZE);
        sec1.push(0x04);
        sec1.extend_from_slice(&x);
        sec1.extend_from_slice(&y);

        PublicKey::from_sec1_bytes(&sec1)
            .map_err(|_| ScratchpadError::KeyAgreement("point is not on P-384".into()))
    }

    /// Same key material, ignoring `ext`/`key_ops` metadata.
    pub fn same_key(&self, other: &PublicJwk) -> bool {
        self.x == other.x && self.y == other.y
    }
}

fn decode_coordinate(name: &str, value: &str) -> ScratchpadResult<Vec<u8>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| ScratchpadError::KeyAgreement(format!("coordinate {name}: {e}")))?;
    if bytes.len() != COORD_SIZE {
        return Err(ScratchpadError::KeyAgreement(format!(
            "coordinate {name} has {} bytes (expected {COORD_SIZE})",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// The device's static ECDH keypair.
#[derive(Clone)]
pub struct LocalKeypair {
    secret: SecretKey,
    public: PublicJwk,
}

impl LocalKeypair {
    /// Fresh random keypair.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = PublicJwk::from_public_key(&secret.public_key());
        tracing::debug!("generated local P-384 keypair");
        LocalKeypair { secret, public }
    }

    /// Restore from the persisted private JWK. The public half is recomputed
    /// from `d` and must match the stored coordinates.
    pub fn from_private_jwk(jwk: &PrivateJwk) -> ScratchpadResult<Self> {
        if jwk.kty != "EC" || jwk.crv != CURVE {
            return Err(ScratchpadError::KeyAgreement(format!(
                "stored keypair is {}/{} (expected EC/{CURVE})",
                jwk.kty, jwk.crv
            )));
        }
        let d = Zeroizing::new(decode_coordinate("d", &jwk.d)?);
        let secret = SecretKey::from_slice(&d)
            .map_err(|_| ScratchpadError::KeyAgreement("invalid private scalar".into()))?;
        let public = PublicJwk::from_public_key(&secret.public_key());
        if public.x != jwk.x.trim_end_matches('=') || public.y != jwk.y.trim_end_matches('=') {
            return Err(ScratchpadError::KeyAgreement(
                "stored public coordinates do not match private key".into(),
            ));
        }
        Ok(LocalKeypair { secret, public })
    }

    pub fn to_private_jwk(&self) -> PrivateJwk {
        let d = Zeroizing::new(self.secret.to_bytes().to_vec());
        PrivateJwk {
            crv: CURVE.into(),
            d: URL_SAFE_NO_PAD.encode(d.as_slice()),
            ext: true,
            key_ops: vec!["deriveKey".into()],
            kty: "EC".into(),
            x: self.public.x.clone(),
            y: self.public.y.clone(),
        }
    }

    pub fn public_jwk(&self) -> &PublicJwk {
        &self.public
    }

    /// Whether `candidate` is this device's public key. `None` is never local.
    pub fn is_local_public_key(&self, candidate: Option<&PublicJwk>) -> bool {
        candidate.is_some_and(|c| self.public.same_key(c))
    }

    /// ECDH(local private, remote public) → AES-256-GCM key.
    ///
    /// Symmetric: `a.derive(b.pub) == b.derive(a.pub)`.
    pub fn derive_symmetric_key(&self, remote: &PublicJwk) -> ScratchpadResult<SymmetricKey> {
        let remote = remote.to_public_key()?;
        let shared = p384::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), remote.as_affine());

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&shared.raw_secret_bytes()[..KEY_SIZE]);
        Ok(SymmetricKey::from_bytes(bytes))
    }
}

impl std::fmt::Debug for LocalKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeypair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
