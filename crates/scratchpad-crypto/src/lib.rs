//! scratchpad-crypto: end-to-end encryption for a two-party scratchpad
//!
//! Pairing: each device holds one static P-384 ECDH keypair. Both parties
//! derive the same AES-256-GCM key from (own private, peer public); the relay
//! only ever sees public keys and ciphertext.
//!
//! ```text
//! Local keypair (P-384, generated once per device)
//!   └── Symmetric key (per connection) = ECDH(local priv, peer pub).x[..32]
//!       ├── Envelope AEAD: AES-256-GCM (key, iv = random 96-bit)
//!       └── Fingerprint: 26 × 10-bit words over the raw key bits
//! ```

pub mod agreement;
pub mod cipher;
pub mod keys;
pub mod mnemonic;

pub use agreement::{LocalKeypair, PrivateJwk, PublicJwk};
pub use cipher::{decrypt, decrypt_to_string, encrypt, SealedPayload};
pub use keys::{SymmetricKey, SymmetricJwk};
pub use mnemonic::{encode_key, encode_raw};

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM IV (96-bit)
pub const IV_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Named curve used for key agreement
pub const CURVE: &str = "P-384";
