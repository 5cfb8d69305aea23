//! Relay wire format.
//!
//! Frames on the WebSocket are UTF-8 JSON objects discriminated by `type`:
//!
//! ```text
//!   {"type":"denied"}                                  relay → client, terminal
//!   {"type":"key-exchange","key":<public JWK>}         both directions
//!   {"type":"text","iv":<b64>,"encrypted":<b64>}       both directions
//!   {"type":"files","iv":<b64>,"encrypted":<b64>}      both directions
//! ```
//!
//! `text` decrypts to `{"ts":<int>,"text":<string>}`; `files` decrypts to a
//! JSON array of `{"name","size","type","data"}`. Anything else (including the
//! relay's own `{"type":"invalid"}` reply) is a protocol error.
//!
//! The HTTP record returned by `GET /api/connections/{id}` is
//! [`ConnectionRecord`].

use scratchpad_core::types::{FileList, TextDocument};
use scratchpad_core::{ScratchpadError, ScratchpadResult};
use scratchpad_crypto::{decrypt, encrypt, LocalKeypair, PublicJwk, SymmetricKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Ciphertext plus the IV needed to open it, both standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub iv: String,
    pub encrypted: String,
}

impl Envelope {
    /// JSON-encode `payload` and seal it under `key` with a fresh IV.
    pub fn seal<T: Serialize + ?Sized>(payload: &T, key: &SymmetricKey) -> ScratchpadResult<Self> {
        let json = serde_json::to_vec(payload)?;
        let sealed = encrypt(&json, key)?;
        Ok(Envelope {
            iv: sealed.iv,
            encrypted: sealed.ciphertext,
        })
    }

    /// Decrypt and JSON-decode. A plaintext that authenticates but does not
    /// have the expected shape is a protocol error.
    pub fn open<T: DeserializeOwned>(&self, key: &SymmetricKey) -> ScratchpadResult<T> {
        let plaintext = decrypt(&self.encrypted, key, &self.iv)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| ScratchpadError::Protocol(format!("unexpected payload shape: {e}")))
    }
}

// ── WireMessage ───────────────────────────────────────────────────────────────

/// One frame on the relay channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    /// The relay refuses this connection id. Terminal.
    Denied,
    /// A party announces its public key.
    KeyExchange { key: PublicJwk },
    /// Encrypted [`TextDocument`].
    Text(Envelope),
    /// Encrypted [`FileList`].
    Files(Envelope),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Denied => "denied",
            WireMessage::KeyExchange { .. } => "key-exchange",
            WireMessage::Text(_) => "text",
            WireMessage::Files(_) => "files",
        }
    }

    pub fn seal_text(doc: &TextDocument, key: &SymmetricKey) -> ScratchpadResult<Self> {
        Envelope::seal(doc, key).map(WireMessage::Text)
    }

    pub fn seal_files(files: &FileList, key: &SymmetricKey) -> ScratchpadResult<Self> {
        Envelope::seal(files, key).map(WireMessage::Files)
    }

    pub fn to_frame(&self) -> ScratchpadResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame. Unknown or malformed frames are `Protocol` errors.
    pub fn from_frame(frame: &str) -> ScratchpadResult<Self> {
        let value: serde_json::Value = serde_json::from_str(frame)
            .map_err(|e| ScratchpadError::Protocol(format!("frame is not JSON: {e}")))?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_owned)
            .ok_or_else(|| ScratchpadError::Protocol("frame has no type".into()))?;

        serde_json::from_value(value)
            .map_err(|e| ScratchpadError::Protocol(format!("unrecognized '{kind}' frame: {e}")))
    }
}

// ── ConnectionRecord ──────────────────────────────────────────────────────────

/// Server-held state of one connection id.
///
/// `a` and `b` are filled in arrival order by the relay; at most two distinct
/// keys are ever recorded. `last_text`/`last_files` are the latest envelopes
/// the relay forwarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    #[serde(default)]
    pub a: Option<PublicJwk>,
    #[serde(default)]
    pub b: Option<PublicJwk>,
    #[serde(default)]
    pub last_text: Option<Envelope>,
    #[serde(default)]
    pub last_files: Option<Envelope>,
}

/// Where the local party sits in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLookup<'a> {
    /// The relay already holds the local public key.
    pub local_registered: bool,
    /// The other party's key, if known.
    pub peer: Option<&'a PublicJwk>,
}

impl ConnectionRecord {
    pub fn locate(&self, local: &LocalKeypair) -> PeerLookup<'_> {
        if local.is_local_public_key(self.a.as_ref()) {
            PeerLookup {
                local_registered: true,
                peer: self.b.as_ref(),
            }
        } else if local.is_local_public_key(self.b.as_ref()) {
            PeerLookup {
                local_registered: true,
                peer: self.a.as_ref(),
            }
        } else {
            // Not registered yet: whichever key is present must be the peer's.
            PeerLookup {
                local_registered: false,
                peer: self.a.as_ref().or(self.b.as_ref()),
            }
        }
    }

    /// Number of key slots the relay has filled.
    pub fn parties(&self) -> usize {
        usize::from(self.a.is_some()) + usize::from(self.b.is_some())
    }
}
