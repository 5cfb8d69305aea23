//! Typed view over the key-value store: the device keypair, per-connection
//! symmetric keys, and the list of known connections.
//!
//! Layout (every value is JSON text):
//!
//! | name                | value                                   |
//! |---------------------|-----------------------------------------|
//! | `localKeypair`      | `{"privateKey": JWK, "publicKey": JWK}` |
//! | `{id}-commonKey`    | `oct` JWK of the connection's AES key   |
//! | `connections`       | `["<uuid>", ...]`                       |
//! | `currentConnection` | `"<uuid>"`                              |

use scratchpad_core::types::ConnectionId;
use scratchpad_core::{ScratchpadError, ScratchpadResult};
use scratchpad_crypto::{encode_key, LocalKeypair, PrivateJwk, PublicJwk, SymmetricJwk, SymmetricKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::KeyValueStore;

pub const LOCAL_KEYPAIR: &str = "localKeypair";
pub const CONNECTIONS: &str = "connections";
pub const CURRENT_CONNECTION: &str = "currentConnection";

fn common_key_name(id: &ConnectionId) -> String {
    format!("{id}-commonKey")
}

#[derive(Serialize, Deserialize)]
struct KeypairRecord {
    #[serde(rename = "privateKey")]
    private_key: PrivateJwk,
    #[serde(rename = "publicKey")]
    public_key: PublicJwk,
}

pub struct KeyStore<S> {
    store: S,
}

impl<S: KeyValueStore> KeyStore<S> {
    pub fn new(store: S) -> Self {
        KeyStore { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    /// Read and JSON-decode a value.
    pub fn load_value<T: DeserializeOwned>(&self, name: &str) -> ScratchpadResult<Option<T>> {
        match self.store.get(name)? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                ScratchpadError::Storage(format!("decoding stored value '{name}': {e}"))
            }),
            None => Ok(None),
        }
    }

    /// JSON-encode and store a value; `None` removes the entry.
    pub fn persist_value<T: Serialize>(&mut self, name: &str, value: Option<&T>) -> ScratchpadResult<()> {
        match value {
            Some(value) => {
                let bytes = serde_json::to_vec(value)?;
                self.store.set(name, &bytes)
            }
            None => self.store.remove(name),
        }
    }

    // ── Local keypair ────────────────────────────────────────────────────────

    /// The persisted keypair, if one exists.
    pub fn load_keypair(&self) -> ScratchpadResult<Option<LocalKeypair>> {
        let Some(record) = self.load_value::<KeypairRecord>(LOCAL_KEYPAIR)? else {
            return Ok(None);
        };
        let keypair = LocalKeypair::from_private_jwk(&record.private_key)?;
        if !keypair.public_jwk().same_key(&record.public_key) {
            return Err(ScratchpadError::Storage(
                "stored public key does not belong to the stored private key".into(),
            ));
        }
        Ok(Some(keypair))
    }

    /// Return the persisted keypair, generating and persisting one on first use.
    pub fn local_keypair(&mut self) -> ScratchpadResult<LocalKeypair> {
        if let Some(keypair) = self.load_keypair()? {
            return Ok(keypair);
        }
        let keypair = LocalKeypair::generate();
        let record = KeypairRecord {
            private_key: keypair.to_private_jwk(),
            public_key: keypair.public_jwk().clone(),
        };
        self.persist_value(LOCAL_KEYPAIR, Some(&record))?;
        info!("generated and stored local keypair");
        Ok(keypair)
    }

    /// The local public key, generating a keypair lazily.
    pub fn local_public_key(&mut self) -> ScratchpadResult<PublicJwk> {
        Ok(self.local_keypair()?.public_jwk().clone())
    }

    // ── Per-connection symmetric keys ────────────────────────────────────────

    pub fn load_common_key(&self, id: &ConnectionId) -> ScratchpadResult<Option<SymmetricKey>> {
        self.load_value::<SymmetricJwk>(&common_key_name(id))?
            .map(|jwk| SymmetricKey::from_jwk(&jwk))
            .transpose()
    }

    pub fn store_common_key(&mut self, id: &ConnectionId, key: &SymmetricKey) -> ScratchpadResult<()> {
        self.persist_value(&common_key_name(id), Some(&key.to_jwk()))?;
        debug!(connection = %id, "stored symmetric key");
        Ok(())
    }

    pub fn remove_common_key(&mut self, id: &ConnectionId) -> ScratchpadResult<()> {
        self.persist_value::<SymmetricJwk>(&common_key_name(id), None)
    }

    /// Mnemonic of the stored key for `id`, for out-of-band comparison.
    pub fn fingerprint(&self, id: &ConnectionId) -> ScratchpadResult<Option<Vec<&'static str>>> {
        Ok(self.load_common_key(id)?.as_ref().map(encode_key))
    }

    // ── Connection registry ──────────────────────────────────────────────────

    pub fn connections(&self) -> ScratchpadResult<Vec<ConnectionId>> {
        Ok(self.load_value(CONNECTIONS)?.unwrap_or_default())
    }

    /// Append `id` to the known connections. Returns false if already known.
    pub fn add_connection(&mut self, id: &ConnectionId) -> ScratchpadResult<bool> {
        let mut connections = self.connections()?;
        if connections.contains(id) {
            return Ok(false);
        }
        connections.push(*id);
        self.persist_value(CONNECTIONS, Some(&connections))?;
        Ok(true)
    }

    pub fn remove_connection(&mut self, id: &ConnectionId) -> ScratchpadResult<()> {
        let mut connections = self.connections()?;
        let before = connections.len();
        connections.retain(|c| c != id);
        if connections.len() != before {
            self.persist_value(CONNECTIONS, Some(&connections))?;
        }
        Ok(())
    }

    /// Drop every trace of `id`: list entry, symmetric key, and the current
    /// selection if it points at `id`.
    pub fn forget_connection(&mut self, id: &ConnectionId) -> ScratchpadResult<()> {
        self.remove_connection(id)?;
        self.remove_common_key(id)?;
        if self.current_connection()? == Some(*id) {
            self.set_current_connection(None)?;
        }
        info!(connection = %id, "forgot connection");
        Ok(())
    }

    pub fn current_connection(&self) -> ScratchpadResult<Option<ConnectionId>> {
        self.load_value(CURRENT_CONNECTION)
    }

    pub fn set_current_connection(&mut self, id: Option<&ConnectionId>) -> ScratchpadResult<()> {
        self.persist_value(CURRENT_CONNECTION, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn id(s: &str) -> ConnectionId {
        s.parse().unwrap()
    }

    #[test]
    fn test_keypair_generated_once() {
        let mut ks = KeyStore::new(MemoryStore::new());
        assert!(ks.load_keypair().unwrap().is_none());

        let first = ks.local_keypair().unwrap();
        let second = ks.local_keypair().unwrap();
        assert_eq!(first.public_jwk(), second.public_jwk());
        assert_eq!(ks.local_public_key().unwrap(), *first.public_jwk());
    }

    #[test]
    fn test_keypair_record_layout() {
        let mut ks = KeyStore::new(MemoryStore::new());
        ks.local_keypair().unwrap();

        let raw: serde_json::Value = ks.load_value(LOCAL_KEYPAIR).unwrap().unwrap();
        assert_eq!(raw["privateKey"]["crv"], "P-384");
        assert!(raw["privateKey"]["d"].is_string());
        assert!(raw["publicKey"].get("d").is_none());
    }

    #[test]
    fn test_common_key_roundtrip_and_removal() {
        let mut ks = KeyStore::new(MemoryStore::new());
        let conn = id("11111111-2222-4333-8444-555555555555");
        let key = SymmetricKey::generate();

        assert!(ks.load_common_key(&conn).unwrap().is_none());
        ks.store_common_key(&conn, &key).unwrap();
        assert_eq!(ks.load_common_key(&conn).unwrap().unwrap(), key);
        assert!(ks
            .inner()
            .get("11111111-2222-4333-8444-555555555555-commonKey")
            .unwrap()
            .is_some());

        ks.remove_common_key(&conn).unwrap();
        assert!(ks.load_common_key(&conn).unwrap().is_none());
    }

    #[test]
    fn test_connection_registry() {
        let mut ks = KeyStore::new(MemoryStore::new());
        let a = id("aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa");
        let b = id("bbbbbbbb-bbbb-4bbb-8bbb-bbbbbbbbbbbb");

        assert!(ks.connections().unwrap().is_empty());
        assert!(ks.add_connection(&a).unwrap());
        assert!(ks.add_connection(&b).unwrap());
        assert!(!ks.add_connection(&a).unwrap());
        assert_eq!(ks.connections().unwrap(), vec![a, b]);

        ks.set_current_connection(Some(&b)).unwrap();
        assert_eq!(ks.current_connection().unwrap(), Some(b));

        ks.remove_connection(&a).unwrap();
        assert_eq!(ks.connections().unwrap(), vec![b]);

        ks.set_current_connection(None).unwrap();
        assert_eq!(ks.current_connection().unwrap(), None);
        assert!(ks.inner().get(CURRENT_CONNECTION).unwrap().is_none());
    }

    #[test]
    fn test_forget_connection_drops_key_and_selection() {
        let mut ks = KeyStore::new(MemoryStore::new());
        let a = id("aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa");
        let b = id("bbbbbbbb-bbbb-4bbb-8bbb-bbbbbbbbbbbb");
        ks.add_connection(&a).unwrap();
        ks.add_connection(&b).unwrap();
        ks.store_common_key(&a, &SymmetricKey::generate()).unwrap();
        ks.set_current_connection(Some(&a)).unwrap();

        ks.forget_connection(&a).unwrap();

        assert_eq!(ks.connections().unwrap(), vec![b]);
        assert!(ks.load_common_key(&a).unwrap().is_none());
        assert_eq!(ks.current_connection().unwrap(), None);

        // selection elsewhere is untouched
        ks.set_current_connection(Some(&b)).unwrap();
        ks.forget_connection(&a).unwrap();
        assert_eq!(ks.current_connection().unwrap(), Some(b));
    }

    #[test]
    fn test_corrupted_keypair_is_an_error() {
        let mut store = MemoryStore::new();
        store.set(LOCAL_KEYPAIR, b"{\"privateKey\": 5}").unwrap();
        let mut ks = KeyStore::new(store);

        assert!(ks.load_keypair().is_err());
        // no silent regeneration over a damaged record
        assert!(ks.local_keypair().is_err());
    }

    #[test]
    fn test_fingerprint_of_stored_key() {
        let mut ks = KeyStore::new(MemoryStore::new());
        let a = id("aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa");
        assert_eq!(ks.fingerprint(&a).unwrap(), None);

        let key = SymmetricKey::generate();
        ks.store_common_key(&a, &key).unwrap();
        let words = ks.fingerprint(&a).unwrap().unwrap();
        assert_eq!(words.len(), 26);
        assert_eq!(words, encode_key(&key));
    }
}
