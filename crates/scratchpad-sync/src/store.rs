//! Opaque key-value storage for keys and connection bookkeeping.
//!
//! Two backends are available:
//!   - **Memory**: a plain map, used by tests and throwaway sessions.
//!   - **JSON file** (default): loads entirely into memory, written through on
//!     every mutation via temp+rename so a crash never leaves a torn file.
//!
//! Both implement `KeyValueStore`, so `KeyStore` can use either transparently.
//! Values are bytes; the file backend stores them base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use scratchpad_core::{ScratchpadError, ScratchpadResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// get/set/remove contract of the local persistent store.
pub trait KeyValueStore: Send {
    /// Look up a value; `None` if absent.
    fn get(&self, name: &str) -> ScratchpadResult<Option<Vec<u8>>>;
    /// Insert or replace a value.
    fn set(&mut self, name: &str, value: &[u8]) -> ScratchpadResult<()>;
    /// Remove a value. Removing an absent name is not an error.
    fn remove(&mut self, name: &str) -> ScratchpadResult<()>;
}

/// In-memory store
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, name: &str) -> ScratchpadResult<Option<Vec<u8>>> {
        Ok(self.entries.get(name).cloned())
    }

    fn set(&mut self, name: &str, value: &[u8]) -> ScratchpadResult<()> {
        self.entries.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, name: &str) -> ScratchpadResult<()> {
        self.entries.remove(name);
        Ok(())
    }
}

/// File-backed store, persisted as a JSON object of base64 values
pub struct JsonFileStore {
    /// Path to the JSON file on disk
    path: PathBuf,
    /// In-memory mirror: name → raw bytes
    entries: BTreeMap<String, Vec<u8>>,
    /// Whether there are unsaved changes
    dirty: bool,
}

impl JsonFileStore {
    /// Load or create a store at the given path.
    /// If the file doesn't exist, starts empty.
    pub fn open(path: &Path) -> ScratchpadResult<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                ScratchpadError::Storage(format!("reading store {}: {e}", path.display()))
            })?;
            let encoded: BTreeMap<String, String> = serde_json::from_str(&content).map_err(|e| {
                ScratchpadError::Storage(format!("parsing store {}: {e}", path.display()))
            })?;
            encoded
                .into_iter()
                .map(|(name, value)| {
                    STANDARD
                        .decode(&value)
                        .map(|bytes| (name.clone(), bytes))
                        .map_err(|e| {
                            ScratchpadError::Storage(format!("entry '{name}' is not base64: {e}"))
                        })
                })
                .collect::<ScratchpadResult<_>>()?
        } else {
            BTreeMap::new()
        };

        Ok(JsonFileStore {
            path: path.to_path_buf(),
            entries,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write dirty changes to disk atomically (write then rename).
    pub fn flush(&mut self) -> ScratchpadResult<()> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ScratchpadError::Storage(format!("creating {}: {e}", parent.display()))
                })?;
            }
        }

        let encoded: BTreeMap<&str, String> = self
            .entries
            .iter()
            .map(|(name, value)| (name.as_str(), STANDARD.encode(value)))
            .collect();
        let json = serde_json::to_string_pretty(&encoded)?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| {
            ScratchpadError::Storage(format!("writing {}: {e}", tmp_path.display()))
        })?;
        restrict_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            ScratchpadError::Storage(format!("renaming to {}: {e}", self.path.display()))
        })?;

        self.dirty = false;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> ScratchpadResult<()> {
    use std::os::unix::fs::PermissionsExt;
    // The store holds the device's private key.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
        ScratchpadError::Storage(format!("chmod 600 {}: {e}", path.display()))
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> ScratchpadResult<()> {
    Ok(())
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, name: &str) -> ScratchpadResult<Option<Vec<u8>>> {
        Ok(self.entries.get(name).cloned())
    }

    fn set(&mut self, name: &str, value: &[u8]) -> ScratchpadResult<()> {
        self.entries.insert(name.to_string(), value.to_vec());
        self.dirty = true;
        self.flush()
    }

    fn remove(&mut self, name: &str) -> ScratchpadResult<()> {
        if self.entries.remove(name).is_some() {
            self.dirty = true;
        }
        self.flush()
    }
}

impl Drop for JsonFileStore {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                tracing::warn!("failed to flush key-value store on drop: {e}");
            }
        }
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Box<S> {
    fn get(&self, name: &str) -> ScratchpadResult<Option<Vec<u8>>> {
        (**self).get(name)
    }
    fn set(&mut self, name: &str, value: &[u8]) -> ScratchpadResult<()> {
        (**self).set(name, value)
    }
    fn remove(&mut self, name: &str) -> ScratchpadResult<()> {
        (**self).remove(name)
    }
}
