use std::collections::BTreeMap;
use std::sync::RwLock;

use snafu::ensure;

use super::KeyValueStore;
use super::error::{EmptyKeySnafu, LockPoisonedSnafu, StorageResult};

/// Process-local key-value store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a sorted snapshot of all stored keys.
    pub fn keys(&self) -> StorageResult<Vec<String>> {
        let items = self.items.read().map_err(|_| {
            LockPoisonedSnafu {
                stage: "memory-keys",
            }
            .build()
        })?;
        Ok(items.keys().cloned().collect())
    }
}

impl KeyValueStore for MemoryStorage {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        ensure!(!key.is_empty(), EmptyKeySnafu { stage: "memory-get" });
        let items = self
            .items
            .read()
            .map_err(|_| LockPoisonedSnafu { stage: "memory-get" }.build())?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        ensure!(!key.is_empty(), EmptyKeySnafu { stage: "memory-set" });
        let mut items = self
            .items
            .write()
            .map_err(|_| LockPoisonedSnafu { stage: "memory-set" }.build())?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        ensure!(!key.is_empty(), EmptyKeySnafu { stage: "memory-remove" });
        let mut items = self.items.write().map_err(|_| {
            LockPoisonedSnafu {
                stage: "memory-remove",
            }
            .build()
        })?;
        items.remove(key);
        Ok(())
    }
}
