pub mod error;
pub mod keys;
pub mod memory;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use keys::{PreferenceKey, decode_flag, encode_flag, key_bundle_key};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// String-keyed, string-valued local storage.
///
/// Calls are synchronous; implementations backed by async drivers run each call
/// on their own worker so callers never block an executor they are running on.
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> StorageResult<()>;
    /// Removing a key that was never written succeeds.
    fn remove_item(&self, key: &str) -> StorageResult<()>;
}

impl<T> KeyValueStore for std::sync::Arc<T>
where
    T: KeyValueStore + ?Sized,
{
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        (**self).get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        (**self).set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        (**self).remove_item(key)
    }
}
