//! Key/value storage contract handed to backends.
//!
//! Every backend instance sees one [`Storage`] view scoped to its mount. Over
//! the plugin boundary the view is a reverse RPC client; inside the host it is
//! whatever engine the host provides. [`InmemStorage`] and [`NoopStorage`] are
//! the two stock implementations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::context::Context;
use crate::error::LogicalError;
use crate::error::Result;

/// A single stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub seal_wrap: bool,
}

impl StorageEntry {
    /// Encode `value` as JSON under `key`.
    pub fn from_json<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self> {
        let value = serde_json::to_vec(value).map_err(|e| LogicalError::internal(format!("failed to encode entry: {e}")))?;
        Ok(Self {
            key: key.into(),
            value,
            seal_wrap: false,
        })
    }

    /// Decode the stored bytes as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value)
            .map_err(|e| LogicalError::internal(format!("failed to decode entry '{}': {e}", self.key)))
    }
}

/// Storage view available to a backend instance.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Keys directly under `prefix`. Nested keys are folded into their
    /// first path segment with a trailing `/`.
    async fn list(&self, ctx: &Context, prefix: &str) -> Result<Vec<String>>;

    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<StorageEntry>>;

    async fn put(&self, ctx: &Context, entry: &StorageEntry) -> Result<()>;

    async fn delete(&self, ctx: &Context, key: &str) -> Result<()>;
}

/// Optional storage attached to a request.
///
/// Compares equal when both sides are detached or both point at the same
/// storage object. It never crosses the wire.
#[derive(Clone, Default)]
pub struct StorageHandle(Option<Arc<dyn Storage>>);

impl StorageHandle {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self(Some(storage))
    }

    pub fn detached() -> Self {
        Self(None)
    }

    pub fn get(&self) -> Option<&Arc<dyn Storage>> {
        self.0.as_ref()
    }

    /// The attached storage, or `missing-storage` when detached.
    pub fn require(&self) -> Result<&Arc<dyn Storage>> {
        self.0.as_ref().ok_or(LogicalError::MissingStorage)
    }
}

impl PartialEq for StorageHandle {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("StorageHandle(attached)"),
            None => f.write_str("StorageHandle(detached)"),
        }
    }
}

/// Collapse `keys` into the listing of `prefix`.
fn list_under<'a>(keys: impl Iterator<Item = &'a String>, prefix: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let item = match rest.find('/') {
            Some(idx) => &rest[..=idx],
            None => rest,
        };
        if out.last().map(String::as_str) != Some(item) {
            out.push(item.to_string());
        }
    }
    out
}

/// Process-local storage backed by an ordered map.
#[derive(Debug, Default)]
pub struct InmemStorage {
    entries: RwLock<BTreeMap<String, StorageEntry>>,
}

impl InmemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for InmemStorage {
    async fn list(&self, _ctx: &Context, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(list_under(entries.range(prefix.to_string()..).map(|(k, _)| k).take_while(|k| k.starts_with(prefix)), prefix))
    }

    async fn get(&self, _ctx: &Context, key: &str) -> Result<Option<StorageEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, _ctx: &Context, entry: &StorageEntry) -> Result<()> {
        if entry.key.is_empty() {
            return Err(LogicalError::user("storage key must not be empty"));
        }
        self.entries.write().await.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, _ctx: &Context, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Storage that stores nothing.
///
/// Lists are empty, reads find nothing, writes are accepted and dropped.
/// Swapped in while the host is in metadata mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

#[async_trait]
impl Storage for NoopStorage {
    async fn list(&self, _ctx: &Context, _prefix: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get(&self, _ctx: &Context, _key: &str) -> Result<Option<StorageEntry>> {
        Ok(None)
    }

    async fn put(&self, _ctx: &Context, _entry: &StorageEntry) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _ctx: &Context, _key: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str) -> StorageEntry {
        StorageEntry {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
            seal_wrap: false,
        }
    }

    #[tokio::test]
    async fn test_inmem_crud() {
        let ctx = Context::background();
        let storage = InmemStorage::new();

        storage.put(&ctx, &entry("foo", "bar")).await.unwrap();
        assert_eq!(storage.get(&ctx, "foo").await.unwrap(), Some(entry("foo", "bar")));

        storage.delete(&ctx, "foo").await.unwrap();
        assert_eq!(storage.get(&ctx, "foo").await.unwrap(), None);
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_inmem_list_folds_nested_keys() {
        let ctx = Context::background();
        let storage = InmemStorage::new();
        for key in ["kv/a", "kv/b", "kv/dir/c", "kv/dir/d", "other/x"] {
            storage.put(&ctx, &entry(key, "v")).await.unwrap();
        }

        let keys = storage.list(&ctx, "kv/").await.unwrap();
        assert_eq!(keys, vec!["a", "b", "dir/"]);
        assert_eq!(storage.list(&ctx, "").await.unwrap(), vec!["kv/", "other/"]);
    }

    #[tokio::test]
    async fn test_inmem_rejects_empty_key() {
        let storage = InmemStorage::new();
        let err = storage.put(&Context::background(), &entry("", "v")).await.unwrap_err();
        assert!(matches!(err, LogicalError::User { .. }));
    }

    #[tokio::test]
    async fn test_noop_storage_is_inert() {
        let ctx = Context::background();
        let storage = NoopStorage;
        storage.put(&ctx, &entry("foo", "bar")).await.unwrap();
        assert_eq!(storage.get(&ctx, "foo").await.unwrap(), None);
        assert!(storage.list(&ctx, "").await.unwrap().is_empty());
        storage.delete(&ctx, "foo").await.unwrap();
    }

    #[test]
    fn test_storage_handle_equality() {
        let shared: Arc<dyn Storage> = Arc::new(NoopStorage);
        assert_eq!(StorageHandle::detached(), StorageHandle::detached());
        assert_eq!(StorageHandle::new(shared.clone()), StorageHandle::new(shared));
        assert_ne!(StorageHandle::new(Arc::new(NoopStorage)), StorageHandle::detached());
        assert!(matches!(StorageHandle::detached().require(), Err(LogicalError::MissingStorage)));
    }

    #[test]
    fn test_json_entry() {
        let entry = StorageEntry::from_json("k", &serde_json::json!({"value": "bar"})).unwrap();
        let decoded: serde_json::Value = entry.decode_json().unwrap();
        assert_eq!(decoded["value"], "bar");
    }
}
