//! Arca repositories: the backend contract and the in-memory baseline.

#![forbid(unsafe_code)]

use std::sync::RwLock;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::debug;

use arca_core::{Filter, ResourceKind, ResourceRecord, StoreError, StoreResult};

/// Map/scan key: `namespace/name`, or the bare name for cluster-scoped
/// records. Computed from identity on every call, never cached.
pub fn storage_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Storage key derived from a record's own identity. Writes go through
/// this so an unnamed record is rejected before it can land under an
/// unreachable key.
pub fn object_key<T: ResourceRecord>(obj: &T) -> StoreResult<String> {
    if obj.name().is_empty() {
        return Err(StoreError::InvalidObject("record has no name".into()));
    }
    Ok(storage_key(obj.namespace(), obj.name()))
}

/// Uniform CRUD contract implemented by every backend.
///
/// Semantics are strict: `create` refuses to overwrite, `update` refuses
/// to insert. No method retries internally; timeout and retry policy
/// belong to the caller. The repository stamps nothing on the records it
/// stores, resource versions come from the layer above.
#[async_trait]
pub trait Repository<T: ResourceRecord>: Send + Sync {
    /// Kind served by this repository.
    fn kind(&self) -> &ResourceKind;

    /// Point read; requires `filter.name`.
    async fn get(&self, filter: &Filter) -> StoreResult<T>;

    /// Scan; an unset namespace means all namespaces, and an empty result
    /// is not an error. Ordering is deterministic on unchanged data.
    async fn list(&self, filter: &Filter) -> StoreResult<Vec<T>>;

    /// Strict insert: `already_exists` when the key is taken.
    async fn create(&self, obj: &T) -> StoreResult<()>;

    /// Strict replace: `not_found` when the key is absent.
    async fn update(&self, obj: &T) -> StoreResult<()>;

    /// Point remove; requires `filter.name`. `not_found` when absent.
    async fn delete(&self, filter: &Filter) -> StoreResult<()>;
}

/// Map-backed baseline backend. Readers share the lock, writers take it
/// exclusively. This is the correctness reference the other backends are
/// held to: identical error conditions, identical scoping.
pub struct MemoryRepository<T> {
    kind: ResourceKind,
    items: RwLock<FxHashMap<String, T>>,
}

impl<T: ResourceRecord> MemoryRepository<T> {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, items: RwLock::new(FxHashMap::default()) }
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn not_found(&self, key: &str) -> StoreError {
        StoreError::NotFound(format!("{} {}", self.kind.plural, key))
    }
}

#[async_trait]
impl<T: ResourceRecord> Repository<T> for MemoryRepository<T> {
    fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    async fn get(&self, filter: &Filter) -> StoreResult<T> {
        let name = filter.require_name("get")?;
        let key = storage_key(filter.namespace(), name);
        let items = self.items.read().unwrap();
        items.get(&key).cloned().ok_or_else(|| self.not_found(&key))
    }

    async fn list(&self, filter: &Filter) -> StoreResult<Vec<T>> {
        let items = self.items.read().unwrap();
        let mut hits: Vec<(&String, &T)> =
            items.iter().filter(|(_, obj)| filter.matches(*obj)).collect();
        // map iteration order is arbitrary; key order keeps repeated scans
        // of unchanged data identical
        hits.sort_by(|a, b| a.0.cmp(b.0));
        Ok(hits.into_iter().map(|(_, obj)| obj.clone()).collect())
    }

    async fn create(&self, obj: &T) -> StoreResult<()> {
        let key = object_key(obj)?;
        let mut items = self.items.write().unwrap();
        if items.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("{} {}", self.kind.plural, key)));
        }
        items.insert(key.clone(), obj.clone());
        debug!(kind = %self.kind.kind, key = %key, "store: created");
        Ok(())
    }

    async fn update(&self, obj: &T) -> StoreResult<()> {
        let key = object_key(obj)?;
        let mut items = self.items.write().unwrap();
        match items.get_mut(&key) {
            Some(slot) => {
                *slot = obj.clone();
                Ok(())
            }
            None => Err(self.not_found(&key)),
        }
    }

    async fn delete(&self, filter: &Filter) -> StoreResult<()> {
        let name = filter.require_name("delete")?;
        let key = storage_key(filter.namespace(), name);
        let mut items = self.items.write().unwrap();
        match items.remove(&key) {
            Some(_) => {
                debug!(kind = %self.kind.kind, key = %key, "store: deleted");
                Ok(())
            }
            None => Err(self.not_found(&key)),
        }
    }
}
