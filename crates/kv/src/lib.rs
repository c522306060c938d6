//! Hierarchical key-value backend: resource identity encoded into key
//! paths, listing as a single prefix scan.

#![forbid(unsafe_code)]

pub mod etcd;

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use arca_core::{Filter, ResourceKind, ResourceRecord, StoreError, StoreResult};
use arca_store::{object_key, storage_key, Repository};

pub use etcd::{EtcdKv, KvConfig};

/// Minimal key-value surface the repository needs. Object-safe so
/// deployments and tests can swap `Arc<dyn KvApi>` implementations.
#[async_trait]
pub trait KvApi: Send + Sync {
    /// Point lookup; `None` when the key is absent.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    /// Unconditional write. Cannot distinguish create from overwrite.
    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;
    /// Unconditional remove. An absent key is not an error here.
    async fn delete(&self, key: &str) -> StoreResult<()>;
    /// All pairs under a prefix, in ascending key order.
    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;
}

/// In-process `KvApi` for tests and single-node runs.
#[derive(Default)]
pub struct MemKv {
    items: std::sync::Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvApi for MemKv {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.items.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.items.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.items.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let items = self.items.lock().unwrap();
        Ok(items
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Repository over a hierarchical key-value store.
///
/// Keys are `{group}/{version}/{kind}/{namespace}/{name}` for namespaced
/// kinds and `{group}/{version}/{kind}/{name}` for cluster-scoped ones
/// (an empty group is elided, matching `ResourceKind::gvk_key`). Listing
/// is one prefix scan. The underlying put/delete cannot tell create from
/// overwrite or report absence on delete, so strict semantics are
/// synthesized from a point lookup first, and a mutex serializes each
/// check-then-mutate sequence per repository instance. That trades
/// intra-process write parallelism for strictness without needing a
/// compare-and-swap primitive from the store.
pub struct KvRepository<T> {
    kind: ResourceKind,
    kv: Arc<dyn KvApi>,
    write_lock: Mutex<()>,
    _record: PhantomData<T>,
}

impl<T: ResourceRecord> KvRepository<T> {
    pub fn new(kind: ResourceKind, kv: Arc<dyn KvApi>) -> Self {
        Self { kind, kv, write_lock: Mutex::new(()), _record: PhantomData }
    }

    fn full_key(&self, suffix: &str) -> String {
        format!("{}/{}", self.kind.gvk_key(), suffix)
    }

    /// Scan prefix for a filter: the whole kind, or one namespace of it.
    /// Always ends in '/' so sibling kinds sharing a name prefix cannot
    /// bleed into the scan.
    fn scan_prefix(&self, filter: &Filter) -> String {
        match filter.namespace() {
            Some(ns) if self.kind.namespaced => format!("{}/{}/", self.kind.gvk_key(), ns),
            _ => format!("{}/", self.kind.gvk_key()),
        }
    }

    fn encode(&self, key: &str, obj: &T) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(obj)
            .map_err(|e| StoreError::InvalidObject(format!("encode {}: {}", key, e)))
    }

    fn decode(&self, key: &str, raw: &[u8]) -> StoreResult<T> {
        serde_json::from_slice(raw)
            .map_err(|e| StoreError::InvalidObject(format!("decode {}: {}", key, e)))
    }

    fn not_found(&self, suffix: &str) -> StoreError {
        StoreError::NotFound(format!("{} {}", self.kind.plural, suffix))
    }
}

#[async_trait]
impl<T: ResourceRecord> Repository<T> for KvRepository<T> {
    fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    async fn get(&self, filter: &Filter) -> StoreResult<T> {
        let name = filter.require_name("get")?;
        let suffix = storage_key(filter.namespace(), name);
        let key = self.full_key(&suffix);
        match self.kv.get(&key).await? {
            Some(raw) => self.decode(&key, &raw),
            None => Err(self.not_found(&suffix)),
        }
    }

    async fn list(&self, filter: &Filter) -> StoreResult<Vec<T>> {
        let prefix = self.scan_prefix(filter);
        let pairs = self.kv.list_prefix(&prefix).await?;
        let mut out = Vec::with_capacity(pairs.len());
        for (key, raw) in pairs {
            let obj = self.decode(&key, &raw)?;
            if filter.matches(&obj) {
                out.push(obj);
            }
        }
        Ok(out)
    }

    async fn create(&self, obj: &T) -> StoreResult<()> {
        let suffix = object_key(obj)?;
        let key = self.full_key(&suffix);
        let value = self.encode(&key, obj)?;
        let _guard = self.write_lock.lock().await;
        if self.kv.get(&key).await?.is_some() {
            return Err(StoreError::AlreadyExists(format!("{} {}", self.kind.plural, suffix)));
        }
        self.kv.put(&key, value).await?;
        debug!(kind = %self.kind.kind, key = %key, "kv: created");
        Ok(())
    }

    async fn update(&self, obj: &T) -> StoreResult<()> {
        let suffix = object_key(obj)?;
        let key = self.full_key(&suffix);
        let value = self.encode(&key, obj)?;
        let _guard = self.write_lock.lock().await;
        if self.kv.get(&key).await?.is_none() {
            return Err(self.not_found(&suffix));
        }
        self.kv.put(&key, value).await
    }

    async fn delete(&self, filter: &Filter) -> StoreResult<()> {
        let name = filter.require_name("delete")?;
        let suffix = storage_key(filter.namespace(), name);
        let key = self.full_key(&suffix);
        let _guard = self.write_lock.lock().await;
        if self.kv.get(&key).await?.is_none() {
            return Err(self.not_found(&suffix));
        }
        self.kv.delete(&key).await?;
        debug!(kind = %self.kind.kind, key = %key, "kv: deleted");
        Ok(())
    }
}
