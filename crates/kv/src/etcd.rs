//! etcd v3 binding for the `KvApi` surface.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions};
use tracing::info;

use arca_core::{StoreError, StoreResult};

use crate::KvApi;

/// Connection settings for the key-value cluster. Defaults read the
/// `ARCA_ETCD_*` environment.
#[derive(Debug, Clone)]
pub struct KvConfig {
    pub endpoints: Vec<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        let endpoints = std::env::var("ARCA_ETCD_ENDPOINTS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v: &Vec<String>| !v.is_empty())
            .unwrap_or_else(|| vec!["http://127.0.0.1:2379".to_string()]);
        let connect_timeout_ms = std::env::var("ARCA_ETCD_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);
        let request_timeout_ms = std::env::var("ARCA_ETCD_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10_000);
        Self { endpoints, connect_timeout_ms, request_timeout_ms }
    }
}

/// `KvApi` over an etcd cluster. The kv handle is cheap to clone and each
/// call clones it, the client's operations take `&mut self`.
pub struct EtcdKv {
    kv: etcd_client::KvClient,
}

impl EtcdKv {
    pub async fn connect(cfg: &KvConfig) -> StoreResult<Self> {
        let opts = ConnectOptions::new()
            .with_connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .with_timeout(Duration::from_millis(cfg.request_timeout_ms));
        let client = Client::connect(&cfg.endpoints, Some(opts))
            .await
            .map_err(|e| conn_err("connect", e))?;
        info!(endpoints = ?cfg.endpoints, "kv: connected");
        Ok(Self { kv: client.kv_client() })
    }
}

fn conn_err(op: &str, e: etcd_client::Error) -> StoreError {
    StoreError::Connection(format!("etcd {}: {}", op, e))
}

#[async_trait]
impl KvApi for EtcdKv {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut kv = self.kv.clone();
        let resp = kv.get(key, None).await.map_err(|e| conn_err("get", e))?;
        Ok(resp.kvs().first().map(|pair| pair.value().to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut kv = self.kv.clone();
        kv.put(key, value, None).await.map_err(|e| conn_err("put", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut kv = self.kv.clone();
        kv.delete(key, None).await.map_err(|e| conn_err("delete", e))?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut kv = self.kv.clone();
        let resp = kv
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| conn_err("list", e))?;
        let mut out = Vec::with_capacity(resp.kvs().len());
        for pair in resp.kvs() {
            let key = pair
                .key_str()
                .map_err(|e| StoreError::InvalidObject(format!("etcd key utf8: {}", e)))?
                .to_string();
            out.push((key, pair.value().to_vec()));
        }
        Ok(out)
    }
}
