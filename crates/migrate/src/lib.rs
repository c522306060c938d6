//! Bulk migration: drain a live external source into a repository with a
//! bounded worker pool, then mirror its ongoing changes.

#![forbid(unsafe_code)]

pub mod cluster;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use arca_api::{CancelHandle, StreamHandle};
use arca_core::{Filter, ResourceRecord, StoreResult, VersionCounter};
use arca_store::Repository;

pub use cluster::ClusterSource;

/// Counter fast-forward margin past the highest migrated version. Change
/// events still in flight from the source at handoff time carry versions
/// near the drained ones; the margin keeps freshly issued versions clear
/// of them. A heuristic bound, not a proof.
pub const VERSION_HEADROOM: u64 = 5_000;

/// Change notification from a live source.
#[derive(Debug, Clone)]
pub enum SourceEvent<T> {
    Applied(T),
    Deleted(T),
}

/// An external system records are drained from: list what it holds now,
/// remove what has been handed off, and stream the changes that keep
/// arriving while (and after) the batch runs.
#[async_trait]
pub trait LiveSource<T: ResourceRecord>: Send + Sync {
    async fn list_all(&self) -> StoreResult<Vec<T>>;
    /// Handoff: called only after the record landed in the destination.
    async fn remove(&self, obj: &T) -> StoreResult<()>;
    /// Subscribe to live changes. The producer stops once the receiver
    /// is gone.
    async fn events(&self) -> StoreResult<StreamHandle<SourceEvent<T>>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub migrated: usize,
    pub failed: usize,
    /// Highest resource version observed at the source, 0 when empty.
    pub last_version: u64,
}

/// Drains a [`LiveSource`] into a repository.
///
/// Writes go straight to the repository rather than through the owning
/// store layer so migrated records keep their source-issued resource
/// versions; the shared counter is fast-forwarded past them afterwards.
pub struct Migrator<T: ResourceRecord> {
    source: Arc<dyn LiveSource<T>>,
    dest: Arc<dyn Repository<T>>,
    versions: Arc<VersionCounter>,
    concurrency: usize,
}

impl<T: ResourceRecord> Migrator<T> {
    pub fn new(
        source: Arc<dyn LiveSource<T>>,
        dest: Arc<dyn Repository<T>>,
        versions: Arc<VersionCounter>,
    ) -> Self {
        let concurrency = std::env::var("ARCA_MIGRATE_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(8);
        Self { source, dest, versions, concurrency }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Drain the source's current content, then fast-forward the version
    /// counter past everything observed.
    ///
    /// Items run on a worker pool gated to `concurrency` permits; each
    /// worker lands its record in the destination and then removes it at
    /// the source. A failing item is logged and counted, never fatal.
    pub async fn run(&self) -> StoreResult<MigrationSummary> {
        let t0 = Instant::now();
        let items = self.source.list_all().await?;
        let total = items.len();
        info!(kind = %self.dest.kind().kind, total, "migrate: batch start");

        let sem = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut tasks = Vec::with_capacity(total);
        for obj in items {
            let sem = Arc::clone(&sem);
            let source = Arc::clone(&self.source);
            let dest = Arc::clone(&self.dest);
            tasks.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.ok();
                let rv = obj.resource_version().parse::<u64>().unwrap_or(0);
                match migrate_one(&source, &dest, &obj).await {
                    Ok(()) => {
                        debug!(name = %obj.name(), rv, "migrate: item ok");
                        (rv, true)
                    }
                    Err(e) => {
                        warn!(name = %obj.name(), error = %e, "migrate: item failed");
                        (rv, false)
                    }
                }
            }));
        }

        let mut migrated = 0usize;
        let mut failed = 0usize;
        let mut last_version = 0u64;
        for task in tasks {
            match task.await {
                Ok((rv, ok)) => {
                    last_version = last_version.max(rv);
                    if ok {
                        migrated += 1;
                    } else {
                        failed += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "migrate: worker crashed");
                    failed += 1;
                }
            }
        }

        if last_version > 0 {
            let target = last_version + VERSION_HEADROOM;
            self.versions.set_resource_version(&target.to_string());
        }
        counter!("migrate_items_total", migrated as u64);
        counter!("migrate_failures_total", failed as u64);
        histogram!("migrate_batch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            migrated,
            failed,
            last_version,
            took_ms = %t0.elapsed().as_millis(),
            "migrate: batch done"
        );
        Ok(MigrationSummary { migrated, failed, last_version })
    }

    /// Start mirroring the source's live changes into the destination.
    ///
    /// Runs until cancelled. Aborting the returned handle drops the
    /// receiver; the source's producer stops on its next send.
    pub async fn tail(&self) -> StoreResult<CancelHandle> {
        let stream = self.source.events().await?;
        let dest = Arc::clone(&self.dest);
        let kind = self.dest.kind().kind.clone();
        let task = tokio::spawn(async move {
            let StreamHandle { mut rx, cancel } = stream;
            while let Some(ev) = rx.recv().await {
                if let Err(e) = mirror(&dest, ev).await {
                    counter!("migrate_tail_failures_total", 1u64);
                    warn!(kind = %kind, error = %e, "migrate: tail apply failed");
                }
            }
            cancel.cancel();
            info!(kind = %kind, "migrate: tail ended");
        });
        Ok(CancelHandle::new(task))
    }

    /// The full routine: batch drain, counter fast-forward, live tail.
    pub async fn migrate(&self) -> StoreResult<(MigrationSummary, CancelHandle)> {
        let summary = self.run().await?;
        let tail = self.tail().await?;
        Ok((summary, tail))
    }
}

/// Create-or-overwrite. The strict create/update split is a client
/// concern; migration always converges on the source's copy.
async fn land<T: ResourceRecord>(dest: &Arc<dyn Repository<T>>, obj: &T) -> StoreResult<()> {
    match dest.create(obj).await {
        Err(e) if e.is_already_exists() => dest.update(obj).await,
        other => other,
    }
}

async fn migrate_one<T: ResourceRecord>(
    source: &Arc<dyn LiveSource<T>>,
    dest: &Arc<dyn Repository<T>>,
    obj: &T,
) -> StoreResult<()> {
    land(dest, obj).await?;
    source.remove(obj).await
}

async fn mirror<T: ResourceRecord>(
    dest: &Arc<dyn Repository<T>>,
    ev: SourceEvent<T>,
) -> StoreResult<()> {
    match ev {
        SourceEvent::Applied(obj) => land(dest, &obj).await,
        SourceEvent::Deleted(obj) => {
            let filter = Filter::new()
                .with_name(obj.name())
                .with_namespace(obj.namespace().unwrap_or(""));
            match dest.delete(&filter).await {
                // a record the batch already drained, or never copied
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            }
        }
    }
}
