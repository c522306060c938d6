//! Arca resource store: version stamping, list/watch filtering, and
//! change streaming layered over an interchangeable backend repository.

#![forbid(unsafe_code)]

pub mod filter;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use arca_core::{Filter, ResourceKind, ResourceRecord, StoreError, StoreResult, VersionCounter};
use arca_store::Repository;

pub use filter::{filter_list, selector_matches, ListOptions, VersionMatch};

/// Change event streamed to watchers, in wire form:
/// `{"type": "Added", "object": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "object")]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

/// Cancellation handle that aborts the underlying task.
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Generic stream handle returned by streaming endpoints.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// A filtered list plus the aggregate resource version watchers resume
/// from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResult<T> {
    pub items: Vec<T>,
    pub resource_version: u64,
}

fn queue_cap() -> usize {
    std::env::var("ARCA_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048)
}

/// The owning layer over one kind's repository.
///
/// The repository persists records verbatim; this store is what stamps
/// resource versions (one shared counter across all stores of a
/// process), uids and timestamps, and what fans out change events to
/// watchers. Backend choice is invisible here: any `Repository<T>` fits.
pub struct ResourceStore<T: ResourceRecord> {
    repo: Arc<dyn Repository<T>>,
    versions: Arc<VersionCounter>,
    events: broadcast::Sender<WatchEvent<T>>,
}

impl<T: ResourceRecord> ResourceStore<T> {
    pub fn new(repo: Arc<dyn Repository<T>>, versions: Arc<VersionCounter>) -> Self {
        let (events, _) = broadcast::channel(queue_cap());
        Self { repo, versions, events }
    }

    pub fn kind(&self) -> &ResourceKind {
        self.repo.kind()
    }

    /// The process-wide counter, exposed for migration fast-forward.
    pub fn versions(&self) -> &VersionCounter {
        &self.versions
    }

    /// Direct access to the backing repository. Migration writes go here
    /// so records keep their source-issued resource versions.
    pub fn repository(&self) -> Arc<dyn Repository<T>> {
        Arc::clone(&self.repo)
    }

    pub async fn get(&self, filter: &Filter) -> StoreResult<T> {
        let t0 = Instant::now();
        let obj = self.repo.get(filter).await?;
        debug!(kind = %self.kind().kind, took_ms = %t0.elapsed().as_millis(), "store: get ok");
        Ok(obj)
    }

    /// Repository scan narrowed by the options; see `filter_list` for
    /// the aggregate version the result carries.
    pub async fn list(&self, filter: &Filter, opts: &ListOptions) -> StoreResult<ListResult<T>> {
        let t0 = Instant::now();
        let candidates = self.repo.list(filter).await?;
        let (items, resource_version) = filter_list(candidates, opts)?;
        info!(
            kind = %self.kind().kind,
            count = items.len(),
            rv = resource_version,
            took_ms = %t0.elapsed().as_millis(),
            "store: list ok"
        );
        Ok(ListResult { items, resource_version })
    }

    /// Stamp identity and insert strictly. The stored record (fresh
    /// version, uid, creation time) is returned and broadcast as Added.
    pub async fn create(&self, mut obj: T) -> StoreResult<T> {
        let t0 = Instant::now();
        obj.set_resource_version(self.versions.use_resource_version());
        if obj.uid().is_none() {
            obj.set_uid(uuid::Uuid::new_v4().to_string());
        }
        if obj.creation_timestamp().is_none() {
            obj.set_creation_timestamp(chrono::Utc::now());
        }
        if obj.generation() == 0 {
            obj.set_generation(1);
        }
        self.repo.create(&obj).await?;
        let _ = self.events.send(WatchEvent::Added(obj.clone()));
        info!(
            kind = %self.kind().kind,
            name = %obj.name(),
            rv = %obj.resource_version(),
            took_ms = %t0.elapsed().as_millis(),
            "store: create ok"
        );
        Ok(obj)
    }

    /// Stamp a fresh version and replace strictly; `bump_generation` is
    /// for changes to the record's body, not its metadata. Broadcast as Modified.
    pub async fn update(&self, mut obj: T, bump_generation: bool) -> StoreResult<T> {
        let t0 = Instant::now();
        obj.set_resource_version(self.versions.use_resource_version());
        if bump_generation {
            obj.set_generation(obj.generation() + 1);
        }
        self.repo.update(&obj).await?;
        let _ = self.events.send(WatchEvent::Modified(obj.clone()));
        info!(
            kind = %self.kind().kind,
            name = %obj.name(),
            rv = %obj.resource_version(),
            took_ms = %t0.elapsed().as_millis(),
            "store: update ok"
        );
        Ok(obj)
    }

    /// Fetch-then-remove so the Deleted event carries the final record.
    pub async fn delete(&self, filter: &Filter) -> StoreResult<T> {
        let t0 = Instant::now();
        let existing = self.repo.get(filter).await?;
        self.repo.delete(filter).await?;
        let _ = self.events.send(WatchEvent::Deleted(existing.clone()));
        info!(
            kind = %self.kind().kind,
            name = %existing.name(),
            took_ms = %t0.elapsed().as_millis(),
            "store: delete ok"
        );
        Ok(existing)
    }

    /// Snapshot-then-tail subscription.
    ///
    /// Watching from no version (absent, "" or "0") replays nothing and
    /// streams only future changes. Watching from a specific version
    /// first replays every currently matching record as a synthetic
    /// Added event, then streams; a version that does not parse is an
    /// `invalid_filter` error, as on list. The subscription starts
    /// before the snapshot list so nothing written in between is lost;
    /// a record can therefore arrive twice (replay plus live), which
    /// consumers resolve by resource version.
    pub async fn watch(
        &self,
        scope: &Filter,
        opts: &ListOptions,
    ) -> StoreResult<StreamHandle<WatchEvent<T>>> {
        let kind = self.kind().kind.clone();
        info!(kind = %kind, rv = %opts.resource_version.as_deref().unwrap_or("(none)"), "store: watch start");
        let (tx, rx) = mpsc::channel(queue_cap());
        let mut live = self.events.subscribe();

        let replay = match opts.resource_version.as_deref() {
            None | Some("") | Some("0") => Vec::new(),
            Some(rv) => {
                rv.parse::<u64>().map_err(|_| {
                    StoreError::InvalidFilter(format!("resource version {:?} is not numeric", rv))
                })?;
                // replay is "everything currently matching", so only the
                // selector narrows it, not the version
                let snapshot_opts = ListOptions {
                    label_selector: opts.label_selector.clone(),
                    ..Default::default()
                };
                self.list(scope, &snapshot_opts).await?.items
            }
        };

        let selector = opts.label_selector.clone();
        let scope = scope.clone();
        let task = tokio::spawn(async move {
            let t0 = Instant::now();
            let mut sent = 0usize;
            for obj in replay {
                if tx.send(WatchEvent::Added(obj)).await.is_err() {
                    return;
                }
                sent += 1;
            }
            loop {
                match live.recv().await {
                    Ok(ev) => {
                        if !scope.matches(ev.object())
                            || !selector_matches(selector.as_ref(), ev.object().labels())
                        {
                            continue;
                        }
                        if tx.send(ev).await.is_err() {
                            break;
                        }
                        sent += 1;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        metrics::counter!("store_watch_lagged_total", missed);
                        warn!(kind = %kind, missed, "store: watch lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!(kind = %kind, sent, ran_ms = %t0.elapsed().as_millis(), "store: watch ended");
        });
        Ok(StreamHandle { rx, cancel: CancelHandle::new(task) })
    }
}
