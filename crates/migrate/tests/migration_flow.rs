//! Batch drain and live tail against a scripted in-process source.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use arca_api::{CancelHandle, StreamHandle};
use arca_core::{Filter, Report, ResourceKind, ResourceRecord, StoreError, StoreResult, VersionCounter};
use arca_migrate::{LiveSource, MigrationSummary, Migrator, SourceEvent, VERSION_HEADROOM};
use arca_store::{object_key, MemoryRepository, Repository};

fn kind() -> ResourceKind {
    ResourceKind::namespaced("wgpolicyk8s.io", "v1alpha2", "PolicyReport", "policyreports")
}

fn report(name: &str, ns: &str, rv: &str) -> Report {
    let mut r = Report::new(&kind(), name, Some(ns));
    r.metadata.resource_version = rv.to_string();
    r
}

/// Scripted source: a snapshot to drain, names whose removal fails, and
/// a queue of events replayed to the first subscriber.
#[derive(Default)]
struct MockSource {
    items: Mutex<BTreeMap<String, Report>>,
    deny_removal: Mutex<HashSet<String>>,
    tail: Mutex<Vec<SourceEvent<Report>>>,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
}

impl MockSource {
    fn seed(&self, records: Vec<Report>) {
        let mut items = self.items.lock().unwrap();
        for r in records {
            items.insert(object_key(&r).unwrap(), r);
        }
    }

    fn remaining(&self) -> Vec<String> {
        self.items.lock().unwrap().values().map(|r| r.metadata.name.clone()).collect()
    }
}

#[async_trait]
impl LiveSource<Report> for MockSource {
    async fn list_all(&self) -> StoreResult<Vec<Report>> {
        Ok(self.items.lock().unwrap().values().cloned().collect())
    }

    async fn remove(&self, obj: &Report) -> StoreResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.deny_removal.lock().unwrap().contains(obj.name()) {
            return Err(StoreError::Connection(format!("remove {}: source offline", obj.name())));
        }
        self.items.lock().unwrap().remove(&object_key(obj)?);
        Ok(())
    }

    async fn events(&self) -> StoreResult<StreamHandle<SourceEvent<Report>>> {
        let queued: Vec<_> = self.tail.lock().unwrap().drain(..).collect();
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            for ev in queued {
                if tx.send(ev).await.is_err() {
                    return;
                }
            }
        });
        Ok(StreamHandle { rx, cancel: CancelHandle::new(task) })
    }
}

fn migrator(
    source: &Arc<MockSource>,
    dest: &Arc<MemoryRepository<Report>>,
    versions: &Arc<VersionCounter>,
) -> Migrator<Report> {
    Migrator::new(
        Arc::clone(source) as Arc<dyn LiveSource<Report>>,
        Arc::clone(dest) as Arc<dyn Repository<Report>>,
        Arc::clone(versions),
    )
}

#[tokio::test]
async fn drains_the_source_and_preserves_versions() {
    let source = Arc::new(MockSource::default());
    source.seed(vec![
        report("a", "ns1", "10"),
        report("b", "ns1", "11"),
        report("c", "ns2", "12"),
        report("d", "ns2", "13"),
        report("e", "ns2", "14"),
    ]);
    let dest = Arc::new(MemoryRepository::new(kind()));
    let versions = Arc::new(VersionCounter::new());

    let summary = migrator(&source, &dest, &versions).run().await.unwrap();
    assert_eq!(summary, MigrationSummary { migrated: 5, failed: 0, last_version: 14 });

    let items = dest.list(&Filter::new()).await.unwrap();
    assert_eq!(items.len(), 5);
    // source-issued versions survive, nothing is restamped
    let by_name: BTreeMap<&str, &str> = items
        .iter()
        .map(|r| (r.metadata.name.as_str(), r.metadata.resource_version.as_str()))
        .collect();
    assert_eq!(by_name["a"], "10");
    assert_eq!(by_name["e"], "14");

    assert!(source.remaining().is_empty());
    // fresh versions jump clear of everything migrated
    assert_eq!(versions.use_resource_version(), (14 + VERSION_HEADROOM).to_string());
}

#[tokio::test]
async fn item_failures_are_counted_not_fatal() {
    let source = Arc::new(MockSource::default());
    source.seed(vec![
        report("a", "ns1", "5"),
        report("b", "ns1", "6"),
        report("c", "ns1", "7"),
    ]);
    source.deny_removal.lock().unwrap().insert("b".to_string());
    let dest = Arc::new(MemoryRepository::new(kind()));
    let versions = Arc::new(VersionCounter::new());

    let summary = migrator(&source, &dest, &versions).run().await.unwrap();
    assert_eq!(summary.migrated, 2);
    assert_eq!(summary.failed, 1);
    // the failed item still counts toward the observed high version
    assert_eq!(summary.last_version, 7);

    // b landed in the destination, only its handoff failed
    assert_eq!(dest.list(&Filter::new()).await.unwrap().len(), 3);
    assert_eq!(source.remaining(), vec!["b"]);

    // a re-run converges: b overwrites its own copy and hands off
    source.deny_removal.lock().unwrap().clear();
    let summary = migrator(&source, &dest, &versions).run().await.unwrap();
    assert_eq!(summary, MigrationSummary { migrated: 1, failed: 0, last_version: 6 });
    assert!(source.remaining().is_empty());
}

#[tokio::test]
async fn workers_stay_inside_the_admission_gate() {
    let source = Arc::new(MockSource::default());
    source.seed((0..8).map(|i| report(&format!("r-{}", i), "ns1", &format!("{}", i + 1))).collect());
    let dest = Arc::new(MemoryRepository::new(kind()));
    let versions = Arc::new(VersionCounter::new());

    let summary =
        migrator(&source, &dest, &versions).with_concurrency(2).run().await.unwrap();
    assert_eq!(summary.migrated, 8);
    assert!(
        source.high_water.load(Ordering::SeqCst) <= 2,
        "saw {} concurrent workers",
        source.high_water.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn empty_sources_leave_the_counter_alone() {
    let source = Arc::new(MockSource::default());
    let dest = Arc::new(MemoryRepository::new(kind()));
    let versions = Arc::new(VersionCounter::new());

    let summary = migrator(&source, &dest, &versions).run().await.unwrap();
    assert_eq!(summary, MigrationSummary { migrated: 0, failed: 0, last_version: 0 });
    assert_eq!(versions.use_resource_version(), "1");
}

#[tokio::test]
async fn tail_mirrors_changes_arriving_after_the_batch() {
    let source = Arc::new(MockSource::default());
    source.seed(vec![report("a", "ns1", "10")]);
    {
        let mut tail = source.tail.lock().unwrap();
        // deleting something never copied must be tolerated
        tail.push(SourceEvent::Deleted(report("ghost", "ns1", "9")));
        tail.push(SourceEvent::Applied(report("b", "ns1", "20")));
        tail.push(SourceEvent::Applied(report("a", "ns1", "21")));
        tail.push(SourceEvent::Deleted(report("a", "ns1", "22")));
    }
    let dest = Arc::new(MemoryRepository::new(kind()));
    let versions = Arc::new(VersionCounter::new());

    let (summary, tail) = migrator(&source, &dest, &versions).migrate().await.unwrap();
    assert_eq!(summary.migrated, 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let items = dest.list(&Filter::new()).await.unwrap();
        let names: Vec<&str> = items.iter().map(|r| r.metadata.name.as_str()).collect();
        if names == vec!["b"] {
            assert_eq!(items[0].metadata.resource_version, "20");
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tail never converged, destination holds {:?}",
            names
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tail.cancel();
}
