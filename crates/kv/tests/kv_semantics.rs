//! The key-value backend run through the same contract checks as the
//! in-memory baseline.

use std::sync::Arc;

use arca_core::{Filter, Report, ResourceKind, ResourceRecord, StoreError};
use arca_kv::{KvRepository, MemKv};
use arca_store::Repository;

fn kind() -> ResourceKind {
    ResourceKind::namespaced("wgpolicyk8s.io", "v1alpha2", "PolicyReport", "policyreports")
}

fn repo() -> KvRepository<Report> {
    KvRepository::new(kind(), Arc::new(MemKv::new()))
}

fn report(name: &str, ns: &str) -> Report {
    let mut r = Report::new(&kind(), name, Some(ns));
    r.set_resource_version("1".to_string());
    r
}

fn by_name(name: &str, ns: &str) -> Filter {
    Filter::new().with_name(name).with_namespace(ns)
}

#[tokio::test]
async fn create_then_get_round_trips() {
    let repo = repo();
    let mut r = report("scan-1", "ns1");
    r.body.insert("results".to_string(), serde_json::json!([{ "policy": "p1" }]));
    repo.create(&r).await.unwrap();

    let got = repo.get(&by_name("scan-1", "ns1")).await.unwrap();
    assert_eq!(got, r);
}

#[tokio::test]
async fn strict_semantics_fail_the_same_way_twice() {
    let repo = repo();
    let r = report("scan-1", "ns1");

    assert!(repo.update(&r).await.unwrap_err().is_not_found());
    assert!(repo.update(&r).await.unwrap_err().is_not_found());

    repo.create(&r).await.unwrap();

    assert!(repo.create(&r).await.unwrap_err().is_already_exists());
    assert!(repo.create(&r).await.unwrap_err().is_already_exists());
}

#[tokio::test]
async fn delete_then_get_is_not_found() {
    let repo = repo();
    repo.create(&report("scan-1", "ns1")).await.unwrap();

    repo.delete(&by_name("scan-1", "ns1")).await.unwrap();
    assert!(repo.get(&by_name("scan-1", "ns1")).await.unwrap_err().is_not_found());
    assert!(repo.delete(&by_name("scan-1", "ns1")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn list_scopes_by_namespace_via_prefix() {
    let repo = repo();
    for (name, ns) in [("a", "ns1"), ("b", "ns1"), ("a", "ns2"), ("b", "ns2")] {
        repo.create(&report(name, ns)).await.unwrap();
    }

    let all = repo.list(&Filter::new()).await.unwrap();
    assert_eq!(all.len(), 4);

    let ns1 = repo.list(&Filter::new().with_namespace("ns1")).await.unwrap();
    assert_eq!(ns1.len(), 2);
    assert!(ns1.iter().all(|r| r.namespace() == Some("ns1")));

    let none = repo.list(&Filter::new().with_namespace("ns3")).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn list_order_is_stable_across_calls() {
    let repo = repo();
    for name in ["c", "a", "b"] {
        repo.create(&report(name, "ns1")).await.unwrap();
    }
    let first = repo.list(&Filter::new()).await.unwrap();
    let second = repo.list(&Filter::new()).await.unwrap();
    assert_eq!(first, second);
    let names: Vec<&str> = first.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn point_operations_require_a_name() {
    let repo = repo();
    let unnamed = Filter::new().with_namespace("ns1");
    assert!(matches!(repo.get(&unnamed).await.unwrap_err(), StoreError::InvalidFilter(_)));
    assert!(matches!(repo.delete(&unnamed).await.unwrap_err(), StoreError::InvalidFilter(_)));
}

#[tokio::test]
async fn namespace_filters_never_match_cluster_scoped_records() {
    let cluster = ResourceKind::cluster_scoped(
        "wgpolicyk8s.io",
        "v1alpha2",
        "ClusterPolicyReport",
        "clusterpolicyreports",
    );
    let repo = KvRepository::new(cluster.clone(), Arc::new(MemKv::new()));
    repo.create(&Report::new(&cluster, "scan-1", None)).await.unwrap();

    assert!(repo.get(&by_name("scan-1", "ns1")).await.unwrap_err().is_not_found());
    assert!(repo.delete(&by_name("scan-1", "ns1")).await.unwrap_err().is_not_found());
    assert!(repo.list(&Filter::new().with_namespace("ns1")).await.unwrap().is_empty());
    // the record survives the misses and stays reachable by bare name
    assert_eq!(repo.get(&Filter::new().with_name("scan-1")).await.unwrap().name(), "scan-1");
}

#[tokio::test]
async fn update_replaces_the_stored_value() {
    let repo = repo();
    let mut r = report("scan-1", "ns1");
    repo.create(&r).await.unwrap();

    r.set_resource_version("2".to_string());
    r.body.insert("summary".to_string(), serde_json::json!({ "pass": 9 }));
    repo.update(&r).await.unwrap();

    let got = repo.get(&by_name("scan-1", "ns1")).await.unwrap();
    assert_eq!(got.resource_version(), "2");
    assert_eq!(got, r);
}

#[tokio::test]
async fn concurrent_writers_serialize_without_lost_updates() {
    let repo = Arc::new(repo());
    let mut handles = Vec::new();
    for i in 0..16 {
        let repo = Arc::clone(&repo);
        handles.push(tokio::spawn(async move {
            repo.create(&report(&format!("scan-{}", i), "ns1")).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(repo.list(&Filter::new()).await.unwrap().len(), 16);
}
