//! Live source over a Kubernetes cluster: drains one kind's objects out
//! of the cluster and hands them off to a repository.

use std::time::Instant;

use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    Client,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use arca_api::{CancelHandle, StreamHandle};
use arca_core::{Report, ResourceKind, ResourceRecord, StoreError, StoreResult};
use async_trait::async_trait;

use crate::{LiveSource, SourceEvent};

/// One served kind of one cluster, reached with ambient credentials.
pub struct ClusterSource {
    client: Client,
    ar: ApiResource,
    kind: ResourceKind,
    namespace: Option<String>,
}

impl ClusterSource {
    /// Connect using kubeconfig or in-cluster credentials. `namespace`
    /// narrows a namespaced kind to one namespace; `None` drains all.
    pub async fn connect(kind: ResourceKind, namespace: Option<&str>) -> StoreResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| StoreError::Connection(format!("kube client: {}", e)))?;
        let gvk = GroupVersionKind {
            group: kind.group.clone(),
            version: kind.version.clone(),
            kind: kind.kind.clone(),
        };
        let ar = ApiResource::from_gvk_with_plural(&gvk, &kind.plural);
        info!(gvk = %kind.gvk_key(), ns = ?namespace, "cluster: source ready");
        Ok(Self { client, ar, kind, namespace: namespace.map(str::to_string) })
    }

    fn list_api(&self) -> Api<DynamicObject> {
        if self.kind.namespaced {
            match self.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.ar),
                None => Api::all_with(self.client.clone(), &self.ar),
            }
        } else {
            Api::all_with(self.client.clone(), &self.ar)
        }
    }

    /// Api bound to one object's namespace, as delete requires.
    fn object_api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if self.kind.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &self.ar)
            }
            _ => Api::all_with(self.client.clone(), &self.ar),
        }
    }
}

#[async_trait]
impl LiveSource<Report> for ClusterSource {
    async fn list_all(&self) -> StoreResult<Vec<Report>> {
        let t0 = Instant::now();
        let list = self
            .list_api()
            .list(&ListParams::default())
            .await
            .map_err(|e| wrap_kube("list", e))?;
        let mut out = Vec::with_capacity(list.items.len());
        for obj in &list.items {
            match decode(obj) {
                Ok(r) => out.push(r),
                Err(e) => {
                    warn!(gvk = %self.kind.gvk_key(), error = %e, "cluster: skipping undecodable object")
                }
            }
        }
        info!(
            gvk = %self.kind.gvk_key(),
            count = out.len(),
            took_ms = %t0.elapsed().as_millis(),
            "cluster: list ok"
        );
        Ok(out)
    }

    async fn remove(&self, obj: &Report) -> StoreResult<()> {
        let api = self.object_api(obj.namespace());
        match api.delete(obj.name(), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // already gone counts as handed off
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(wrap_kube("delete", e)),
        }
    }

    async fn events(&self) -> StoreResult<StreamHandle<SourceEvent<Report>>> {
        let cap = std::env::var("ARCA_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(2048);
        let (tx, rx) = mpsc::channel(cap);
        let api = self.list_api();
        let gvk = self.kind.gvk_key();
        let task = tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default());
            futures::pin_mut!(stream);
            info!(gvk = %gvk, "cluster: watch started");
            loop {
                let ev = match stream.try_next().await {
                    Ok(Some(ev)) => ev,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(gvk = %gvk, error = %e, "cluster: watch error, retrying");
                        continue;
                    }
                };
                match ev {
                    Event::Applied(o) => {
                        if forward(&tx, &o, false, &gvk).await {
                            return;
                        }
                    }
                    Event::Deleted(o) => {
                        if forward(&tx, &o, true, &gvk).await {
                            return;
                        }
                    }
                    Event::Restarted(list) => {
                        debug!(gvk = %gvk, count = list.len(), "cluster: watch restarted");
                        for o in list.iter() {
                            if forward(&tx, o, false, &gvk).await {
                                return;
                            }
                        }
                    }
                }
            }
            warn!(gvk = %gvk, "cluster: watch stream ended");
        });
        Ok(StreamHandle { rx, cancel: CancelHandle::new(task) })
    }
}

/// Decode and send one object; true means the receiver hung up.
async fn forward(
    tx: &mpsc::Sender<SourceEvent<Report>>,
    obj: &DynamicObject,
    deleted: bool,
    gvk: &str,
) -> bool {
    match decode(obj) {
        Ok(r) => {
            let ev = if deleted { SourceEvent::Deleted(r) } else { SourceEvent::Applied(r) };
            tx.send(ev).await.is_err()
        }
        Err(e) => {
            warn!(gvk = %gvk, error = %e, "cluster: skipping undecodable object");
            false
        }
    }
}

/// A dynamic object round-trips through JSON into a `Report`; metadata
/// fields the store does not interpret (managedFields and friends) drop
/// out on the way.
fn decode(obj: &DynamicObject) -> StoreResult<Report> {
    let raw = serde_json::to_value(obj)
        .map_err(|e| StoreError::InvalidObject(format!("serialize object: {}", e)))?;
    serde_json::from_value(raw)
        .map_err(|e| StoreError::InvalidObject(format!("decode object: {}", e)))
}

fn wrap_kube(op: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) => StoreError::Internal(format!("{}: {}", op, ae)),
        other => StoreError::Connection(format!("{}: {}", op, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind() -> ResourceKind {
        ResourceKind::namespaced("wgpolicyk8s.io", "v1alpha2", "PolicyReport", "policyreports")
    }

    fn api_resource() -> ApiResource {
        let k = kind();
        let gvk = GroupVersionKind { group: k.group, version: k.version, kind: k.kind };
        ApiResource::from_gvk_with_plural(&gvk, "policyreports")
    }

    #[test]
    fn dynamic_objects_decode_into_reports() {
        let mut obj = DynamicObject::new("scan-1", &api_resource()).within("ns1");
        obj.metadata.resource_version = Some("42".to_string());
        obj.metadata.labels =
            Some([("env".to_string(), "prod".to_string())].into_iter().collect());
        obj.data = serde_json::json!({ "summary": { "pass": 3, "fail": 1 } });

        let r = decode(&obj).unwrap();
        assert_eq!(r.metadata.name, "scan-1");
        assert_eq!(r.metadata.namespace.as_deref(), Some("ns1"));
        assert_eq!(r.metadata.resource_version, "42");
        assert_eq!(r.api_version, "wgpolicyk8s.io/v1alpha2");
        assert_eq!(r.kind, "PolicyReport");
        assert_eq!(r.metadata.labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(r.body["summary"]["pass"], 3);
    }

    #[test]
    fn uninterpreted_metadata_is_dropped_not_fatal() {
        let mut obj = DynamicObject::new("scan-2", &api_resource()).within("ns1");
        obj.metadata.managed_fields = Some(Vec::new());
        obj.metadata.finalizers = Some(vec!["example.io/protect".to_string()]);
        obj.data = serde_json::json!({});

        let r = decode(&obj).unwrap();
        assert_eq!(r.metadata.name, "scan-2");
        // body holds only non-metadata payload
        assert!(r.body.is_empty());
    }
}
