//! Resource identity: the capability contract storable records satisfy,
//! the lite metadata shape, and the bundled `Report` record type.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Minimal capability set any storable record must satisfy: identity
/// accessors plus the mutators the owning layer stamps before writes.
///
/// The repository owns no record; it persists and retrieves serialized
/// copies, deriving storage keys from these accessors on every call.
pub trait ResourceRecord:
    Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn name(&self) -> &str;
    /// None for cluster-scoped kinds.
    fn namespace(&self) -> Option<&str>;
    /// Base-10 unsigned integer rendered as a string.
    fn resource_version(&self) -> &str;
    fn set_resource_version(&mut self, rv: String);
    fn uid(&self) -> Option<&str>;
    fn set_uid(&mut self, uid: String);
    fn creation_timestamp(&self) -> Option<DateTime<Utc>>;
    fn set_creation_timestamp(&mut self, ts: DateTime<Utc>);
    fn generation(&self) -> i64;
    fn set_generation(&mut self, generation: i64);
    fn labels(&self) -> &BTreeMap<String, String>;
    fn annotations(&self) -> &BTreeMap<String, String>;
}

/// Object metadata in Kubernetes wire form (camelCase on the wire).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "generation_unset")]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

fn generation_unset(g: &i64) -> bool {
    *g == 0
}

/// A served resource kind (incl. CRD-style report kinds).
///
/// `plural` doubles as the relational table name; the key-value backend
/// derives its key prefix from group/version/kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceKind {
    pub fn namespaced(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced: true,
        }
    }

    pub fn cluster_scoped(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced: false,
        }
    }

    /// "v1/Kind" for the core group, "group/v1/Kind" otherwise.
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// A structured report record: typed metadata plus an arbitrary body kept
/// as raw JSON. The payload is opaque to the store; only identity fields
/// are interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub metadata: Meta,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl Report {
    pub fn new(kind: &ResourceKind, name: &str, namespace: Option<&str>) -> Self {
        Self {
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
            metadata: Meta {
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
                ..Meta::default()
            },
            body: serde_json::Map::new(),
        }
    }
}

impl ResourceRecord for Report {
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    fn resource_version(&self) -> &str {
        &self.metadata.resource_version
    }

    fn set_resource_version(&mut self, rv: String) {
        self.metadata.resource_version = rv;
    }

    fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    fn set_uid(&mut self, uid: String) {
        self.metadata.uid = Some(uid);
    }

    fn creation_timestamp(&self) -> Option<DateTime<Utc>> {
        self.metadata.creation_timestamp
    }

    fn set_creation_timestamp(&mut self, ts: DateTime<Utc>) {
        self.metadata.creation_timestamp = Some(ts);
    }

    fn generation(&self) -> i64 {
        self.metadata.generation
    }

    fn set_generation(&mut self, generation: i64) {
        self.metadata.generation = generation;
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }

    fn annotations(&self) -> &BTreeMap<String, String> {
        &self.metadata.annotations
    }
}
