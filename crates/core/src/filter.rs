//! Query filter shared by all repository operations.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::resource::ResourceRecord;

/// Transient query descriptor validated per operation.
///
/// An unset (or empty) namespace on `list` means "all namespaces"; point
/// operations (`get`, `delete`) require a name. Empty strings are
/// normalized to unset at construction so backends only ever see one
/// spelling of "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    name: Option<String>,
    namespace: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.name = if name.is_empty() { None } else { Some(name) };
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let ns = namespace.into();
        self.namespace = if ns.is_empty() { None } else { Some(ns) };
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Name is mandatory for point operations.
    pub fn require_name(&self, op: &str) -> StoreResult<&str> {
        self.name()
            .ok_or_else(|| StoreError::InvalidFilter(format!("{} requires a name", op)))
    }

    /// Whether a record satisfies this filter: name matches exactly when
    /// set, namespace matches exactly when set, anything unset matches all.
    pub fn matches<T: ResourceRecord>(&self, obj: &T) -> bool {
        if let Some(name) = self.name() {
            if obj.name() != name {
                return false;
            }
        }
        if let Some(ns) = self.namespace() {
            if obj.namespace() != Some(ns) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Meta, Report};

    fn report(name: &str, ns: Option<&str>) -> Report {
        Report {
            metadata: Meta {
                name: name.to_string(),
                namespace: ns.map(str::to_string),
                ..Meta::default()
            },
            ..Report::default()
        }
    }

    #[test]
    fn empty_strings_normalize_to_unset() {
        let f = Filter::new().with_name("").with_namespace("");
        assert_eq!(f.name(), None);
        assert_eq!(f.namespace(), None);
    }

    #[test]
    fn require_name_rejects_unnamed_filters() {
        let err = Filter::new().require_name("get").unwrap_err();
        assert!(matches!(err, StoreError::InvalidFilter(_)));
        assert_eq!(err.to_string(), "invalid_filter: get requires a name");
        assert_eq!(Filter::new().with_name("a").require_name("get").unwrap(), "a");
    }

    #[test]
    fn matches_by_name_and_namespace() {
        let obj = report("a", Some("ns1"));
        assert!(Filter::new().matches(&obj));
        assert!(Filter::new().with_name("a").matches(&obj));
        assert!(!Filter::new().with_name("b").matches(&obj));
        assert!(Filter::new().with_namespace("ns1").matches(&obj));
        assert!(!Filter::new().with_namespace("ns2").matches(&obj));
        assert!(!Filter::new().with_namespace("ns1").with_name("b").matches(&obj));
    }
}
