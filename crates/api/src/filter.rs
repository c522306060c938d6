//! List/watch filtering: resource-version matching, label selectors, and
//! the aggregate version callers resume watches from.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use arca_core::{ResourceRecord, StoreError, StoreResult};

/// How a requested resource version constrains candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionMatch {
    /// Keep candidates at or above the requested version.
    NotOlderThan,
    /// Keep only candidates exactly at the requested version.
    Exact,
}

/// Options steering `list` and `watch`.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// None or an empty selector matches everything.
    pub label_selector: Option<LabelSelector>,
    /// On watch, None, "" and "0" all mean "future changes only"; any
    /// other value must be numeric and replays the current set first.
    pub resource_version: Option<String>,
    /// Without a mode, no version filtering happens even when a version
    /// was supplied.
    pub version_match: Option<VersionMatch>,
}

/// Apply version and selector filtering to `candidates`, returning the
/// survivors plus the maximum resource version seen across every
/// candidate (excluded ones included; the aggregate is a resumption
/// token, not a property of the survivors). Empty input aggregates to 1.
///
/// A candidate whose stored version fails to parse is malformed data and
/// a hard error; a malformed requested version is the caller's mistake.
pub fn filter_list<T: ResourceRecord>(
    candidates: Vec<T>,
    opts: &ListOptions,
) -> StoreResult<(Vec<T>, u64)> {
    let desired: Option<u64> = match opts.resource_version.as_deref() {
        None | Some("") => None,
        Some(rv) => Some(rv.parse().map_err(|_| {
            StoreError::InvalidFilter(format!("resource version {:?} is not numeric", rv))
        })?),
    };
    let mut max_seen = 0u64;
    let mut kept = Vec::with_capacity(candidates.len());
    for obj in candidates {
        let rv: u64 = obj.resource_version().parse().map_err(|_| {
            StoreError::InvalidObject(format!(
                "stored resource version {:?} is not numeric",
                obj.resource_version()
            ))
        })?;
        if rv > max_seen {
            max_seen = rv;
        }
        if let (Some(want), Some(mode)) = (desired, opts.version_match) {
            let keep = match mode {
                VersionMatch::NotOlderThan => rv >= want,
                VersionMatch::Exact => rv == want,
            };
            if !keep {
                continue;
            }
        }
        if !selector_matches(opts.label_selector.as_ref(), obj.labels()) {
            continue;
        }
        kept.push(obj);
    }
    Ok((kept, max_seen.max(1)))
}

/// Kubernetes label-selector semantics: `matchLabels` are conjunctive
/// exact matches, `matchExpressions` support In, NotIn, Exists and
/// DoesNotExist with the usual absent-key behavior (absent keys satisfy
/// NotIn and DoesNotExist). Unknown operators never match.
pub fn selector_matches(selector: Option<&LabelSelector>, labels: &BTreeMap<String, String>) -> bool {
    let sel = match selector {
        Some(s) => s,
        None => return true,
    };
    if let Some(match_labels) = &sel.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(exprs) = &sel.match_expressions {
        for expr in exprs {
            let actual = labels.get(&expr.key);
            let values = expr.values.as_deref().unwrap_or(&[]);
            let ok = match expr.operator.as_str() {
                "In" => actual.map_or(false, |v| values.iter().any(|x| x == v)),
                "NotIn" => actual.map_or(true, |v| !values.iter().any(|x| x == v)),
                "Exists" => actual.is_some(),
                "DoesNotExist" => actual.is_none(),
                _ => false,
            };
            if !ok {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_core::{Report, ResourceKind};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn kind() -> ResourceKind {
        ResourceKind::namespaced("wgpolicyk8s.io", "v1alpha2", "PolicyReport", "policyreports")
    }

    fn report(name: &str, rv: &str, labels: &[(&str, &str)]) -> Report {
        let mut r = Report::new(&kind(), name, Some("ns1"));
        r.metadata.resource_version = rv.to_string();
        for (k, v) in labels {
            r.metadata.labels.insert(k.to_string(), v.to_string());
        }
        r
    }

    fn eq_selector(k: &str, v: &str) -> LabelSelector {
        LabelSelector {
            match_labels: Some([(k.to_string(), v.to_string())].into_iter().collect()),
            ..LabelSelector::default()
        }
    }

    fn expr_selector(key: &str, operator: &str, values: &[&str]) -> LabelSelector {
        LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: key.to_string(),
                operator: operator.to_string(),
                values: if values.is_empty() {
                    None
                } else {
                    Some(values.iter().map(|v| v.to_string()).collect())
                },
            }]),
            ..LabelSelector::default()
        }
    }

    #[test]
    fn equality_selector_keeps_only_matching_labels() {
        let candidates = vec![
            report("a", "1", &[("env", "prod")]),
            report("b", "2", &[("env", "dev")]),
            report("c", "3", &[]),
        ];
        let opts = ListOptions { label_selector: Some(eq_selector("env", "prod")), ..Default::default() };
        let (kept, rv) = filter_list(candidates, &opts).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].metadata.name, "a");
        // excluded candidates still feed the aggregate
        assert_eq!(rv, 3);
    }

    #[test]
    fn match_expressions_honor_absent_keys() {
        let labeled = report("a", "1", &[("env", "prod")]);
        let bare = report("b", "2", &[]);

        let in_sel = expr_selector("env", "In", &["prod", "stage"]);
        assert!(selector_matches(Some(&in_sel), labeled.labels()));
        assert!(!selector_matches(Some(&in_sel), bare.labels()));

        let not_in = expr_selector("env", "NotIn", &["prod"]);
        assert!(!selector_matches(Some(&not_in), labeled.labels()));
        assert!(selector_matches(Some(&not_in), bare.labels()));

        let exists = expr_selector("env", "Exists", &[]);
        assert!(selector_matches(Some(&exists), labeled.labels()));
        assert!(!selector_matches(Some(&exists), bare.labels()));

        let absent = expr_selector("env", "DoesNotExist", &[]);
        assert!(!selector_matches(Some(&absent), labeled.labels()));
        assert!(selector_matches(Some(&absent), bare.labels()));

        let unknown = expr_selector("env", "Gt", &["1"]);
        assert!(!selector_matches(Some(&unknown), labeled.labels()));

        // a present but empty selector matches everything, same as none
        assert!(selector_matches(Some(&LabelSelector::default()), bare.labels()));
        assert!(selector_matches(None, bare.labels()));
    }

    #[test]
    fn version_match_modes() {
        let candidates = || vec![report("a", "5", &[]), report("b", "7", &[]), report("c", "9", &[])];

        let not_older = ListOptions {
            resource_version: Some("7".to_string()),
            version_match: Some(VersionMatch::NotOlderThan),
            ..Default::default()
        };
        let (kept, rv) = filter_list(candidates(), &not_older).unwrap();
        assert_eq!(kept.iter().map(|r| r.metadata.name.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(rv, 9);

        let exact = ListOptions {
            resource_version: Some("7".to_string()),
            version_match: Some(VersionMatch::Exact),
            ..Default::default()
        };
        let (kept, _) = filter_list(candidates(), &exact).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].metadata.name, "b");

        // a version with no mode filters nothing
        let no_mode = ListOptions { resource_version: Some("7".to_string()), ..Default::default() };
        let (kept, _) = filter_list(candidates(), &no_mode).unwrap();
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn empty_list_aggregates_to_one() {
        let (kept, rv) = filter_list(Vec::<Report>::new(), &ListOptions::default()).unwrap();
        assert!(kept.is_empty());
        assert_eq!(rv, 1);
    }

    #[test]
    fn malformed_versions_are_hard_errors() {
        let bad_request = ListOptions { resource_version: Some("abc".to_string()), ..Default::default() };
        let err = filter_list(vec![report("a", "1", &[])], &bad_request).unwrap_err();
        assert!(matches!(err, StoreError::InvalidFilter(_)));

        let err = filter_list(vec![report("a", "not-a-number", &[])], &ListOptions::default()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidObject(_)));
    }
}
