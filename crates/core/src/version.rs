//! Monotonic resource-version issuance.

use std::sync::Mutex;

/// Process-wide monotonic counter backing optimistic concurrency and watch
/// resumption. Starts at 1; an issued value is never reused.
///
/// One counter serves every repository of a store instance, and it is the
/// single serialization point for version issuance: the owning layer takes
/// a version here before every write. Lifecycle is explicit. The counter is
/// constructed once at startup and shared behind an `Arc`, with no ambient
/// global.
#[derive(Debug)]
pub struct VersionCounter {
    next: Mutex<u64>,
}

impl Default for VersionCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionCounter {
    pub fn new() -> Self {
        Self { next: Mutex::new(1) }
    }

    /// Issue the current version as a decimal string and advance.
    pub fn use_resource_version(&self) -> String {
        let mut next = self.next.lock().unwrap();
        let issued = *next;
        *next += 1;
        issued.to_string()
    }

    /// Fast-forward: a parseable value larger than the current one replaces
    /// it, anything else is a no-op. The counter never goes backwards.
    /// Returns whether it advanced. Used after a bulk migration to jump
    /// past versions consumed by migrated data.
    pub fn set_resource_version(&self, rv: &str) -> bool {
        match rv.parse::<u64>() {
            Ok(v) => {
                let mut next = self.next.lock().unwrap();
                if v > *next {
                    *next = v;
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        }
    }

    /// Current value without consuming it. Diagnostics only.
    pub fn peek(&self) -> u64 {
        *self.next.lock().unwrap()
    }
}
