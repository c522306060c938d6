//! Arca core types: resource records, filters, errors, version issuance.

#![forbid(unsafe_code)]

pub mod error;
pub mod filter;
pub mod resource;
pub mod version;

pub use error::{StoreError, StoreResult};
pub use filter::Filter;
pub use resource::{Meta, Report, ResourceKind, ResourceRecord};
pub use version::VersionCounter;

pub mod prelude {
    pub use super::{
        Filter, Meta, Report, ResourceKind, ResourceRecord, StoreError, StoreResult,
        VersionCounter,
    };
}
