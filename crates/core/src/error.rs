//! Error taxonomy shared by every backend.

use serde::{Deserialize, Serialize};

/// Store errors, shaped for transport to a protocol layer.
///
/// Backend crates map driver errors into these categories where a clear
/// mapping exists (zero rows affected -> `NotFound`, serde failure ->
/// `InvalidObject`) and wrap everything else as `Connection`/`Internal`
/// with kind and operation context.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("invalid_filter: {0}")]
    InvalidFilter(String),
    #[error("connection: {0}")]
    Connection(String),
    #[error("invalid_object: {0}")]
    InvalidObject(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// True when the error means "the key is definitively absent".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// True when the error means "the key is definitively present".
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}
