use thiserror::Error;

use crate::store::GroupId;

/// Failure of a single store operation.
///
/// Every variant is per-operation; callers decide whether it is fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key {id:?} not found")]
    NotFound { id: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("only {acked} of {required} required groups acknowledged the write")]
    InsufficientWrites { acked: usize, required: usize },

    #[error("group {0} rejected the operation")]
    GroupUnavailable(GroupId),

    #[error("no remote endpoint is connected")]
    NoRemotes,

    #[error("injected fault: {0}")]
    Injected(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
