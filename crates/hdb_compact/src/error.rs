//! Two-tier error model.
//!
//! [`ConfigError`] is fatal and stops the run before any store traffic.
//! [`OperationError`] describes one failed remote call; it is logged and
//! counted by the component that produced it and never escapes a bucket.

use std::fmt;

use hdb_store::resp::RemoteAddrError;
use hdb_store::{BucketKey, StoreError, UserId};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("a new key is required (-n/--new-key)")]
    MissingNewKey,

    #[error("replication groups are required (-g/--groups)")]
    MissingGroups,

    #[error("invalid group list {0:?}")]
    BadGroups(String),

    #[error("at least one remote is required (-r/--remote)")]
    MissingRemotes,

    #[error("invalid remote {input:?}: {source}")]
    BadRemote {
        input: String,
        #[source]
        source: RemoteAddrError,
    },

    #[error("batch size must be positive, got {0}")]
    NonPositiveBatchSize(i64),

    #[error("no buckets to process (use -k/--keys or -t/--time-period)")]
    NoBuckets,

    #[error("invalid time period {0:?}, expected BEGIN:END in epoch seconds")]
    BadTimePeriod(String),

    #[error("none of the configured remotes is reachable")]
    NoReachableRemote,
}

/// Pipeline stage an [`OperationError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovery,
    Fetch,
    Write,
    IndexUpdate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discovery => "discovery",
            Self::Fetch => "fetch",
            Self::Write => "write",
            Self::IndexUpdate => "index update",
        })
    }
}

/// A failed index query, read, write or index update, with enough context to act on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{stage} of {key:?} failed: {source}")]
pub struct OperationError {
    pub stage: Stage,
    pub bucket: Option<BucketKey>,
    pub user: Option<UserId>,
    /// Store id or index key the operation addressed.
    pub key: String,
    #[source]
    pub source: StoreError,
}

impl OperationError {
    pub fn new(stage: Stage, key: impl Into<String>, source: StoreError) -> Self {
        Self {
            stage,
            bucket: None,
            user: None,
            key: key.into(),
            source,
        }
    }

    pub fn with_bucket(mut self, bucket: &BucketKey) -> Self {
        self.bucket = Some(bucket.clone());
        self
    }

    pub fn with_user(mut self, user: &UserId) -> Self {
        self.user = Some(user.clone());
        self
    }

    /// Emits the error at `warn` with its context as structured fields.
    pub fn log(&self) {
        tracing::warn!(
            stage = %self.stage,
            bucket = self.bucket.as_ref().map(BucketKey::as_str),
            user = self.user.as_ref().map(UserId::as_str),
            key = %self.key,
            error = %self.source,
            "operation failed"
        );
    }
}
