//! The store capability consumed by the provider and the compaction pipeline.
//!
//! A [`Store`] is a raw backend: it fans an operation out to the replica groups
//! named in [`SessionOptions`] and reports how many acknowledged it. The
//! [`Session`] wrapper binds a backend to one set of options and turns
//! acknowledgement counts into success or failure using the min-writes rule.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{StoreError, StoreResult};

/// Replica group identifier.
pub type GroupId = u32;

/// How a write treats an existing value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IoMode {
    /// Replace whatever is stored under the id.
    #[default]
    Overwrite,
    /// Append the payload to the stored value.
    Append,
    /// Overwrite semantics, hinting the backend that the value is cache data.
    CacheOnly,
}

/// Time tag attached to a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeMarker {
    /// Not a wall-clock timestamp; the latest write simply wins.
    Latest,
    /// Explicit timestamp in epoch seconds.
    At(u64),
}

/// Per-session parameters shared by every operation issued through it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub groups: Vec<GroupId>,
    pub io_mode: IoMode,
    /// Skip backend-side object locking.
    pub no_lock: bool,
    min_writes: usize,
}

impl SessionOptions {
    pub fn new(groups: Vec<GroupId>) -> Self {
        let min_writes = 1.min(groups.len());
        Self {
            groups,
            io_mode: IoMode::Overwrite,
            no_lock: false,
            min_writes,
        }
    }

    pub fn with_io_mode(mut self, io_mode: IoMode) -> Self {
        self.io_mode = io_mode;
        self
    }

    pub fn with_no_lock(mut self, no_lock: bool) -> Self {
        self.no_lock = no_lock;
        self
    }

    /// Sets the min-writes threshold, clamped to the number of groups.
    pub fn with_min_writes(mut self, min_writes: usize) -> Self {
        self.min_writes = min_writes.min(self.groups.len());
        self
    }

    pub fn min_writes(&self) -> usize {
        self.min_writes
    }
}

/// Per-group acknowledgement count for a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteAck {
    pub acked: usize,
    pub total: usize,
}

impl WriteAck {
    /// A mutation needs `min_writes` acknowledgements, and never fewer than one.
    pub fn ensure(self, min_writes: usize) -> StoreResult<Self> {
        let required = min_writes.max(1);
        if self.acked < required {
            return Err(StoreError::InsufficientWrites {
                acked: self.acked,
                required,
            });
        }
        Ok(self)
    }
}

/// One element of a bulk read. Entries may come back in any order.
#[derive(Clone, Debug)]
pub struct ReadEntry {
    pub id: String,
    pub result: StoreResult<Bytes>,
}

/// One match returned by [`Store::find_any_indexes`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Object the index entry belongs to.
    pub id: String,
    /// Index key that matched.
    pub index: String,
    /// Data attached to the entry.
    pub value: Bytes,
}

impl IndexEntry {
    /// The attached value as text; invalid UTF-8 is replaced.
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Entries attached to any of `index_keys`.
    async fn find_any_indexes(
        &self,
        opts: &SessionOptions,
        index_keys: &[String],
    ) -> StoreResult<Vec<IndexEntry>>;

    /// Attaches `id` to every index in `index_keys`, with the matching value.
    async fn set_indexes(
        &self,
        opts: &SessionOptions,
        id: &str,
        index_keys: &[String],
        values: &[Bytes],
    ) -> StoreResult<WriteAck>;

    /// Reads every id independently; a failed id does not fail the call.
    async fn bulk_read(&self, opts: &SessionOptions, ids: &[String]) -> StoreResult<Vec<ReadEntry>>;

    async fn read_latest(&self, opts: &SessionOptions, id: &str) -> StoreResult<Bytes>;

    async fn write(
        &self,
        opts: &SessionOptions,
        id: &str,
        marker: TimeMarker,
        data: Bytes,
    ) -> StoreResult<WriteAck>;
}

/// A store bound to one set of session options.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn Store>,
    opts: SessionOptions,
}

impl Session {
    pub fn new(store: Arc<dyn Store>, opts: SessionOptions) -> Self {
        Self { store, opts }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.opts
    }

    /// Same backend, different options.
    pub fn with_options(&self, opts: SessionOptions) -> Self {
        Self {
            store: Arc::clone(&self.store),
            opts,
        }
    }

    pub async fn find_any_indexes(&self, index_keys: &[String]) -> StoreResult<Vec<IndexEntry>> {
        self.store.find_any_indexes(&self.opts, index_keys).await
    }

    pub async fn set_indexes(
        &self,
        id: &str,
        index_keys: &[String],
        values: &[Bytes],
    ) -> StoreResult<WriteAck> {
        if index_keys.len() != values.len() {
            return Err(StoreError::Protocol(format!(
                "{} index keys but {} values",
                index_keys.len(),
                values.len()
            )));
        }
        self.store
            .set_indexes(&self.opts, id, index_keys, values)
            .await?
            .ensure(self.opts.min_writes())
    }

    pub async fn bulk_read(&self, ids: &[String]) -> StoreResult<Vec<ReadEntry>> {
        self.store.bulk_read(&self.opts, ids).await
    }

    pub async fn read_latest(&self, id: &str) -> StoreResult<Bytes> {
        self.store.read_latest(&self.opts, id).await
    }

    pub async fn write(&self, id: &str, marker: TimeMarker, data: Bytes) -> StoreResult<WriteAck> {
        self.store
            .write(&self.opts, id, marker, data)
            .await?
            .ensure(self.opts.min_writes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_writes_is_clamped_to_group_count() {
        let opts = SessionOptions::new(vec![1, 2]).with_min_writes(5);
        assert_eq!(opts.min_writes(), 2);
        assert_eq!(SessionOptions::new(Vec::new()).min_writes(), 0);
    }

    #[test]
    fn ack_below_threshold_is_rejected() {
        let ack = WriteAck { acked: 1, total: 3 };
        assert!(ack.ensure(1).is_ok());
        assert_eq!(
            ack.ensure(2),
            Err(StoreError::InsufficientWrites {
                acked: 1,
                required: 2
            })
        );
        let none = WriteAck { acked: 0, total: 3 };
        assert!(none.ensure(0).is_err(), "zero acknowledgements never succeed");
    }
}
