//! Explicit context threaded from the orchestrator into every stage.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use hdb_store::{GroupId, IndexLayout, IoMode, Session, SessionOptions, Store, UserId};

use crate::metrics::PipelineMetrics;

pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Parameters of one compaction run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Name of the consolidated key every user's fragment is written under.
    pub new_key: String,
    /// When non-empty, only these users are processed.
    pub allow: BTreeSet<UserId>,
    pub batch_size: NonZeroUsize,
    /// Activity index layout, used for source buckets and the new key alike.
    pub index_layout: IndexLayout,
}

impl PipelineConfig {
    pub fn new(new_key: impl Into<String>) -> Self {
        Self {
            new_key: new_key.into(),
            allow: BTreeSet::new(),
            batch_size: NonZeroUsize::new(DEFAULT_BATCH_SIZE).unwrap_or(NonZeroUsize::MIN),
            index_layout: IndexLayout::Flat,
        }
    }

    pub fn with_allow(mut self, allow: impl IntoIterator<Item = UserId>) -> Self {
        self.allow = allow.into_iter().collect();
        self
    }

    pub fn with_batch_size(mut self, batch_size: NonZeroUsize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_index_layout(mut self, layout: IndexLayout) -> Self {
        self.index_layout = layout;
        self
    }
}

/// Sessions, metrics sink and run parameters shared by all stages.
///
/// Source fragments are read lock-free, consolidated records are written in
/// overwrite mode, and the activity index is accessed in cache mode.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub read_session: Session,
    pub write_session: Session,
    pub index_session: Session,
    pub metrics: Arc<PipelineMetrics>,
}

impl PipelineContext {
    pub fn new(
        store: Arc<dyn Store>,
        groups: Vec<GroupId>,
        min_writes: usize,
        config: PipelineConfig,
    ) -> Self {
        let base = SessionOptions::new(groups).with_min_writes(min_writes);
        let read_session = Session::new(store, base.clone().with_no_lock(true));
        let write_session = read_session.with_options(base.clone().with_io_mode(IoMode::Overwrite));
        let index_session = read_session.with_options(base.with_io_mode(IoMode::CacheOnly));
        Self {
            config,
            read_session,
            write_session,
            index_session,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}
