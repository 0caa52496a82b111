//! HistoryDB log compaction.
//!
//! Rolls the per-bucket fragments of every active user up into one record
//! under a new key and indexes that key, bucket by bucket and batch by batch.
//! Per-item failures are counted in the [`metrics::AggregationResult`];
//! only [`error::ConfigError`]s stop a run.

pub mod batcher;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod fetcher;
pub mod index_updater;
pub mod metrics;
pub mod orchestrator;
pub mod writer;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use hdb_store::{RespStore, Store, StoreError};

pub use config::{CombineArgs, CombineConfig};
pub use context::{PipelineConfig, PipelineContext};
pub use error::{ConfigError, OperationError};
pub use metrics::AggregationResult;
pub use orchestrator::Orchestrator;

/// Connects to the configured remotes and runs the pipeline.
pub async fn combine(config: &CombineConfig) -> anyhow::Result<AggregationResult> {
    let store = match RespStore::connect(&config.remotes, config.resp.clone()).await {
        Ok(store) => store,
        Err(StoreError::NoRemotes) => return Err(ConfigError::NoReachableRemote.into()),
        Err(err) => return Err(err).context("connect to remotes"),
    };
    tracing::info!(
        remotes = config.remotes.len(),
        connections = store.pool_size(),
        groups = ?config.groups,
        min_writes = config.min_writes,
        "connected"
    );
    Ok(combine_with_store(Arc::new(store), config).await)
}

/// Runs the pipeline against an already constructed store.
pub async fn combine_with_store(store: Arc<dyn Store>, config: &CombineConfig) -> AggregationResult {
    let ctx = PipelineContext::new(
        store,
        config.groups.clone(),
        config.min_writes,
        config.pipeline.clone(),
    );
    let orchestrator = Orchestrator::new(ctx);
    let result = orchestrator.run(&config.buckets).await;
    let snapshot = orchestrator.context().metrics.snapshot();
    tracing::debug!(?snapshot, "pipeline counters");
    result
}

/// Writes `result` as pretty JSON to `path`.
pub fn write_summary(path: &Path, result: &AggregationResult) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create summary dir {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(result).context("serialize summary")?;
    std::fs::write(path, json).with_context(|| format!("write summary {}", path.display()))?;
    Ok(())
}
