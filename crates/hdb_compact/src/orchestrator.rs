//! Drives buckets through discovery, batching, fetch, write and index update.
//!
//! Buckets run strictly in the order given and batches strictly one after
//! another: a batch's writes and index updates are fully joined before the
//! next batch is submitted. Inside a batch everything is concurrent.

use std::time::Instant;

use hdb_store::BucketKey;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::batcher::{self, Batch};
use crate::context::PipelineContext;
use crate::discovery::BucketDiscovery;
use crate::fetcher::BulkFetcher;
use crate::index_updater::IndexUpdater;
use crate::metrics::{AggregationResult, BatchReport, BucketReport};
use crate::writer::AggregationWriter;

/// Per-bucket progress. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketState {
    Discovering,
    Batching,
    FetchingAndWriting,
    Done,
}

pub struct Orchestrator {
    ctx: PipelineContext,
    discovery: BucketDiscovery,
    fetcher: BulkFetcher,
    writer: AggregationWriter,
    updater: IndexUpdater,
}

impl Orchestrator {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            discovery: BucketDiscovery::from_context(&ctx),
            fetcher: BulkFetcher::from_context(&ctx),
            writer: AggregationWriter::from_context(&ctx),
            updater: IndexUpdater::from_context(&ctx),
            ctx,
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Processes every bucket and returns the run report.
    ///
    /// Per-item failures are counted in the report; nothing here aborts the run.
    pub async fn run(&self, buckets: &[BucketKey]) -> AggregationResult {
        let started = Instant::now();
        let mut result = AggregationResult::new(self.ctx.config.new_key.clone());
        tracing::info!(
            buckets = buckets.len(),
            new_key = %self.ctx.config.new_key,
            batch_size = self.ctx.config.batch_size.get(),
            allow = self.ctx.config.allow.len(),
            "starting compaction"
        );
        for bucket in buckets {
            let span = tracing::info_span!("bucket", bucket = %bucket);
            let report = self.run_bucket(bucket).instrument(span).await;
            result.push_bucket(report);
        }
        result.elapsed = started.elapsed();
        result
    }

    async fn run_bucket(&self, bucket: &BucketKey) -> BucketReport {
        let mut report = BucketReport::new(bucket.clone());
        tracing::debug!(state = ?report.state, "bucket started");

        let users = match self.discovery.discover(bucket, &self.ctx.config.allow).await {
            Ok(users) => users,
            Err(err) => {
                err.log();
                report.skipped = true;
                self.ctx.metrics.record_bucket_skipped();
                return report;
            }
        };
        report.discovered = users.len();
        self.ctx.metrics.record_discovered(users.len());

        report.state = advance(report.state, BucketState::Batching);
        let batches = batcher::batch(&users, self.ctx.config.batch_size);
        drop(users);

        report.state = advance(report.state, BucketState::FetchingAndWriting);
        for batch in &batches {
            let batch_report = self.run_batch(bucket, batch).await;
            report.push_batch(batch_report);
        }

        report.state = advance(report.state, BucketState::Done);
        self.ctx.metrics.record_bucket_done();
        tracing::info!(
            discovered = report.discovered,
            batches = report.batches.len(),
            written = report.write.successes,
            failed = report.write.failures,
            bytes = report.write.bytes_written,
            index_failed = report.index_update.failures,
            "bucket done"
        );
        report
    }

    async fn run_batch(&self, bucket: &BucketKey, batch: &Batch) -> BatchReport {
        self.ctx.metrics.record_batch();
        let new_key = self.ctx.config.new_key.as_str();
        let fetched = self.fetcher.submit(bucket, batch).join().await;

        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (write, index_update) = tokio::join!(
            self.writer.write_streaming(fetched, new_key, Some(written_tx)),
            self.updater.update_streamed(written_rx, new_key),
        );
        tracing::debug!(
            batch = batch.index,
            users = batch.len(),
            written = write.successes,
            failed = write.failures,
            indexed = index_update.successes,
            "batch done"
        );
        BatchReport {
            index: batch.index,
            users: batch.len(),
            write,
            index_update,
        }
    }
}

fn advance(from: BucketState, to: BucketState) -> BucketState {
    debug_assert!(to > from, "bucket state moved backwards: {from:?} -> {to:?}");
    tracing::debug!(state = ?to, "bucket state");
    to
}
