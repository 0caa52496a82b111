//! Run counters and the reports built from them.
//!
//! [`PipelineMetrics`] is the shared, lock-free sink every stage records
//! into. [`AggregationResult`] is the per-run report: the orchestrator builds
//! it from per-batch outcomes and prints or serializes it at the end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hdb_store::BucketKey;
use serde::Serialize;

use crate::orchestrator::BucketState;

/// Counters updated by every pipeline stage.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Buckets that reached `Done`.
    buckets_done: AtomicU64,
    /// Buckets skipped because discovery failed.
    buckets_skipped: AtomicU64,
    batches: AtomicU64,
    users_discovered: AtomicU64,
    reads_ok: AtomicU64,
    reads_failed: AtomicU64,
    writes_ok: AtomicU64,
    writes_failed: AtomicU64,
    bytes_written: AtomicU64,
    index_updates_ok: AtomicU64,
    index_updates_failed: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub buckets_done: u64,
    pub buckets_skipped: u64,
    pub batches: u64,
    pub users_discovered: u64,
    pub reads_ok: u64,
    pub reads_failed: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub bytes_written: u64,
    pub index_updates_ok: u64,
    pub index_updates_failed: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_bucket_done(&self) {
        self.buckets_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bucket_skipped(&self) {
        self.buckets_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discovered(&self, users: usize) {
        self.users_discovered
            .fetch_add(users as u64, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, ok: bool) {
        if ok {
            self.reads_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records one successful consolidated write of `bytes` bytes.
    pub fn record_write(&self, bytes: usize) {
        self.writes_ok.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.writes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_update(&self, ok: bool) {
        if ok {
            self.index_updates_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.index_updates_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Captures a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            buckets_done: self.buckets_done.load(Ordering::Relaxed),
            buckets_skipped: self.buckets_skipped.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            users_discovered: self.users_discovered.load(Ordering::Relaxed),
            reads_ok: self.reads_ok.load(Ordering::Relaxed),
            reads_failed: self.reads_failed.load(Ordering::Relaxed),
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            index_updates_ok: self.index_updates_ok.load(Ordering::Relaxed),
            index_updates_failed: self.index_updates_failed.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of the write stage for one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub bytes_written: u64,
    pub successes: u64,
    pub failures: u64,
}

impl WriteSummary {
    pub fn merge(&mut self, other: &WriteSummary) {
        self.bytes_written += other.bytes_written;
        self.successes += other.successes;
        self.failures += other.failures;
    }
}

/// Outcome of the index-update stage for one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub successes: u64,
    pub failures: u64,
}

impl IndexSummary {
    pub fn merge(&mut self, other: &IndexSummary) {
        self.successes += other.successes;
        self.failures += other.failures;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub users: usize,
    pub write: WriteSummary,
    pub index_update: IndexSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketReport {
    pub bucket: BucketKey,
    pub discovered: usize,
    /// Set when discovery failed and the bucket was skipped.
    pub skipped: bool,
    /// Last state the bucket reached.
    pub state: BucketState,
    pub write: WriteSummary,
    pub index_update: IndexSummary,
    pub batches: Vec<BatchReport>,
}

impl BucketReport {
    pub fn new(bucket: BucketKey) -> Self {
        Self {
            bucket,
            discovered: 0,
            skipped: false,
            state: BucketState::Discovering,
            write: WriteSummary::default(),
            index_update: IndexSummary::default(),
            batches: Vec::new(),
        }
    }

    pub fn push_batch(&mut self, batch: BatchReport) {
        self.write.merge(&batch.write);
        self.index_update.merge(&batch.index_update);
        self.batches.push(batch);
    }
}

/// Run-level report. Created fresh for every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationResult {
    pub new_key: String,
    pub bytes_written: u64,
    pub successes: u64,
    pub failures: u64,
    pub index_successes: u64,
    pub index_failures: u64,
    pub buckets: Vec<BucketReport>,
    #[serde(serialize_with = "serialize_duration_ms", rename = "elapsed_ms")]
    pub elapsed: Duration,
}

impl AggregationResult {
    pub fn new(new_key: impl Into<String>) -> Self {
        Self {
            new_key: new_key.into(),
            bytes_written: 0,
            successes: 0,
            failures: 0,
            index_successes: 0,
            index_failures: 0,
            buckets: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn push_bucket(&mut self, bucket: BucketReport) {
        self.bytes_written += bucket.write.bytes_written;
        self.successes += bucket.write.successes;
        self.failures += bucket.write.failures;
        self.index_successes += bucket.index_update.successes;
        self.index_failures += bucket.index_update.failures;
        self.buckets.push(bucket);
    }

    pub fn skipped_buckets(&self) -> usize {
        self.buckets.iter().filter(|b| b.skipped).count()
    }

    /// One-line summary; the binary logs this at the end of a run.
    pub fn summary_line(&self) -> String {
        format!(
            "combined {} bucket(s) into {:?}: {} written, {} failed, {} bytes, index {} ok / {} failed, {} bucket(s) skipped, {:.3}s",
            self.buckets.len(),
            self.new_key,
            self.successes,
            self.failures,
            self.bytes_written,
            self.index_successes,
            self.index_failures,
            self.skipped_buckets(),
            self.elapsed.as_secs_f64(),
        )
    }
}

fn serialize_duration_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
