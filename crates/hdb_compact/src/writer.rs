//! Overwrites each fetched fragment under the consolidated key.
//!
//! Every write for a batch is submitted at once and joined individually.
//! Users whose write succeeded are forwarded on an optional channel so the
//! index updater can start on them while other writes are still in flight.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use hdb_store::keys::log_id;
use hdb_store::{Session, TimeMarker, UserId};
use tokio::sync::mpsc;

use crate::context::PipelineContext;
use crate::error::{OperationError, Stage};
use crate::fetcher::FetchedEntry;
use crate::metrics::{PipelineMetrics, WriteSummary};

pub struct AggregationWriter {
    session: Session,
    metrics: Arc<PipelineMetrics>,
}

impl AggregationWriter {
    pub fn new(session: Session, metrics: Arc<PipelineMetrics>) -> Self {
        Self { session, metrics }
    }

    pub fn from_context(ctx: &PipelineContext) -> Self {
        Self::new(ctx.write_session.clone(), Arc::clone(&ctx.metrics))
    }

    pub async fn write(&self, entries: Vec<FetchedEntry>, new_key: &str) -> WriteSummary {
        self.write_streaming(entries, new_key, None).await
    }

    /// Like [`Self::write`], sending each successfully written user on `written`.
    ///
    /// Entries that failed to fetch count as failures and are never written.
    pub async fn write_streaming(
        &self,
        entries: Vec<FetchedEntry>,
        new_key: &str,
        written: Option<mpsc::UnboundedSender<UserId>>,
    ) -> WriteSummary {
        let mut summary = WriteSummary::default();
        let mut pending = FuturesUnordered::new();
        for entry in entries {
            match entry.result {
                Ok(data) => pending.push(self.write_one(entry.user, new_key, data)),
                Err(_) => {
                    summary.failures += 1;
                    self.metrics.record_write_failure();
                }
            }
        }

        while let Some((user, outcome)) = pending.next().await {
            match outcome {
                Ok(bytes) => {
                    summary.successes += 1;
                    summary.bytes_written += bytes as u64;
                    self.metrics.record_write(bytes);
                    if let Some(tx) = &written {
                        // The receiver only goes away if the updater is gone; the write still counts.
                        let _ = tx.send(user);
                    }
                }
                Err(err) => {
                    err.log();
                    summary.failures += 1;
                    self.metrics.record_write_failure();
                }
            }
        }
        summary
    }

    async fn write_one(
        &self,
        user: UserId,
        new_key: &str,
        data: Bytes,
    ) -> (UserId, Result<usize, OperationError>) {
        let id = log_id(&user, new_key);
        let len = data.len();
        let outcome = self
            .session
            .write(&id, TimeMarker::Latest, data)
            .await
            .map(|_| len)
            .map_err(|err| OperationError::new(Stage::Write, id, err).with_user(&user));
        (user, outcome)
    }
}
