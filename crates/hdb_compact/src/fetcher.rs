//! Bulk reads of each batch member's fragment for a bucket.
//!
//! [`BulkFetcher::submit`] starts the read on a background task and returns
//! immediately; [`FetchHandle::join`] harvests it. Responses are matched back
//! to users by store id, never by position.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use hdb_store::keys::log_id;
use hdb_store::{BucketKey, ReadEntry, Session, StoreError, StoreResult, UserId};
use tokio::task::JoinHandle;

use crate::batcher::Batch;
use crate::context::PipelineContext;
use crate::error::{OperationError, Stage};
use crate::metrics::PipelineMetrics;

/// Fetch outcome for one user.
#[derive(Clone, Debug)]
pub struct FetchedEntry {
    pub user: UserId,
    pub result: Result<Bytes, OperationError>,
}

impl FetchedEntry {
    pub fn ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct BulkFetcher {
    session: Session,
    metrics: Arc<PipelineMetrics>,
}

impl BulkFetcher {
    pub fn new(session: Session, metrics: Arc<PipelineMetrics>) -> Self {
        Self { session, metrics }
    }

    pub fn from_context(ctx: &PipelineContext) -> Self {
        Self::new(ctx.read_session.clone(), Arc::clone(&ctx.metrics))
    }

    /// Submits one bulk read covering every user in `batch`.
    pub fn submit(&self, bucket: &BucketKey, batch: &Batch) -> FetchHandle {
        let ids: Vec<String> = batch
            .users
            .iter()
            .map(|user| log_id(user, bucket.as_str()))
            .collect();
        let session = self.session.clone();
        let request = ids.clone();
        let task = tokio::spawn(async move { session.bulk_read(&request).await });
        FetchHandle {
            bucket: bucket.clone(),
            users: batch.users.clone(),
            ids,
            task,
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Submit and join in one step.
    pub async fn fetch(&self, bucket: &BucketKey, batch: &Batch) -> Vec<FetchedEntry> {
        self.submit(bucket, batch).join().await
    }
}

/// An in-flight bulk read.
pub struct FetchHandle {
    bucket: BucketKey,
    users: Vec<UserId>,
    ids: Vec<String>,
    task: JoinHandle<StoreResult<Vec<ReadEntry>>>,
    metrics: Arc<PipelineMetrics>,
}

impl FetchHandle {
    /// Waits for the read and returns one entry per batch member, in batch order.
    pub async fn join(self) -> Vec<FetchedEntry> {
        let outcome = match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => Err(StoreError::Transport(format!("bulk read task failed: {err}"))),
        };
        let mut by_id: HashMap<String, StoreResult<Bytes>> = match outcome {
            Ok(entries) => entries.into_iter().map(|e| (e.id, e.result)).collect(),
            Err(err) => {
                tracing::warn!(bucket = %self.bucket, users = self.users.len(), error = %err, "bulk read failed");
                self.ids.iter().map(|id| (id.clone(), Err(err.clone()))).collect()
            }
        };

        let mut fetched = Vec::with_capacity(self.users.len());
        for (user, id) in self.users.into_iter().zip(self.ids) {
            let result = by_id
                .remove(&id)
                .unwrap_or_else(|| Err(StoreError::Protocol(format!("no response for {id}"))))
                .map_err(|err| {
                    OperationError::new(Stage::Fetch, id.as_str(), err)
                        .with_bucket(&self.bucket)
                        .with_user(&user)
                });
            if let Err(err) = &result {
                err.log();
            }
            self.metrics.record_read(result.is_ok());
            fetched.push(FetchedEntry { user, result });
        }
        fetched
    }
}
