//! Records the consolidated key in the activity index for written users.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use hdb_store::{IndexLayout, Session, UserId};
use tokio::sync::mpsc;

use crate::context::PipelineContext;
use crate::error::{OperationError, Stage};
use crate::metrics::{IndexSummary, PipelineMetrics};

pub struct IndexUpdater {
    session: Session,
    layout: IndexLayout,
    metrics: Arc<PipelineMetrics>,
}

impl IndexUpdater {
    pub fn new(session: Session, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            session,
            layout: IndexLayout::Flat,
            metrics,
        }
    }

    pub fn from_context(ctx: &PipelineContext) -> Self {
        Self::new(ctx.index_session.clone(), Arc::clone(&ctx.metrics))
            .with_index_layout(ctx.config.index_layout)
    }

    /// Layout discovery uses for the new key. Entries go to the first chunk
    /// so a chunked lookup of `new_key` finds them.
    pub fn with_index_layout(mut self, layout: IndexLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Indexes every user in `users` under `new_key`, all updates in flight at once.
    pub async fn update_index(&self, users: &BTreeSet<UserId>, new_key: &str) -> IndexSummary {
        let mut pending: FuturesUnordered<_> = users
            .iter()
            .map(|user| self.update_one(user.clone(), new_key))
            .collect();
        let mut summary = IndexSummary::default();
        while let Some(outcome) = pending.next().await {
            self.tally(&mut summary, outcome);
        }
        summary
    }

    /// Indexes users as they arrive on `written` until the sender is dropped
    /// and every submitted update has been joined.
    pub async fn update_streamed(
        &self,
        mut written: mpsc::UnboundedReceiver<UserId>,
        new_key: &str,
    ) -> IndexSummary {
        let mut summary = IndexSummary::default();
        let mut pending = FuturesUnordered::new();
        let mut open = true;
        loop {
            tokio::select! {
                user = written.recv(), if open => match user {
                    Some(user) => pending.push(self.update_one(user, new_key)),
                    None => open = false,
                },
                Some(outcome) = pending.next(), if !pending.is_empty() => {
                    self.tally(&mut summary, outcome);
                }
                else => break,
            }
        }
        summary
    }

    fn tally(&self, summary: &mut IndexSummary, outcome: Result<(), OperationError>) {
        match outcome {
            Ok(()) => {
                summary.successes += 1;
                self.metrics.record_index_update(true);
            }
            Err(err) => {
                err.log();
                summary.failures += 1;
                self.metrics.record_index_update(false);
            }
        }
    }

    async fn update_one(&self, user: UserId, new_key: &str) -> Result<(), OperationError> {
        let keys = [self.layout.index_key(new_key, 0)];
        let values = [Bytes::copy_from_slice(user.as_str().as_bytes())];
        self.session
            .set_indexes(user.as_str(), &keys, &values)
            .await
            .map(|_| ())
            .map_err(|err| {
                OperationError::new(Stage::IndexUpdate, keys[0].as_str(), err).with_user(&user)
            })
    }
}

#[cfg(test)]
mod tests {
    use hdb_store::{MemoryStore, SessionOptions};

    use super::*;

    fn updater(store: &Arc<MemoryStore>) -> IndexUpdater {
        IndexUpdater::new(
            Session::new(store.clone(), SessionOptions::new(vec![1, 2])),
            Arc::new(PipelineMetrics::new()),
        )
    }

    fn set(names: &[&str]) -> BTreeSet<UserId> {
        names.iter().map(|n| UserId::from(*n)).collect()
    }

    #[tokio::test]
    async fn entries_name_the_user_in_every_group() {
        let store = Arc::new(MemoryStore::new());
        let summary = updater(&store)
            .update_index(&set(&["u1", "u2"]), "combined")
            .await;
        assert_eq!(summary, IndexSummary { successes: 2, failures: 0 });
        for group in [1, 2] {
            let members = store.index_members(group, "combined");
            assert_eq!(members.len(), 2);
            assert_eq!(members["u1"], Bytes::from_static(b"u1"));
        }
    }

    #[tokio::test]
    async fn chunked_layout_writes_the_first_chunk() {
        let store = Arc::new(MemoryStore::new());
        let summary = updater(&store)
            .with_index_layout(IndexLayout::from_chunks(16))
            .update_index(&set(&["u1"]), "combined")
            .await;
        assert_eq!(summary.successes, 1);
        assert!(store.index_members(1, "combined").is_empty());
        assert_eq!(store.index_members(1, "combined.0").len(), 1);
    }

    #[tokio::test]
    async fn failures_are_counted_per_user() {
        let store = Arc::new(MemoryStore::new());
        store.fail_index_updates("u2");
        let updater = updater(&store);
        let summary = updater
            .update_index(&set(&["u1", "u2", "u3"]), "combined")
            .await;
        assert_eq!(summary, IndexSummary { successes: 2, failures: 1 });
        assert!(!store.index_members(1, "combined").contains_key("u2"));
        assert_eq!(updater.metrics.snapshot().index_updates_failed, 1);
    }

    #[tokio::test]
    async fn streamed_updates_drain_until_the_sender_closes() {
        let store = Arc::new(MemoryStore::new());
        let updater = updater(&store);
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = async move {
            for name in ["a", "b", "c"] {
                tx.send(UserId::from(name)).expect("receiver alive");
                tokio::task::yield_now().await;
            }
        };
        let ((), summary) = tokio::join!(feed, updater.update_streamed(rx, "k"));
        assert_eq!(summary.successes, 3);
        assert_eq!(store.index_members(2, "k").len(), 3);
    }

    #[tokio::test]
    async fn closed_empty_stream_finishes_immediately() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::unbounded_channel::<UserId>();
        drop(tx);
        let summary = updater(&store).update_streamed(rx, "k").await;
        assert_eq!(summary, IndexSummary::default());
    }
}
