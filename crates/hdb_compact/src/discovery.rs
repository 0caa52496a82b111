//! Finds the users active in a bucket through the activity index.

use std::collections::BTreeSet;

use hdb_store::{BucketKey, IndexEntry, IndexLayout, Session, UserId};

use crate::context::PipelineContext;
use crate::error::{OperationError, Stage};

pub struct BucketDiscovery {
    session: Session,
    layout: IndexLayout,
}

impl BucketDiscovery {
    pub fn new(session: Session, layout: IndexLayout) -> Self {
        Self { session, layout }
    }

    pub fn from_context(ctx: &PipelineContext) -> Self {
        Self::new(ctx.index_session.clone(), ctx.config.index_layout)
    }

    /// Users indexed under `bucket`, restricted to `allow` when it is non-empty.
    ///
    /// A bucket with no index entries yields an empty set.
    pub async fn discover(
        &self,
        bucket: &BucketKey,
        allow: &BTreeSet<UserId>,
    ) -> Result<BTreeSet<UserId>, OperationError> {
        let index_keys = self.layout.index_keys(bucket.as_str());
        let entries = self
            .session
            .find_any_indexes(&index_keys)
            .await
            .map_err(|err| {
                OperationError::new(Stage::Discovery, bucket.as_str(), err).with_bucket(bucket)
            })?;
        let raw = entries.len();
        let mut users: BTreeSet<UserId> = entries.iter().map(user_of).collect();
        if !allow.is_empty() {
            users.retain(|user| allow.contains(user));
        }
        tracing::debug!(
            bucket = %bucket,
            index_keys = index_keys.len(),
            raw,
            users = users.len(),
            "discovered active users"
        );
        Ok(users)
    }
}

/// The entry's value names the user; entries without one fall back to the object id.
fn user_of(entry: &IndexEntry) -> UserId {
    if entry.value.is_empty() {
        UserId::new(entry.id.clone())
    } else {
        UserId::new(entry.value_str().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hdb_store::{MemoryStore, SessionOptions, StoreError};

    use super::*;

    fn session(store: &Arc<MemoryStore>) -> Session {
        Session::new(store.clone(), SessionOptions::new(vec![1]))
    }

    fn set(names: &[&str]) -> BTreeSet<UserId> {
        names.iter().map(|n| UserId::from(*n)).collect()
    }

    #[tokio::test]
    async fn duplicates_collapse_and_allow_list_intersects() {
        let store = Arc::new(MemoryStore::new());
        store.put_index(&[1], "day5", "u1", "u1");
        store.put_index(&[1], "day5", "u2", "u2");
        store.put_index(&[1], "day5", "u3", "u3");
        store.put_index(&[1], "day5", "u1-dup", "u1");
        let discovery = BucketDiscovery::new(session(&store), IndexLayout::Flat);

        let all = discovery
            .discover(&BucketKey::from("day5"), &BTreeSet::new())
            .await
            .expect("discover");
        assert_eq!(all, set(&["u1", "u2", "u3"]));

        let allowed = discovery
            .discover(&BucketKey::from("day5"), &set(&["u1", "u9"]))
            .await
            .expect("discover");
        assert_eq!(allowed, set(&["u1"]));
    }

    #[tokio::test]
    async fn chunked_layout_queries_every_chunk() {
        let store = Arc::new(MemoryStore::new());
        store.put_index(&[1], "12.0", "a", "a");
        store.put_index(&[1], "12.3", "b", "b");
        store.put_index(&[1], "12", "flat-only", "flat-only");
        let discovery = BucketDiscovery::new(session(&store), IndexLayout::from_chunks(4));
        let users = discovery
            .discover(&BucketKey::from("12"), &BTreeSet::new())
            .await
            .expect("discover");
        assert_eq!(users, set(&["a", "b"]));
    }

    #[tokio::test]
    async fn unknown_bucket_is_empty_and_query_failure_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let discovery = BucketDiscovery::new(session(&store), IndexLayout::Flat);
        let none = discovery
            .discover(&BucketKey::from("nothing"), &BTreeSet::new())
            .await
            .expect("empty bucket is not an error");
        assert!(none.is_empty());

        store.fail_index_query("broken");
        let err = discovery
            .discover(&BucketKey::from("broken"), &BTreeSet::new())
            .await
            .expect_err("query fails");
        assert_eq!(err.stage, Stage::Discovery);
        assert_eq!(err.bucket, Some(BucketKey::from("broken")));
        assert!(matches!(err.source, StoreError::Injected(_)));
    }
}
