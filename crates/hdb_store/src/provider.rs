//! HistoryDB client facade: user logs plus per-bucket activity statistics.
//!
//! Log fragments are appended under `"{user}.{subkey}"`. Activity is recorded
//! in the secondary index; with the default chunked layout each update lands
//! on a random chunk index `"{subkey}.{n}"` so hot buckets spread their index
//! traffic.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures_util::future::join_all;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::StoreResult;
use crate::keys::{day_buckets, log_id, BucketKey, IndexLayout, UserId, DEFAULT_ACTIVITY_CHUNKS};
use crate::store::{GroupId, IoMode, Session, SessionOptions, Store, TimeMarker};

pub struct HistoryProvider {
    store: Arc<dyn Store>,
    groups: Vec<GroupId>,
    min_writes: usize,
    layout: IndexLayout,
    rng: Mutex<SmallRng>,
}

impl HistoryProvider {
    pub fn new(store: Arc<dyn Store>, groups: Vec<GroupId>, min_writes: usize) -> Self {
        let min_writes = min_writes.min(groups.len());
        Self {
            store,
            groups,
            min_writes,
            layout: IndexLayout::Chunked {
                chunks: DEFAULT_ACTIVITY_CHUNKS,
            },
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    pub fn with_index_layout(mut self, layout: IndexLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn index_layout(&self) -> IndexLayout {
        self.layout
    }

    /// Replaces the groups and min-writes threshold; the threshold is clamped
    /// to the number of groups.
    pub fn set_session_parameters(&mut self, groups: Vec<GroupId>, min_writes: usize) {
        self.min_writes = min_writes.min(groups.len());
        self.groups = groups;
    }

    pub fn min_writes(&self) -> usize {
        self.min_writes
    }

    fn session(&self, io_mode: IoMode) -> Session {
        let opts = SessionOptions::new(self.groups.clone())
            .with_io_mode(io_mode)
            .with_min_writes(self.min_writes);
        Session::new(Arc::clone(&self.store), opts)
    }

    fn random_chunk(&self) -> u32 {
        let chunks = self.layout.chunks().max(1);
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..chunks),
            Err(_) => 0,
        }
    }

    /// Appends `data` to the user's log for `subkey`.
    pub async fn add_log(&self, user: &UserId, subkey: &str, data: Bytes) -> StoreResult<()> {
        let id = log_id(user, subkey);
        tracing::debug!(%id, bytes = data.len(), "appending to user log");
        self.session(IoMode::Append)
            .write(&id, TimeMarker::Latest, data)
            .await
            .map(|_| ())
            .inspect_err(|err| tracing::error!(%id, error = %err, "couldn't append to user log"))
    }

    /// Records that `user` was active in `subkey`.
    pub async fn add_activity(&self, user: &UserId, subkey: &str) -> StoreResult<()> {
        let index = self.layout.index_key(subkey, self.random_chunk());
        tracing::debug!(%user, %index, "updating activity index");
        self.session(IoMode::CacheOnly)
            .set_indexes(
                user.as_str(),
                &[index.clone()],
                &[Bytes::copy_from_slice(user.as_str().as_bytes())],
            )
            .await
            .map(|_| ())
            .inspect_err(|err| tracing::error!(%user, %index, error = %err, "couldn't add activity"))
    }

    /// Appends a log record and records activity concurrently; the two
    /// outcomes are reported separately.
    pub async fn add_log_with_activity(
        &self,
        user: &UserId,
        subkey: &str,
        data: Bytes,
    ) -> (StoreResult<()>, StoreResult<()>) {
        tokio::join!(self.add_log(user, subkey, data), self.add_activity(user, subkey))
    }

    /// Concatenated log fragments for `subkeys`, in subkey order.
    ///
    /// Fragments that cannot be read are skipped.
    pub async fn get_user_logs(&self, user: &UserId, subkeys: &[BucketKey]) -> Bytes {
        let mut out = BytesMut::new();
        self.for_user_logs(user, subkeys, |fragment| {
            out.extend_from_slice(fragment);
            true
        })
        .await;
        out.freeze()
    }

    /// [`Self::get_user_logs`] over the day buckets of an epoch-second range.
    pub async fn get_user_logs_between(&self, user: &UserId, begin_secs: u64, end_secs: u64) -> Bytes {
        self.get_user_logs(user, &day_buckets(begin_secs, end_secs)).await
    }

    /// Calls `f` with each non-empty fragment in subkey order until it returns `false`.
    pub async fn for_user_logs<F>(&self, user: &UserId, subkeys: &[BucketKey], mut f: F)
    where
        F: FnMut(&Bytes) -> bool,
    {
        let session = self.session(IoMode::Overwrite);
        let ids: Vec<String> = subkeys.iter().map(|k| log_id(user, k.as_str())).collect();
        let reads = join_all(ids.iter().map(|id| session.read_latest(id))).await;
        for (id, read) in ids.iter().zip(reads) {
            match read {
                Ok(fragment) if fragment.is_empty() => {}
                Ok(fragment) => {
                    if !f(&fragment) {
                        return;
                    }
                }
                Err(err) if err.is_not_found() => {
                    tracing::debug!(%id, "no log fragment");
                }
                Err(err) => {
                    tracing::error!(%id, error = %err, "can't read log fragment");
                }
            }
        }
    }

    /// Users active in any of `subkeys`.
    pub async fn get_active_users(&self, subkeys: &[BucketKey]) -> StoreResult<BTreeSet<UserId>> {
        let index_keys: Vec<String> = subkeys
            .iter()
            .flat_map(|k| self.layout.index_keys(k.as_str()))
            .collect();
        let entries = self
            .session(IoMode::CacheOnly)
            .find_any_indexes(&index_keys)
            .await?;
        Ok(entries
            .iter()
            .map(|entry| UserId::new(entry.value_str().into_owned()))
            .collect())
    }

    /// [`Self::get_active_users`] over the day buckets of an epoch-second range.
    pub async fn get_active_users_between(
        &self,
        begin_secs: u64,
        end_secs: u64,
    ) -> StoreResult<BTreeSet<UserId>> {
        self.get_active_users(&day_buckets(begin_secs, end_secs)).await
    }

    /// Calls `f` with each subkey's active users until it returns `false`.
    pub async fn for_active_users<F>(&self, subkeys: &[BucketKey], mut f: F) -> StoreResult<()>
    where
        F: FnMut(&BucketKey, &BTreeSet<UserId>) -> bool,
    {
        for subkey in subkeys {
            let users = self.get_active_users(std::slice::from_ref(subkey)).await?;
            if !f(subkey, &users) {
                break;
            }
        }
        Ok(())
    }
}
