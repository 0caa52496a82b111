//! In-memory store with replica groups, fault injection and an op journal.
//!
//! Each replica group keeps its own object map and secondary index, so a
//! group can be taken down to exercise the min-writes rule. Bulk reads return
//! their entries in a shuffled order to keep callers honest about mapping
//! responses back to requests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{StoreError, StoreResult};
use crate::store::{
    GroupId, IndexEntry, IoMode, ReadEntry, SessionOptions, Store, TimeMarker, WriteAck,
};

/// Value stored under one id in one group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredValue {
    pub data: Bytes,
    pub marker: TimeMarker,
}

/// Kind of operation recorded in the journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    FindIndexes,
    SetIndexes,
    Read,
    Write,
}

/// One operation observed by the store, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub op: OpKind,
    /// Object id, or the index key for index queries.
    pub id: String,
    pub io_mode: IoMode,
    pub no_lock: bool,
}

#[derive(Default)]
struct GroupData {
    objects: HashMap<String, StoredValue>,
    /// index key -> object id -> value
    indexes: BTreeMap<String, BTreeMap<String, Bytes>>,
}

#[derive(Default)]
struct Faults {
    reads: HashSet<String>,
    writes: HashSet<String>,
    index_updates: HashSet<String>,
    index_queries: HashSet<String>,
    down_groups: HashSet<GroupId>,
}

pub struct MemoryStore {
    groups: RwLock<HashMap<GroupId, GroupData>>,
    faults: RwLock<Faults>,
    journal: Mutex<Vec<JournalEntry>>,
    rng: Mutex<SmallRng>,
    latency: Option<Duration>,
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Transport("memory store lock poisoned".to_string())
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_seed(0x5eed)
    }

    /// Seed for the bulk-read shuffle.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            faults: RwLock::new(Faults::default()),
            journal: Mutex::new(Vec::new()),
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            latency: None,
        }
    }

    /// Delay every operation by `latency` to mimic a network round trip.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Stores `data` under `id` in every listed group, bypassing faults.
    pub fn put(&self, groups: &[GroupId], id: &str, data: impl Into<Bytes>) {
        let data = data.into();
        if let Ok(mut guard) = self.groups.write() {
            for group in groups {
                guard.entry(*group).or_default().objects.insert(
                    id.to_string(),
                    StoredValue {
                        data: data.clone(),
                        marker: TimeMarker::Latest,
                    },
                );
            }
        }
    }

    /// Attaches `id` to `index` with `value` in every listed group, bypassing faults.
    pub fn put_index(&self, groups: &[GroupId], index: &str, id: &str, value: impl Into<Bytes>) {
        let value = value.into();
        if let Ok(mut guard) = self.groups.write() {
            for group in groups {
                guard
                    .entry(*group)
                    .or_default()
                    .indexes
                    .entry(index.to_string())
                    .or_default()
                    .insert(id.to_string(), value.clone());
            }
        }
    }

    pub fn get(&self, group: GroupId, id: &str) -> Option<StoredValue> {
        let guard = self.groups.read().ok()?;
        guard.get(&group)?.objects.get(id).cloned()
    }

    /// Object ids attached to `index` in `group`.
    pub fn index_members(&self, group: GroupId, index: &str) -> BTreeMap<String, Bytes> {
        self.groups
            .read()
            .ok()
            .and_then(|guard| guard.get(&group)?.indexes.get(index).cloned())
            .unwrap_or_default()
    }

    pub fn fail_reads(&self, id: &str) {
        if let Ok(mut faults) = self.faults.write() {
            faults.reads.insert(id.to_string());
        }
    }

    pub fn fail_writes(&self, id: &str) {
        if let Ok(mut faults) = self.faults.write() {
            faults.writes.insert(id.to_string());
        }
    }

    pub fn fail_index_updates(&self, id: &str) {
        if let Ok(mut faults) = self.faults.write() {
            faults.index_updates.insert(id.to_string());
        }
    }

    pub fn fail_index_query(&self, index: &str) {
        if let Ok(mut faults) = self.faults.write() {
            faults.index_queries.insert(index.to_string());
        }
    }

    pub fn set_group_down(&self, group: GroupId, down: bool) {
        if let Ok(mut faults) = self.faults.write() {
            if down {
                faults.down_groups.insert(group);
            } else {
                faults.down_groups.remove(&group);
            }
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.write() {
            *faults = Faults::default();
        }
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal
            .lock()
            .map(|journal| journal.clone())
            .unwrap_or_default()
    }

    pub fn clear_journal(&self) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.clear();
        }
    }

    fn record(&self, op: OpKind, id: &str, opts: &SessionOptions) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(JournalEntry {
                op,
                id: id.to_string(),
                io_mode: opts.io_mode,
                no_lock: opts.no_lock,
            });
        }
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn up_groups(&self, opts: &SessionOptions) -> StoreResult<Vec<GroupId>> {
        let faults = self.faults.read().map_err(poisoned)?;
        Ok(opts
            .groups
            .iter()
            .copied()
            .filter(|group| !faults.down_groups.contains(group))
            .collect())
    }

    fn is_faulted(&self, id: &str, pick: impl Fn(&Faults) -> &HashSet<String>) -> StoreResult<bool> {
        let faults = self.faults.read().map_err(poisoned)?;
        Ok(pick(&faults).contains(id))
    }

    fn read_one(&self, opts: &SessionOptions, id: &str) -> StoreResult<Bytes> {
        if self.is_faulted(id, |f| &f.reads)? {
            return Err(StoreError::Injected(format!("read {id}")));
        }
        let up = self.up_groups(opts)?;
        if up.is_empty() {
            return Err(match opts.groups.first() {
                Some(group) => StoreError::GroupUnavailable(*group),
                None => StoreError::NoRemotes,
            });
        }
        let guard = self.groups.read().map_err(poisoned)?;
        up.iter()
            .find_map(|group| guard.get(group)?.objects.get(id))
            .map(|stored| stored.data.clone())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_any_indexes(
        &self,
        opts: &SessionOptions,
        index_keys: &[String],
    ) -> StoreResult<Vec<IndexEntry>> {
        self.simulate_latency().await;
        for key in index_keys {
            self.record(OpKind::FindIndexes, key, opts);
            if self.is_faulted(key, |f| &f.index_queries)? {
                return Err(StoreError::Injected(format!("find index {key}")));
            }
        }
        let up = self.up_groups(opts)?;
        if up.is_empty() && !opts.groups.is_empty() {
            return Err(StoreError::GroupUnavailable(opts.groups[0]));
        }

        let guard = self.groups.read().map_err(poisoned)?;
        let mut found: BTreeMap<(String, String), Bytes> = BTreeMap::new();
        for group in &up {
            let Some(data) = guard.get(group) else {
                continue;
            };
            for key in index_keys {
                let Some(members) = data.indexes.get(key) else {
                    continue;
                };
                for (id, value) in members {
                    found
                        .entry((key.clone(), id.clone()))
                        .or_insert_with(|| value.clone());
                }
            }
        }
        Ok(found
            .into_iter()
            .map(|((index, id), value)| IndexEntry { id, index, value })
            .collect())
    }

    async fn set_indexes(
        &self,
        opts: &SessionOptions,
        id: &str,
        index_keys: &[String],
        values: &[Bytes],
    ) -> StoreResult<WriteAck> {
        self.simulate_latency().await;
        self.record(OpKind::SetIndexes, id, opts);
        if self.is_faulted(id, |f| &f.index_updates)? {
            return Err(StoreError::Injected(format!("set indexes {id}")));
        }
        let up = self.up_groups(opts)?;
        let mut guard = self.groups.write().map_err(poisoned)?;
        for group in &up {
            let data = guard.entry(*group).or_default();
            for (key, value) in index_keys.iter().zip(values) {
                data.indexes
                    .entry(key.clone())
                    .or_default()
                    .insert(id.to_string(), value.clone());
            }
        }
        Ok(WriteAck {
            acked: up.len(),
            total: opts.groups.len(),
        })
    }

    async fn bulk_read(&self, opts: &SessionOptions, ids: &[String]) -> StoreResult<Vec<ReadEntry>> {
        self.simulate_latency().await;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            self.record(OpKind::Read, id, opts);
            entries.push(ReadEntry {
                id: id.clone(),
                result: self.read_one(opts, id),
            });
        }
        let mut rng = self.rng.lock().map_err(poisoned)?;
        entries.shuffle(&mut *rng);
        Ok(entries)
    }

    async fn read_latest(&self, opts: &SessionOptions, id: &str) -> StoreResult<Bytes> {
        self.simulate_latency().await;
        self.record(OpKind::Read, id, opts);
        self.read_one(opts, id)
    }

    async fn write(
        &self,
        opts: &SessionOptions,
        id: &str,
        marker: TimeMarker,
        data: Bytes,
    ) -> StoreResult<WriteAck> {
        self.simulate_latency().await;
        self.record(OpKind::Write, id, opts);
        if self.is_faulted(id, |f| &f.writes)? {
            return Err(StoreError::Injected(format!("write {id}")));
        }
        let up = self.up_groups(opts)?;
        let mut guard = self.groups.write().map_err(poisoned)?;
        for group in &up {
            let objects = &mut guard.entry(*group).or_default().objects;
            let data = match (opts.io_mode, objects.get(id)) {
                (IoMode::Append, Some(existing)) => {
                    let mut joined = BytesMut::with_capacity(existing.data.len() + data.len());
                    joined.extend_from_slice(&existing.data);
                    joined.extend_from_slice(&data);
                    joined.freeze()
                }
                _ => data.clone(),
            };
            objects.insert(id.to_string(), StoredValue { data, marker });
        }
        Ok(WriteAck {
            acked: up.len(),
            total: opts.groups.len(),
        })
    }
}
