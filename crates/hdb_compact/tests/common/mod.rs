//! Shared helpers for pipeline integration tests.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use hdb_compact::{Orchestrator, PipelineConfig, PipelineContext};
use hdb_store::{GroupId, MemoryStore, UserId};

/// Seeds `bucket` in `groups`: one index entry and one fragment per user.
pub fn seed_bucket(store: &MemoryStore, groups: &[GroupId], bucket: &str, fragments: &[(&str, &str)]) {
    for (user, data) in fragments {
        store.put_index(groups, bucket, user, user.to_string());
        store.put(groups, &format!("{user}.{bucket}"), data.to_string());
    }
}

pub fn users(names: &[&str]) -> BTreeSet<UserId> {
    names.iter().map(|n| UserId::from(*n)).collect()
}

pub fn batch_size(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).expect("non-zero batch size")
}

pub fn orchestrator(
    store: &Arc<MemoryStore>,
    groups: Vec<GroupId>,
    min_writes: usize,
    config: PipelineConfig,
) -> Orchestrator {
    Orchestrator::new(PipelineContext::new(store.clone(), groups, min_writes, config))
}

/// Users indexed under `key` in `group`.
pub fn indexed(store: &MemoryStore, group: GroupId, key: &str) -> BTreeSet<UserId> {
    store
        .index_members(group, key)
        .values()
        .map(|v| UserId::new(String::from_utf8_lossy(v).into_owned()))
        .collect()
}
