//! Splits a discovered user set into bounded, disjoint batches.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;

use hdb_store::UserId;

/// One slice of a discovery result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// Position within the bucket's batch sequence.
    pub index: usize,
    pub users: Vec<UserId>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Partitions `users` in their sorted order into `ceil(len / size)` batches.
pub fn batch(users: &BTreeSet<UserId>, size: NonZeroUsize) -> Vec<Batch> {
    let ordered: Vec<UserId> = users.iter().cloned().collect();
    ordered
        .chunks(size.get())
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            users: chunk.to_vec(),
        })
        .collect()
}
