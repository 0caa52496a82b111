//! Identifiers and key layout shared by the provider and the compaction tool.
//!
//! Every user log fragment lives under `"{user}.{bucket}"`. Activity indexes
//! are either flat (one index named after the bucket) or spread over
//! `"{bucket}.{chunk}"` chunk indexes.

use std::fmt;

use serde::Serialize;

/// Seconds in one day-bucket window.
pub const SECONDS_IN_DAY: u64 = 24 * 60 * 60;

/// Default number of chunk indexes used by the provider for activity.
pub const DEFAULT_ACTIVITY_CHUNKS: u32 = 1000;

/// Opaque, stable identifier for an account.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque identifier for a time window or named log shard.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Bucket for the day containing `epoch_secs`.
    pub fn for_day(epoch_secs: u64) -> Self {
        Self((epoch_secs / SECONDS_IN_DAY).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BucketKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BucketKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Joins a base key and a subkey the way every stored id is built.
pub fn combine_key(base: &str, sub: &str) -> String {
    format!("{base}.{sub}")
}

/// Store id of the log fragment for `user` in `bucket`.
pub fn log_id(user: &UserId, bucket: &str) -> String {
    combine_key(user.as_str(), bucket)
}

/// One bucket per day touched by the inclusive epoch-second range.
///
/// Returns an empty list when `end < begin`.
pub fn day_buckets(begin_secs: u64, end_secs: u64) -> Vec<BucketKey> {
    let first = begin_secs / SECONDS_IN_DAY;
    let last = end_secs / SECONDS_IN_DAY;
    if last < first {
        return Vec::new();
    }
    (first..=last).map(|day| BucketKey::new(day.to_string())).collect()
}

/// How activity entries for a bucket are laid out in the secondary index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IndexLayout {
    /// A single index named after the bucket.
    #[default]
    Flat,
    /// Entries spread over `"{bucket}.{i}"` for `i in 0..chunks`.
    Chunked { chunks: u32 },
}

impl IndexLayout {
    /// `0` or `1` chunks collapse to the flat layout.
    pub fn from_chunks(chunks: u32) -> Self {
        if chunks <= 1 {
            Self::Flat
        } else {
            Self::Chunked { chunks }
        }
    }

    /// Every index key that may hold entries for `bucket`.
    pub fn index_keys(&self, bucket: &str) -> Vec<String> {
        match *self {
            Self::Flat => vec![bucket.to_string()],
            Self::Chunked { chunks } => (0..chunks)
                .map(|chunk| combine_key(bucket, &chunk.to_string()))
                .collect(),
        }
    }

    /// Index key for one specific chunk; flat layouts ignore `chunk`.
    pub fn index_key(&self, bucket: &str, chunk: u32) -> String {
        match *self {
            Self::Flat => bucket.to_string(),
            Self::Chunked { chunks } => combine_key(bucket, &(chunk % chunks).to_string()),
        }
    }

    pub fn chunks(&self) -> u32 {
        match *self {
            Self::Flat => 1,
            Self::Chunked { chunks } => chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ids_join_user_and_bucket_with_a_dot() {
        assert_eq!(log_id(&UserId::from("u1"), "day5"), "u1.day5");
    }

    #[test]
    fn day_buckets_cover_the_inclusive_range() {
        let buckets = day_buckets(SECONDS_IN_DAY * 3 + 10, SECONDS_IN_DAY * 5);
        let names: Vec<_> = buckets.iter().map(|b| b.as_str().to_string()).collect();
        assert_eq!(names, vec!["3", "4", "5"]);
        assert!(day_buckets(SECONDS_IN_DAY * 2, SECONDS_IN_DAY).is_empty());
        assert_eq!(day_buckets(5, 5).len(), 1);
    }

    #[test]
    fn chunked_layout_enumerates_every_chunk() {
        let layout = IndexLayout::from_chunks(3);
        assert_eq!(layout.index_keys("7"), vec!["7.0", "7.1", "7.2"]);
        assert_eq!(layout.index_key("7", 4), "7.1");
        assert_eq!(IndexLayout::from_chunks(0), IndexLayout::Flat);
        assert_eq!(IndexLayout::Flat.index_keys("day5"), vec!["day5"]);
    }
}
