//! Command line surface and its validation into a typed run configuration.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use hdb_store::keys::day_buckets;
use hdb_store::{BucketKey, GroupId, IndexLayout, RemoteAddr, RespConfig, UserId};

use crate::context::{PipelineConfig, DEFAULT_BATCH_SIZE};
use crate::error::ConfigError;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "hdb-compact", version, about = "HistoryDB log compaction")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short = 'd', long, global = true, env = "HDB_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Roll bucket fragments up under a new key and index it.
    Combine(CombineArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CombineArgs {
    /// Colon-separated bucket keys, e.g. `day5:day6`.
    #[arg(short = 'k', long, env = "HDB_KEYS")]
    pub keys: Option<String>,

    /// `BEGIN:END` in epoch seconds, split into one bucket per day.
    #[arg(short = 't', long = "time-period", env = "HDB_TIME_PERIOD")]
    pub time_period: Option<String>,

    /// Key the consolidated records are written under.
    #[arg(short = 'n', long = "new-key", env = "HDB_NEW_KEY")]
    pub new_key: Option<String>,

    /// Restrict the run to these users (repeatable).
    #[arg(short = 'u', long = "user")]
    pub users: Vec<String>,

    #[arg(
        short = 'b',
        long = "batch-size",
        env = "HDB_BATCH_SIZE",
        default_value_t = DEFAULT_BATCH_SIZE as i64,
        allow_negative_numbers = true
    )]
    pub batch_size: i64,

    /// Remote endpoint as `host:port:family` (repeatable).
    #[arg(short = 'r', long = "remote", env = "HDB_REMOTES", value_delimiter = ',')]
    pub remotes: Vec<String>,

    /// Replication groups separated by `,` or `:` (repeatable).
    #[arg(short = 'g', long = "groups", env = "HDB_GROUPS")]
    pub groups: Vec<String>,

    /// Groups that must acknowledge a write; clamped to the number of groups.
    #[arg(short = 'm', long = "min-writes", env = "HDB_MIN_WRITES", default_value_t = 1)]
    pub min_writes: usize,

    /// Chunks the source activity index is spread over (0 or 1 means flat).
    #[arg(long = "index-chunks", env = "HDB_INDEX_CHUNKS", default_value_t = 0)]
    pub index_chunks: u32,

    /// Connect and per-request timeout for remote operations.
    #[arg(long = "op-timeout", env = "HDB_OP_TIMEOUT", default_value = "60s")]
    pub op_timeout: humantime::Duration,

    /// Pooled connections per remote.
    #[arg(long, env = "HDB_CONNECTIONS", default_value_t = 4)]
    pub connections: usize,

    /// Also write the run report as JSON to this path.
    #[arg(long = "summary-json", env = "HDB_SUMMARY_JSON")]
    pub summary_json: Option<PathBuf>,
}

/// Validated configuration for one `combine` run.
#[derive(Clone, Debug)]
pub struct CombineConfig {
    pub pipeline: PipelineConfig,
    pub buckets: Vec<BucketKey>,
    pub remotes: Vec<RemoteAddr>,
    pub groups: Vec<GroupId>,
    pub min_writes: usize,
    pub resp: RespConfig,
    pub summary_json: Option<PathBuf>,
}

impl CombineArgs {
    pub fn validate(&self) -> Result<CombineConfig, ConfigError> {
        let new_key = self
            .new_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingNewKey)?
            .to_string();

        let groups = parse_groups(&self.groups)?;
        if groups.is_empty() {
            return Err(ConfigError::MissingGroups);
        }

        let remotes = self
            .remotes
            .iter()
            .map(|input| {
                input.parse::<RemoteAddr>().map_err(|source| ConfigError::BadRemote {
                    input: input.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if remotes.is_empty() {
            return Err(ConfigError::MissingRemotes);
        }

        let batch_size = usize::try_from(self.batch_size)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or(ConfigError::NonPositiveBatchSize(self.batch_size))?;

        let buckets = self.buckets()?;
        if buckets.is_empty() {
            return Err(ConfigError::NoBuckets);
        }

        let min_writes = self.min_writes.min(groups.len());
        if min_writes < self.min_writes {
            tracing::warn!(
                requested = self.min_writes,
                groups = groups.len(),
                "min-writes exceeds the number of groups, clamping"
            );
        }

        let pipeline = PipelineConfig::new(new_key)
            .with_allow(
                self.users
                    .iter()
                    .map(|user| user.trim())
                    .filter(|user| !user.is_empty())
                    .map(UserId::new),
            )
            .with_batch_size(batch_size)
            .with_index_layout(IndexLayout::from_chunks(self.index_chunks));

        Ok(CombineConfig {
            pipeline,
            buckets,
            remotes,
            groups,
            min_writes,
            resp: RespConfig {
                op_timeout: Duration::from(self.op_timeout),
                connections_per_remote: self.connections.max(1),
            },
            summary_json: self.summary_json.clone(),
        })
    }

    /// Explicit keys first, then the days of the time period; duplicates dropped.
    fn buckets(&self) -> Result<Vec<BucketKey>, ConfigError> {
        let mut buckets: Vec<BucketKey> = Vec::new();
        if let Some(keys) = &self.keys {
            buckets.extend(
                keys.split(':')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(BucketKey::from),
            );
        }
        if let Some(period) = &self.time_period {
            let (begin, end) = parse_time_period(period)?;
            buckets.extend(day_buckets(begin, end));
        }
        let mut seen = std::collections::HashSet::new();
        buckets.retain(|bucket| seen.insert(bucket.clone()));
        Ok(buckets)
    }
}

fn parse_groups(inputs: &[String]) -> Result<Vec<GroupId>, ConfigError> {
    let mut groups = Vec::new();
    for token in inputs
        .iter()
        .flat_map(|input| input.split([',', ':']))
        .map(str::trim)
        .filter(|token| !token.is_empty())
    {
        let group = token
            .parse::<GroupId>()
            .map_err(|_| ConfigError::BadGroups(token.to_string()))?;
        if !groups.contains(&group) {
            groups.push(group);
        }
    }
    Ok(groups)
}

fn parse_time_period(input: &str) -> Result<(u64, u64), ConfigError> {
    let bad = || ConfigError::BadTimePeriod(input.to_string());
    let (begin, end) = input.trim().split_once(':').ok_or_else(bad)?;
    let begin = begin.trim().parse::<u64>().map_err(|_| bad())?;
    let end = end.trim().parse::<u64>().map_err(|_| bad())?;
    if end < begin {
        return Err(bad());
    }
    Ok((begin, end))
}
