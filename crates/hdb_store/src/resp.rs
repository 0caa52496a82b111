//! Remote store backend speaking RESP2 to Redis-compatible endpoints.
//!
//! Replica groups are emulated with key namespaces: object `id` in group `g`
//! lives under `"{g}:{id}"`, and index `k` in group `g` is the hash
//! `"{g}:idx:{k}"` mapping object id to the attached value. Every configured
//! endpoint is treated as an equivalent entry point into the same keyspace;
//! requests are spread over a small connection pool round-robin.
//!
//! The RESP data model has no timestamps, so [`TimeMarker`] is not stored and
//! the latest write to a key wins.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::SinkExt;
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::codec::Framed;

use crate::error::{StoreError, StoreResult};
use crate::store::{
    GroupId, IndexEntry, IoMode, ReadEntry, SessionOptions, Store, TimeMarker, WriteAck,
};

/// Address family of a remote endpoint, using the Linux `AF_*` numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn code(self) -> u8 {
        match self {
            Self::Inet => 2,
            Self::Inet6 => 10,
        }
    }

    fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Inet => addr.is_ipv4(),
            Self::Inet6 => addr.is_ipv6(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteAddrError {
    #[error("expected host:port:family, got {0:?}")]
    Format(String),
    #[error("invalid port {0:?}")]
    Port(String),
    #[error("unknown address family {0:?} (expected 2/inet or 10/inet6)")]
    Family(String),
}

/// A remote endpoint given as `host:port:family`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteAddr {
    pub host: String,
    pub port: u16,
    pub family: AddressFamily,
}

impl FromStr for RemoteAddr {
    type Err = RemoteAddrError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        // The host may itself contain ':' (IPv6), so split from the right.
        let mut parts = input.trim().rsplitn(3, ':');
        let (Some(family), Some(port), Some(host)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(RemoteAddrError::Format(input.to_string()));
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(RemoteAddrError::Format(input.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| RemoteAddrError::Port(port.to_string()))?;
        let family = match family.to_ascii_lowercase().as_str() {
            "2" | "inet" | "ipv4" => AddressFamily::Inet,
            "10" | "inet6" | "ipv6" => AddressFamily::Inet6,
            other => return Err(RemoteAddrError::Family(other.to_string())),
        };
        Ok(Self {
            host: host.to_string(),
            port,
            family,
        })
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.family.code())
    }
}

/// Connection settings for [`RespStore`].
#[derive(Clone, Debug)]
pub struct RespConfig {
    /// Applied to connecting and to every request round trip.
    pub op_timeout: Duration,
    pub connections_per_remote: usize,
}

impl Default for RespConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(60),
            connections_per_remote: 4,
        }
    }
}

struct Slot {
    addr: SocketAddr,
    conn: Mutex<Option<Framed<TcpStream, Resp2>>>,
}

pub struct RespStore {
    slots: Vec<Slot>,
    next: AtomicUsize,
    op_timeout: Duration,
}

impl RespStore {
    /// Connects to every reachable remote.
    ///
    /// A remote that cannot be resolved or connected is logged and skipped;
    /// the call fails only when none of them is reachable.
    pub async fn connect(remotes: &[RemoteAddr], config: RespConfig) -> StoreResult<Self> {
        let per_remote = config.connections_per_remote.max(1);
        let mut slots = Vec::new();
        for remote in remotes {
            let addr = match resolve(remote).await {
                Ok(addr) => addr,
                Err(err) => {
                    tracing::warn!(remote = %remote, error = %err, "couldn't resolve remote");
                    continue;
                }
            };
            let first = match open(addr, config.op_timeout).await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(remote = %remote, error = %err, "couldn't connect to remote");
                    continue;
                }
            };
            tracing::info!(remote = %remote, %addr, "added remote");
            slots.push(Slot {
                addr,
                conn: Mutex::new(Some(first)),
            });
            // Extra pool members connect lazily on first use.
            for _ in 1..per_remote {
                slots.push(Slot {
                    addr,
                    conn: Mutex::new(None),
                });
            }
        }
        if slots.is_empty() {
            return Err(StoreError::NoRemotes);
        }
        Ok(Self {
            slots,
            next: AtomicUsize::new(0),
            op_timeout: config.op_timeout,
        })
    }

    /// Number of pooled connections, connected or not.
    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    async fn request(&self, frame: BytesFrame) -> StoreResult<BytesFrame> {
        let slot = &self.slots[self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len()];
        let mut guard = slot.conn.lock().await;
        if guard.is_none() {
            *guard = Some(open(slot.addr, self.op_timeout).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::NoRemotes);
        };

        let exchange = async {
            conn.send(frame)
                .await
                .map_err(|err| StoreError::Transport(format!("send failed: {err}")))?;
            match conn.next().await {
                Some(Ok(resp)) => Ok(resp),
                Some(Err(err)) => Err(StoreError::Transport(format!("recv failed: {err}"))),
                None => Err(StoreError::Transport("connection closed".to_string())),
            }
        };
        let result = match time::timeout(self.op_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        };
        if let Err(StoreError::Transport(_) | StoreError::Timeout(_)) = &result {
            // The stream may hold a half-read reply; start over on next use.
            *guard = None;
        }
        result
    }

    async fn write_group(
        &self,
        group: GroupId,
        io_mode: IoMode,
        id: &str,
        data: &Bytes,
    ) -> StoreResult<()> {
        let key = object_key(group, id);
        let verb: &'static [u8] = match io_mode {
            IoMode::Append => b"APPEND",
            IoMode::Overwrite | IoMode::CacheOnly => b"SET",
        };
        match self
            .request(command(verb, [key.into_bytes().into(), data.clone()]))
            .await?
        {
            BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
            BytesFrame::Integer(_) if io_mode == IoMode::Append => Ok(()),
            other => Err(unexpected("write", other)),
        }
    }

    async fn set_indexes_group(
        &self,
        group: GroupId,
        id: &str,
        index_keys: &[String],
        values: &[Bytes],
    ) -> StoreResult<()> {
        for (index, value) in index_keys.iter().zip(values) {
            let frame = command(
                b"HSET",
                [
                    index_hash_key(group, index).into_bytes().into(),
                    Bytes::copy_from_slice(id.as_bytes()),
                    value.clone(),
                ],
            );
            match self.request(frame).await? {
                BytesFrame::Integer(_) => {}
                other => return Err(unexpected("set indexes", other)),
            }
        }
        Ok(())
    }

    async fn find_in_group(&self, group: GroupId, index_keys: &[String]) -> StoreResult<Vec<IndexEntry>> {
        let mut out = Vec::new();
        for index in index_keys {
            let frame = command(b"HGETALL", [index_hash_key(group, index).into_bytes().into()]);
            let parts = match self.request(frame).await? {
                BytesFrame::Array(parts) => parts,
                BytesFrame::Null => continue,
                other => return Err(unexpected("find indexes", other)),
            };
            let mut parts = parts.into_iter();
            while let (Some(id), Some(value)) = (parts.next(), parts.next()) {
                let (Some(id), Some(value)) = (frame_bytes(id), frame_bytes(value)) else {
                    return Err(StoreError::Protocol("non-string index entry".to_string()));
                };
                out.push(IndexEntry {
                    id: String::from_utf8_lossy(&id).into_owned(),
                    index: index.clone(),
                    value,
                });
            }
        }
        Ok(out)
    }

    async fn read_one(&self, opts: &SessionOptions, id: &str) -> StoreResult<Bytes> {
        let mut last_err = None;
        for group in &opts.groups {
            let frame = command(b"GET", [object_key(*group, id).into_bytes().into()]);
            match self.request(frame).await {
                Ok(BytesFrame::BulkString(data)) => return Ok(data),
                Ok(BytesFrame::Null) => {}
                Ok(other) => last_err = Some(unexpected("read", other)),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::NotFound { id: id.to_string() }))
    }
}

#[async_trait]
impl Store for RespStore {
    async fn find_any_indexes(
        &self,
        opts: &SessionOptions,
        index_keys: &[String],
    ) -> StoreResult<Vec<IndexEntry>> {
        let results = join_all(
            opts.groups
                .iter()
                .map(|group| async move { (*group, self.find_in_group(*group, index_keys).await) }),
        )
        .await;

        // Groups can diverge; the union is keyed by (index, id) and the first
        // group to report an entry wins.
        let mut merged: BTreeMap<(String, String), Bytes> = BTreeMap::new();
        let mut answered = false;
        let mut last_err = StoreError::NoRemotes;
        for (group, result) in results {
            match result {
                Ok(entries) => {
                    answered = true;
                    for entry in entries {
                        merged.entry((entry.index, entry.id)).or_insert(entry.value);
                    }
                }
                Err(err) => {
                    tracing::debug!(group, error = %err, "index query failed");
                    last_err = err;
                }
            }
        }
        if !answered {
            return Err(last_err);
        }
        Ok(merged
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
        let results = join_all(
            opts.groups
                .iter()
                .map(|group| self.set_indexes_group(*group, id, index_keys, values)),
        )
        .await;
        Ok(ack_from(&results))
    }

    async fn bulk_read(&self, opts: &SessionOptions, ids: &[String]) -> StoreResult<Vec<ReadEntry>> {
        let mut pending: FuturesUnordered<_> = ids
            .iter()
            .map(|id| async move {
                ReadEntry {
                    id: id.clone(),
                    result: self.read_one(opts, id).await,
                }
            })
            .collect();
        let mut entries = Vec::with_capacity(ids.len());
        while let Some(entry) = pending.next().await {
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn read_latest(&self, opts: &SessionOptions, id: &str) -> StoreResult<Bytes> {
        self.read_one(opts, id).await
    }

    async fn write(
        &self,
        opts: &SessionOptions,
        id: &str,
        _marker: TimeMarker,
        data: Bytes,
    ) -> StoreResult<WriteAck> {
        let results = join_all(
            opts.groups
                .iter()
                .map(|group| self.write_group(*group, opts.io_mode, id, &data)),
        )
        .await;
        Ok(ack_from(&results))
    }
}

fn ack_from(results: &[StoreResult<()>]) -> WriteAck {
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        tracing::debug!(error = %err, "group rejected mutation");
    }
    WriteAck {
        acked: results.iter().filter(|r| r.is_ok()).count(),
        total: results.len(),
    }
}

async fn resolve(remote: &RemoteAddr) -> StoreResult<SocketAddr> {
    let candidates = tokio::net::lookup_host((remote.host.as_str(), remote.port))
        .await
        .map_err(|err| StoreError::Transport(format!("resolve {remote}: {err}")))?;
    candidates
        .into_iter()
        .find(|addr| remote.family.matches(addr))
        .ok_or_else(|| StoreError::Transport(format!("no {:?} address for {remote}", remote.family)))
}

async fn open(addr: SocketAddr, timeout: Duration) -> StoreResult<Framed<TcpStream, Resp2>> {
    let socket = match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(socket)) => socket,
        Ok(Err(err)) => return Err(StoreError::Transport(format!("connect to {addr}: {err}"))),
        Err(_) => return Err(StoreError::Timeout(timeout)),
    };
    socket.set_nodelay(true).ok();
    Ok(Framed::new(socket, Resp2::default()))
}

fn object_key(group: GroupId, id: &str) -> String {
    format!("{group}:{id}")
}

fn index_hash_key(group: GroupId, index: &str) -> String {
    format!("{group}:idx:{index}")
}

/// Build a RESP command array frame.
fn command<const N: usize>(verb: &'static [u8], args: [Bytes; N]) -> BytesFrame {
    let mut parts = Vec::with_capacity(N + 1);
    parts.push(BytesFrame::BulkString(Bytes::from_static(verb)));
    parts.extend(args.into_iter().map(BytesFrame::BulkString));
    BytesFrame::Array(parts)
}

fn frame_bytes(frame: BytesFrame) -> Option<Bytes> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Some(b),
        _ => None,
    }
}

fn unexpected(op: &str, frame: BytesFrame) -> StoreError {
    match frame {
        BytesFrame::Error(err) => StoreError::Protocol(format!("{op}: {err}")),
        other => StoreError::Protocol(format!("unexpected {op} response: {other:?}")),
    }
}
