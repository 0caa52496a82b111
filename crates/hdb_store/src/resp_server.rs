//! Small in-process RESP2 server backed by an in-memory keyspace.
//!
//! It understands exactly the commands [`crate::resp::RespStore`] issues
//! (`PING`, `GET`, `SET`, `APPEND`, `HSET`, `HGETALL`) and is meant for local
//! runs and integration tests of the remote backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

#[derive(Clone, Debug)]
enum Command {
    Ping,
    Get { key: Vec<u8> },
    Set { key: Vec<u8>, value: Vec<u8> },
    Append { key: Vec<u8>, value: Vec<u8> },
    HSet { key: Vec<u8>, field: Vec<u8>, value: Vec<u8> },
    HGetAll { key: Vec<u8> },
}

impl Command {
    fn key(&self) -> Option<&[u8]> {
        match self {
            Self::Ping => None,
            Self::Get { key }
            | Self::Set { key, .. }
            | Self::Append { key, .. }
            | Self::HSet { key, .. }
            | Self::HGetAll { key } => Some(key),
        }
    }
}

/// Keyspace served by [`RespServer`].
#[derive(Default)]
pub struct Keyspace {
    strings: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    hashes: RwLock<HashMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>>,
    rejected: RwLock<HashSet<Vec<u8>>>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.strings.read().ok()?.get(key.as_bytes()).cloned()
    }

    pub fn set(&self, key: &str, value: impl Into<Vec<u8>>) {
        if let Ok(mut strings) = self.strings.write() {
            strings.insert(key.as_bytes().to_vec(), value.into());
        }
    }

    pub fn hash(&self, key: &str) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.hashes
            .read()
            .ok()
            .and_then(|hashes| hashes.get(key.as_bytes()).cloned())
            .unwrap_or_default()
    }

    pub fn hset(&self, key: &str, field: &str, value: impl Into<Vec<u8>>) {
        if let Ok(mut hashes) = self.hashes.write() {
            hashes
                .entry(key.as_bytes().to_vec())
                .or_default()
                .insert(field.as_bytes().to_vec(), value.into());
        }
    }

    /// Every command touching `key` answers with an error until cleared.
    pub fn reject(&self, key: &str) {
        if let Ok(mut rejected) = self.rejected.write() {
            rejected.insert(key.as_bytes().to_vec());
        }
    }

    fn execute(&self, command: Command) -> anyhow::Result<BytesFrame> {
        let rejected = self
            .rejected
            .read()
            .map_err(|_| anyhow::anyhow!("keyspace lock poisoned"))?;
        if let Some(key) = command.key() {
            anyhow::ensure!(!rejected.contains(key), "key rejected");
        }
        drop(rejected);

        let frame = match command {
            Command::Ping => BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
            Command::Get { key } => {
                let strings = self
                    .strings
                    .read()
                    .map_err(|_| anyhow::anyhow!("keyspace lock poisoned"))?;
                match strings.get(&key) {
                    Some(value) => BytesFrame::BulkString(Bytes::from(value.clone())),
                    None => BytesFrame::Null,
                }
            }
            Command::Set { key, value } => {
                self.strings
                    .write()
                    .map_err(|_| anyhow::anyhow!("keyspace lock poisoned"))?
                    .insert(key, value);
                BytesFrame::SimpleString(Bytes::from_static(b"OK"))
            }
            Command::Append { key, value } => {
                let mut strings = self
                    .strings
                    .write()
                    .map_err(|_| anyhow::anyhow!("keyspace lock poisoned"))?;
                let entry = strings.entry(key).or_default();
                entry.extend_from_slice(&value);
                BytesFrame::Integer(entry.len() as i64)
            }
            Command::HSet { key, field, value } => {
                let mut hashes = self
                    .hashes
                    .write()
                    .map_err(|_| anyhow::anyhow!("keyspace lock poisoned"))?;
                let added = hashes.entry(key).or_default().insert(field, value).is_none();
                BytesFrame::Integer(i64::from(added))
            }
            Command::HGetAll { key } => {
                let hashes = self
                    .hashes
                    .read()
                    .map_err(|_| anyhow::anyhow!("keyspace lock poisoned"))?;
                let parts = hashes
                    .get(&key)
                    .into_iter()
                    .flatten()
                    .flat_map(|(field, value)| {
                        [
                            BytesFrame::BulkString(Bytes::from(field.clone())),
                            BytesFrame::BulkString(Bytes::from(value.clone())),
                        ]
                    })
                    .collect();
                BytesFrame::Array(parts)
            }
        };
        Ok(frame)
    }
}

/// Handle to a running server. Dropping it stops the accept loop.
pub struct RespServer {
    addr: SocketAddr,
    keyspace: Arc<Keyspace>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl RespServer {
    /// Binds `addr` (port 0 picks a free port) and starts serving.
    pub async fn start(addr: SocketAddr, keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        let addr = listener.local_addr().context("listener address")?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(listener, Arc::clone(&keyspace), shutdown_rx));
        Ok(Self {
            addr,
            keyspace,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }

    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("resp server task join failed: {err}")),
        }
    }
}

async fn run(
    listener: TcpListener,
    keyspace: Arc<Keyspace>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => return Ok(()),
            accepted = listener.accept() => {
                let (socket, _) = accepted?;
                let keyspace = Arc::clone(&keyspace);
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(socket, keyspace).await {
                        tracing::debug!(error = ?err, "resp connection closed");
                    }
                });
            }
        }
    }
}

async fn handle_conn(socket: TcpStream, keyspace: Arc<Keyspace>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    while let Some(frame) = framed.next().await {
        let resp = match parse_command(frame?).and_then(|cmd| keyspace.execute(cmd)) {
            Ok(resp) => resp,
            Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
        };
        framed.send(resp).await?;
    }
    Ok(())
}

fn parse_command(frame: BytesFrame) -> anyhow::Result<Command> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    anyhow::ensure!(!parts.is_empty(), "empty command");

    let cmd = frame_str_upper(&parts[0]).ok_or_else(|| anyhow::anyhow!("invalid command"))?;
    let arg = |idx: usize, what: &str| {
        frame_bytes(&parts[idx]).ok_or_else(|| anyhow::anyhow!("invalid {what}"))
    };
    match cmd.as_str() {
        "PING" => Ok(Command::Ping),
        "GET" => {
            anyhow::ensure!(parts.len() == 2, "GET expects 1 argument");
            Ok(Command::Get { key: arg(1, "key")? })
        }
        "SET" => {
            anyhow::ensure!(parts.len() == 3, "SET expects 2 arguments");
            Ok(Command::Set {
                key: arg(1, "key")?,
                value: arg(2, "value")?,
            })
        }
        "APPEND" => {
            anyhow::ensure!(parts.len() == 3, "APPEND expects 2 arguments");
            Ok(Command::Append {
                key: arg(1, "key")?,
                value: arg(2, "value")?,
            })
        }
        "HSET" => {
            anyhow::ensure!(parts.len() == 4, "HSET expects 3 arguments");
            Ok(Command::HSet {
                key: arg(1, "key")?,
                field: arg(2, "field")?,
                value: arg(3, "value")?,
            })
        }
        "HGETALL" => {
            anyhow::ensure!(parts.len() == 2, "HGETALL expects 1 argument");
            Ok(Command::HGetAll { key: arg(1, "key")? })
        }
        other => anyhow::bail!("unknown command {other}"),
    }
}

fn frame_str_upper(frame: &BytesFrame) -> Option<String> {
    frame.as_str().map(|s| s.to_ascii_uppercase())
}

fn frame_bytes(frame: &BytesFrame) -> Option<Vec<u8>> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Some(b.to_vec()),
        _ => None,
    }
}
