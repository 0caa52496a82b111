//! Shared helpers for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hdb_store::{AddressFamily, Keyspace, RemoteAddr, RespConfig, RespServer, RespStore};

/// Timeout for individual RESP round trips in tests.
pub const RESP_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a RESP server on a free loopback port.
pub async fn start_server() -> anyhow::Result<RespServer> {
    let addr: SocketAddr = "127.0.0.1:0".parse()?;
    RespServer::start(addr, Arc::new(Keyspace::new())).await
}

pub fn remote_for(server: &RespServer) -> RemoteAddr {
    RemoteAddr {
        host: server.addr().ip().to_string(),
        port: server.addr().port(),
        family: AddressFamily::Inet,
    }
}

/// Connect a store with a small pool to `server`.
pub async fn connect(server: &RespServer) -> anyhow::Result<RespStore> {
    let config = RespConfig {
        op_timeout: RESP_TIMEOUT,
        connections_per_remote: 2,
    };
    Ok(RespStore::connect(&[remote_for(server)], config).await?)
}

/// A loopback address nothing listens on.
pub fn dead_remote() -> anyhow::Result<RemoteAddr> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(RemoteAddr {
        host: "127.0.0.1".to_string(),
        port,
        family: AddressFamily::Inet,
    })
}
