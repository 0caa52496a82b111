//! Storage layer for HistoryDB tooling.
//!
//! [`store::Store`] is the capability everything else is written against.
//! [`memory::MemoryStore`] backs tests and local runs, [`resp::RespStore`]
//! talks RESP2 to remote endpoints, and [`provider::HistoryProvider`] is the
//! client facade that produces the fragmented logs the compactor consumes.

pub mod error;
pub mod keys;
pub mod memory;
pub mod provider;
pub mod resp;
pub mod resp_server;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use keys::{BucketKey, IndexLayout, UserId};
pub use memory::MemoryStore;
pub use provider::HistoryProvider;
pub use resp::{AddressFamily, RemoteAddr, RespConfig, RespStore};
pub use resp_server::{Keyspace, RespServer};
pub use store::{
    GroupId, IndexEntry, IoMode, ReadEntry, Session, SessionOptions, Store, TimeMarker, WriteAck,
};
