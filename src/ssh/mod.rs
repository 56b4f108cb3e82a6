//! SSH module - connection identity, transports and the connection pool
//!
//! # Features
//! - Transport seam (`Transport` / `TransportFactory`) with a russh implementation
//! - Connection pool keyed by endpoint + credential identity (see `connection_registry`)
//! - Single-flight negotiation, reference counting, idle sweep and heartbeat

mod client;
mod config;
pub mod connection_registry;
mod error;
mod handle_owner;
mod transport;

pub use client::{host_key_fingerprint, ClientHandler, RusshTransportFactory};
pub use config::{AuthMethod, ConnectionKey, SshConfig, TabId};
pub use connection_registry::{
    ConnectionInfo, ConnectionPoolConfig, ConnectionPoolStats, ConnectionRecord, ConnectionRef,
    ConnectionRegistry, LinkEvent,
};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use transport::{PingResult, Transport, TransportFactory};
