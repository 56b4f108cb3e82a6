//! OxideTerm Engine - remote session connection & operation scheduling
//!
//! Shares SSH transports between tabs, keeps one SFTP session per tab,
//! serializes each tab's file operations and recovers lost links.

pub mod config;
pub mod engine;
pub mod session;
pub mod sftp;
pub mod single_flight;
pub mod ssh;

#[cfg(test)]
mod testing;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{ConfigStorage, EngineConfig};
pub use engine::Engine;
pub use session::{EngineEvent, EventEnvelope, ReconnectState, ReconnectionManager};
pub use sftp::{OperationQueue, SftpError, SftpSessionManager, TransferManager, TransferSnapshot};
pub use ssh::{ConnectionKey, ConnectionRegistry, SshConfig, SshError, TabId};

/// Initialize logging (RUST_LOG overrides the default `info` filter).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
