//! Engine configuration file format

use serde::{Deserialize, Serialize};

use crate::session::ReconnectConfig;
use crate::sftp::{QueueConfig, SftpPoolConfig};
use crate::ssh::ConnectionPoolConfig;

/// Current config format version
pub const CONFIG_VERSION: u32 = 1;

/// Contents of `engine.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Transport pool
    #[serde(default)]
    pub pool: ConnectionPoolConfig,

    /// Per-tab SFTP sessions
    #[serde(default)]
    pub sftp: SftpPoolConfig,

    /// Operation queue pacing and history
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            pool: ConnectionPoolConfig::default(),
            sftp: SftpPoolConfig::default(),
            queue: QueueConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{"sftp":{"max_sessions":4},"reconnect":{"max_retries":3}}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.sftp.max_sessions, 4);
        assert_eq!(config.sftp.idle_timeout_secs, 20);
        assert_eq!(config.reconnect.max_retries, 3);
        assert_eq!(config.reconnect.initial_delay_ms, 1000);
        assert_eq!(config.queue.readdir_delay_ms, 50);
        assert_eq!(config.pool.heartbeat_interval_secs, 15);
    }
}
