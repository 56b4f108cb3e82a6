//! Transport seam
//!
//! The engine never touches a socket directly. A [`TransportFactory`] performs the
//! network handshake and authentication, and hands back a [`Transport`] that can
//! open SFTP sub-channels and answer keepalive probes.

use std::sync::Arc;

use async_trait::async_trait;

use super::config::SshConfig;
use super::error::SshError;
use crate::sftp::SftpChannel;

/// Ping 结果类型，区分不同的失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// 连接正常
    Ok,
    /// 超时（可能是网络延迟，可重试）
    Timeout,
    /// IO 错误（物理连接断开，应立即重连）
    IoError,
}

/// Authenticated remote connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new file-transfer sub-channel over this transport
    async fn open_sftp(&self) -> Result<Arc<dyn SftpChannel>, SshError>;

    /// Keepalive round-trip
    async fn ping(&self) -> PingResult;

    /// Close the transport; idempotent
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// Performs the network connect + authentication for a config
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn Transport>, SshError>;
}
