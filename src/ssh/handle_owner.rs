//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to it
//! through a [`HandleController`], which sends commands over an mpsc channel.
//! The controller is the production [`Transport`]: it opens SFTP sub-channels,
//! answers keepalive probes and tears the connection down.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, key.to_string());
//! let sftp = controller.open_sftp().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Handle;
use russh_sftp::client::SftpSession as RusshSftpSession;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::transport::{PingResult, Transport};
use crate::sftp::{RusshSftpChannel, SftpChannel};

/// Keepalive reply bound
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel and request the `sftp` subsystem on it
    OpenSftp {
        reply_tx: oneshot::Sender<Result<RusshSftpSession, SshError>>,
    },

    /// Ping the connection (for keepalive check)
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning only copies the sender. Any holder has full control over the
/// connection, so it must never leave the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Wrap an existing command sender; `spawn_handle_owner_task` is the usual entry point
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    async fn request_sftp(&self) -> Result<RusshSftpSession, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenSftp { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }
}

#[async_trait]
impl Transport for HandleController {
    async fn open_sftp(&self) -> Result<Arc<dyn SftpChannel>, SshError> {
        let sftp = self.request_sftp().await?;
        Ok(Arc::new(RusshSftpChannel::new(sftp)))
    }

    async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Whether the Handle Owner Task is still running
    fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Open a channel, request the subsystem, and start the SFTP client on its stream
async fn open_sftp_subsystem(
    handle: &Handle<ClientHandler>,
) -> Result<RusshSftpSession, SshError> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SshError::ChannelError(format!("channel open failed: {}", e)))?;

    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| SshError::ChannelError(format!("Failed to request SFTP subsystem: {}", e)))?;

    RusshSftpSession::new(channel.into_stream())
        .await
        .map_err(|e| SshError::ChannelError(e.to_string()))
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a controller for sending commands.
/// `label` is only used for logging.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let handle = handle;
        info!("Handle owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::OpenSftp { reply_tx } => {
                    // 子系统握手期间，其他命令在通道中排队等待
                    let result = open_sftp_subsystem(&handle).await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving SFTP channel for {}", label);
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    // keepalive@openssh.com with want_reply=true
                    let result =
                        match tokio::time::timeout(PING_TIMEOUT, handle.send_keepalive(true)).await
                        {
                            Ok(Ok(())) => {
                                debug!("Keepalive OK for {}", label);
                                PingResult::Ok
                            }
                            Ok(Err(e)) => {
                                let error_str = format!("{:?}", e);
                                if error_str.to_lowercase().contains("disconnect") {
                                    warn!("Keepalive SSH disconnect for {}: {:?}", label, e);
                                    PingResult::IoError
                                } else {
                                    warn!("Keepalive SSH error for {} (soft failure): {:?}", label, e);
                                    PingResult::Timeout
                                }
                            }
                            Err(_) => {
                                warn!("Keepalive timeout for {} (5s)", label);
                                PingResult::Timeout
                            }
                        };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for {}", label);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController { cmd_tx }
}

/// Drain all pending commands, returning Disconnected to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::OpenSftp { reply_tx } => {
                let _ = reply_tx.send(Err(SshError::Disconnected));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_owner_reports_io_error() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        drop(cmd_rx);
        let controller = HandleController::new(cmd_tx);

        assert!(!controller.is_connected());
        assert_eq!(controller.ping().await, PingResult::IoError);
        assert!(matches!(
            controller.open_sftp().await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_drain_replies_disconnected() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (ping_tx, ping_rx) = oneshot::channel();
        let (sftp_tx, sftp_rx) = oneshot::channel();
        cmd_tx
            .send(HandleCommand::Ping { reply_tx: ping_tx })
            .await
            .unwrap();
        cmd_tx
            .send(HandleCommand::OpenSftp { reply_tx: sftp_tx })
            .await
            .unwrap();

        drain_pending_commands(&mut cmd_rx);

        assert_eq!(ping_rx.await.unwrap(), PingResult::IoError);
        assert!(matches!(sftp_rx.await.unwrap(), Err(SshError::Disconnected)));
    }
}
