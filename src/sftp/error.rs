//! SFTP error types

use serde::Serialize;
use thiserror::Error;

use crate::ssh::SshError;

/// Error taxonomy surfaced to consumers of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad credentials, non-retryable
    Auth,
    /// Network-level failure, retryable through reconnection
    Transport,
    /// Session or channel not obtained within bound
    SessionTimeout,
    /// Operation requested against a tab with no valid connection
    InvalidConnection,
    /// Pending operation discarded because its queue was cleared
    QueueCancelled,
    /// Transfer stopped on request
    TransferCancelled,
    /// Remote filesystem refused the operation
    Operation,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SftpError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SFTP subsystem not available: {0}")]
    SubsystemNotAvailable(String),

    #[error("Session timeout: {0}")]
    SessionTimeout(String),

    /// Waiting for a mid-negotiation connection to become ready timed out
    #[error("Connection not ready: {0}")]
    ReadyTimeout(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Operation cancelled: queue cleared")]
    QueueCancelled,

    #[error("Transfer cancelled")]
    TransferCancelled,

    #[error("Transfer already active: {0}")]
    DuplicateTransfer(String),

    #[error("connection reset")]
    ConnectionReset,

    #[error("connection not ready, retry later")]
    ConnectionNotReady,

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl SftpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SftpError::Auth(_) => ErrorKind::Auth,
            SftpError::Transport(_)
            | SftpError::ChannelError(_)
            | SftpError::SubsystemNotAvailable(_)
            | SftpError::ConnectionReset => ErrorKind::Transport,
            SftpError::SessionTimeout(_)
            | SftpError::ReadyTimeout(_)
            | SftpError::ConnectionNotReady => ErrorKind::SessionTimeout,
            SftpError::InvalidConnection(_) => ErrorKind::InvalidConnection,
            SftpError::QueueCancelled => ErrorKind::QueueCancelled,
            SftpError::TransferCancelled => ErrorKind::TransferCancelled,
            SftpError::FileNotFound(_)
            | SftpError::PermissionDenied(_)
            | SftpError::WriteError(_)
            | SftpError::DuplicateTransfer(_)
            | SftpError::ProtocolError(_) => ErrorKind::Operation,
        }
    }

    /// Map a russh-sftp error onto our variants
    pub fn from_remote(err: impl std::fmt::Display, path: &str) -> Self {
        let err_str = err.to_string();
        if err_str.contains("No such file") || err_str.contains("not found") {
            SftpError::FileNotFound(path.to_string())
        } else if err_str.contains("Permission denied") {
            SftpError::PermissionDenied(path.to_string())
        } else {
            SftpError::ProtocolError(err_str)
        }
    }
}

impl From<SshError> for SftpError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::AuthenticationFailed(msg) | SshError::KeyError(msg) => SftpError::Auth(msg),
            SshError::ChannelError(msg) => SftpError::ChannelError(msg),
            SshError::Timeout(msg) => SftpError::SessionTimeout(msg),
            SshError::NotFound(msg) => SftpError::InvalidConnection(msg),
            other => SftpError::Transport(other.to_string()),
        }
    }
}

impl Serialize for SftpError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert_eq!(SftpError::QueueCancelled.kind(), ErrorKind::QueueCancelled);
        assert_eq!(
            SftpError::InvalidConnection("tab-1".into()).kind(),
            ErrorKind::InvalidConnection
        );
        assert_eq!(
            SftpError::from(SshError::AuthenticationFailed("no".into())).kind(),
            ErrorKind::Auth
        );
        assert_eq!(
            SftpError::from(SshError::Transport("reset".into())).kind(),
            ErrorKind::Transport
        );
    }

    #[test]
    fn test_remote_error_mapping() {
        assert_eq!(
            SftpError::from_remote("No such file", "/tmp/x"),
            SftpError::FileNotFound("/tmp/x".into())
        );
        assert_eq!(
            SftpError::from_remote("Permission denied", "/root"),
            SftpError::PermissionDenied("/root".into())
        );
    }
}
