//! SSH Error types

use thiserror::Error;

/// Errors raised while negotiating or using a transport.
///
/// `Clone` so a single negotiation outcome can be handed to every caller that
/// joined the same in-flight attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SshError {
    /// Bad credentials or rejected key. Never retried by the engine.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Network-level failure (connect refused, reset, DNS, ...).
    #[error("Connection failed: {0}")]
    Transport(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error("Connection limit reached: {current}/{max}")]
    LimitReached { current: usize, max: usize },

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Authentication failures are final; everything else may be retried by
    /// the reconnection manager.
    pub fn is_auth(&self) -> bool {
        matches!(self, SshError::AuthenticationFailed(_) | SshError::KeyError(_))
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => SshError::Transport(e.to_string()),
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl From<std::io::Error> for SshError {
    fn from(err: std::io::Error) -> Self {
        SshError::Transport(err.to_string())
    }
}

// Serialized as the display string for the IPC layer
impl serde::Serialize for SshError {
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
    fn test_auth_errors_are_final() {
        assert!(SshError::AuthenticationFailed("denied".into()).is_auth());
        assert!(SshError::KeyError("bad key".into()).is_auth());
        assert!(!SshError::Transport("ECONNRESET".into()).is_auth());
        assert!(!SshError::Timeout("negotiation".into()).is_auth());
    }

    #[test]
    fn test_serializes_as_message() {
        let json = serde_json::to_string(&SshError::Disconnected).unwrap();
        assert_eq!(json, "\"Disconnected\"");
    }
}
