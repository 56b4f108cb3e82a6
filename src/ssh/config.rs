//! SSH Configuration and connection identity

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Handshake + authentication timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// SSH certificate authentication (OpenSSH certificates)
    Certificate {
        /// Path to private key file
        key_path: String,
        /// Path to certificate file (*-cert.pub)
        cert_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    /// Stable digest of the credential material.
    ///
    /// Two configs that authenticate differently never share a transport, but the
    /// secret itself never appears in a key or a log line.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            AuthMethod::Password { password } => {
                hasher.update(b"password\0");
                hasher.update(password.as_bytes());
            }
            AuthMethod::Key { key_path, .. } => {
                // passphrase 不参与：同一把密钥解锁后是同一身份
                hasher.update(b"key\0");
                hasher.update(key_path.as_bytes());
            }
            AuthMethod::Certificate {
                key_path,
                cert_path,
                ..
            } => {
                hasher.update(b"cert\0");
                hasher.update(key_path.as_bytes());
                hasher.update(b"\0");
                hasher.update(cert_path.as_bytes());
            }
        }
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

impl SshConfig {
    /// Create a config with password authentication
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: AuthMethod::password(password),
            timeout_secs: default_timeout(),
        }
    }

    /// Identity of the transport this config negotiates
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(&self.host, self.port, &self.username, self.auth.fingerprint())
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthMethod::Password {
                password: String::new(),
            },
            timeout_secs: 30,
        }
    }
}

/// Identity of a pooled transport: endpoint + user + credential fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_fingerprint: String,
}

impl ConnectionKey {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth_fingerprint: auth_fingerprint.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}#{}",
            self.username, self.host, self.port, self.auth_fingerprint
        )
    }
}

/// Logical UI tab identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(String);

impl TabId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TabId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TabId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_depends_on_credentials() {
        let a = SshConfig::with_password("example.com", 22, "alice", "one");
        let b = SshConfig::with_password("example.com", 22, "alice", "two");
        let a2 = SshConfig::with_password("example.com", 22, "alice", "one");

        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), a2.key());
    }

    #[test]
    fn test_key_display_hides_secret() {
        let config = SshConfig::with_password("example.com", 2222, "bob", "hunter2");
        let shown = config.key().to_string();
        assert!(shown.starts_with("bob@example.com:2222#"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_key_passphrase_ignored() {
        let a = AuthMethod::key("~/.ssh/id_ed25519", Some("pass-a".into()));
        let b = AuthMethod::key("~/.ssh/id_ed25519", None);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_config_deserialize_defaults() {
        let json = r#"{"host":"h","username":"u","auth":{"type":"password","password":"p"}}"#;
        let config: SshConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.timeout_secs, 30);
    }
}
