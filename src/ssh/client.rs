//! SSH Client implementation using russh
//!
//! [`RusshTransportFactory`] is the production [`TransportFactory`]: resolve,
//! handshake, authenticate, then hand the `Handle` to its owner task.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::transport::{Transport, TransportFactory};

/// Connects with russh and wraps the resulting handle in a [`HandleController`](super::HandleController)
#[derive(Debug, Clone, Default)]
pub struct RusshTransportFactory;

impl RusshTransportFactory {
    pub fn new() -> Self {
        Self
    }

    async fn authenticate(
        handle: &mut client::Handle<ClientHandler>,
        config: &SshConfig,
    ) -> Result<(), SshError> {
        let result = match &config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
            AuthMethod::Certificate {
                key_path,
                cert_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())?;
                let cert = russh::keys::load_openssh_certificate(cert_path)
                    .map_err(|e| SshError::KeyError(format!("Failed to load certificate: {}", e)))?;
                handle
                    .authenticate_openssh_cert(&config.username, Arc::new(key), cert)
                    .await
                    .map_err(|e| {
                        SshError::AuthenticationFailed(format!(
                            "Certificate authentication failed: {}",
                            e
                        ))
                    })?
            }
        };

        if !result.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportFactory for RusshTransportFactory {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn Transport>, SshError> {
        let addr = format!("{}:{}", config.host, config.port);
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::Transport(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::Transport("No address found".to_string()))?;

        let ssh_config = client::Config {
            // 应用层心跳负责存活检测
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(config.host.clone(), config.port);

        let mut handle = tokio::time::timeout(
            Duration::from_secs(config.timeout_secs),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))??;

        debug!("SSH handshake completed with {}", addr);

        Self::authenticate(&mut handle, config).await?;
        info!("SSH authentication successful for {}@{}", config.username, addr);

        let label = config.key().to_string();
        Ok(Arc::new(spawn_handle_owner_task(handle, label)))
    }
}

/// Client handler for russh callbacks
///
/// Host keys are accepted and their fingerprint logged; trust decisions live
/// above the engine.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

/// SHA256 fingerprint of a host key, hex encoded
pub fn host_key_fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    format!("SHA256:{:x}", hasher.finalize())
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Host key for {}:{} is {}",
            self.host,
            self.port,
            host_key_fingerprint(server_public_key)
        );
        Ok(true)
    }
}
