//! Engine facade
//!
//! Owns the four cooperating components and wires them together:
//!
//! ```text
//!   Engine
//!   ├── ConnectionRegistry ──LinkEvent::Down──┐
//!   ├── SftpSessionManager ◀── close sessions ┤
//!   ├── OperationQueue                        │
//!   ├── ReconnectionManager ◀── connection lost
//!   └── EventBus ──reconnectAbandoned──▶ registry.end_recovery
//! ```

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::session::{
    EngineEvent, EngineEventListener, EventBus, EventEnvelope, ListenerId, ReconnectState,
    ReconnectionManager, RegisterOptions,
};
use crate::sftp::transfer;
use crate::sftp::{
    self, FileInfo, OperationKind, OperationOptions, OperationQueue, OperationRecord, SftpChannel,
    SftpError, SftpPoolStats, SftpSessionManager, TransferDirection, TransferGuard,
    TransferManager, TransferSnapshot, TransferTask,
};
use crate::ssh::{
    ConnectionKey, ConnectionPoolStats, ConnectionRef, ConnectionRegistry, LinkEvent,
    RusshTransportFactory, SshConfig, SshError, TabId, TransportFactory,
};

pub struct Engine {
    config: EngineConfig,
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SftpSessionManager>,
    queue: Arc<OperationQueue>,
    reconnection: Arc<ReconnectionManager>,
    events: Arc<EventBus>,
    transfers: Arc<TransferManager>,
    wiring: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build the engine and start its background wiring. Must run inside a tokio runtime.
    pub fn new(factory: Arc<dyn TransportFactory>, config: EngineConfig) -> Arc<Self> {
        let registry = ConnectionRegistry::new(factory, config.pool.clone());
        let sessions = SftpSessionManager::new(registry.clone(), config.sftp.clone());
        let queue = OperationQueue::new(sessions.clone(), config.queue.clone());
        let events = Arc::new(EventBus::new());
        let reconnection =
            ReconnectionManager::new(registry.clone(), events.clone(), config.reconnect.clone());

        registry.start_sweeper();

        let engine = Arc::new(Self {
            config,
            registry,
            sessions,
            queue,
            reconnection,
            events,
            transfers: Arc::new(TransferManager::new()),
            wiring: Mutex::new(None),
        });
        engine.start_wiring();
        info!("Engine started");
        engine
    }

    /// Engine over real SSH connections
    pub fn with_russh(config: EngineConfig) -> Arc<Self> {
        Self::new(Arc::new(RusshTransportFactory::new()), config)
    }

    fn start_wiring(&self) {
        let mut links = self.registry.subscribe_links();
        let mut events = self.events.subscribe();
        let registry = self.registry.clone();
        let sessions = self.sessions.clone();
        let reconnection = self.reconnection.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    link = links.recv() => match link {
                        Ok(LinkEvent::Down { key, error }) => {
                            let closed = sessions.close_sessions_for_connection(&key).await;
                            if !closed.is_empty() {
                                debug!("Closed {} SFTP sessions after link down on {}", closed.len(), key);
                            }
                            reconnection.handle_connection_lost(&key, &error);
                        }
                        Ok(LinkEvent::Restored { key }) => {
                            debug!("Link restored for {}", key);
                        }
                        Ok(LinkEvent::Removed { key }) => {
                            reconnection.remove_session(&key);
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!("Engine wiring lagged {} link events", n);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    event = events.recv() => match event {
                        Some(EventEnvelope { connection, event: EngineEvent::ReconnectAbandoned { .. }, .. }) => {
                            registry.end_recovery(&connection);
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        *self.wiring.lock() = Some(task);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SftpSessionManager> {
        &self.sessions
    }

    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    pub fn reconnection(&self) -> &Arc<ReconnectionManager> {
        &self.reconnection
    }

    // ========== Connections ==========

    /// Acquire (or share) the transport for `config` on behalf of `tab_id`
    pub async fn acquire_connection(
        &self,
        config: &SshConfig,
        tab_id: &TabId,
    ) -> Result<ConnectionRef, SshError> {
        let key = config.key();
        let record = self.registry.acquire(&key, config, tab_id).await?;

        // 放弃重连后再次获取时重新协商，需要重置重连会话
        let stale = self
            .reconnection
            .get_session_status(&key)
            .map(|status| status.state == ReconnectState::Abandoned)
            .unwrap_or(true);
        if stale {
            self.reconnection.register_session(
                &key,
                record.transport().as_ref(),
                config.clone(),
                RegisterOptions::default(),
            );
        }
        Ok(record)
    }

    pub fn release_connection(&self, key: &ConnectionKey, tab_id: &TabId) -> Result<u32, SshError> {
        self.registry.release(key, tab_id)
    }

    /// Cancel the tab's pending operations, close its session and release its connection
    pub async fn close_tab(&self, tab_id: &TabId) {
        let cancelled = self.queue.clear(tab_id);
        let had_session = self.sessions.close_session(tab_id).await;
        let released = self.registry.release_tab(tab_id);
        info!(
            "Tab {} closed (cancelled={}, session={}, connection={:?})",
            tab_id,
            cancelled,
            had_session,
            released.map(|k| k.to_string())
        );
    }

    // ========== Operations ==========

    pub async fn enqueue_operation<T, F, Fut>(
        &self,
        tab_id: &TabId,
        options: OperationOptions,
        op: F,
    ) -> Result<T, SftpError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Arc<dyn SftpChannel>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SftpError>> + Send + 'static,
    {
        self.queue.enqueue(tab_id, options, op).await
    }

    /// Directories first, then by name. Dotfiles are dropped unless `show_hidden`;
    /// the filter runs after merging so both views share one listing.
    pub async fn list_dir(
        &self,
        tab_id: &TabId,
        path: &str,
        show_hidden: bool,
    ) -> Result<Vec<FileInfo>, SftpError> {
        let path = path.to_string();
        let options = OperationOptions::readdir(&path);
        let entries = self
            .enqueue_operation(tab_id, options, move |ch| async move {
                let mut entries = ch.read_dir(&path).await?;
                // 目录优先，然后按名称排序
                entries.sort_by(|a, b| match (a.is_dir(), b.is_dir()) {
                    (true, false) => std::cmp::Ordering::Less,
                    (false, true) => std::cmp::Ordering::Greater,
                    _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
                });
                Ok(entries)
            })
            .await?;

        if show_hidden {
            return Ok(entries);
        }
        Ok(entries.into_iter().filter(|e| !e.is_hidden()).collect())
    }

    pub async fn stat(&self, tab_id: &TabId, path: &str) -> Result<FileInfo, SftpError> {
        let path = path.to_string();
        let options = OperationOptions::new(OperationKind::Stat)
            .path(&path)
            .mergeable(true);
        self.enqueue_operation(tab_id, options, move |ch| async move { ch.stat(&path).await })
            .await
    }

    pub async fn read_file(&self, tab_id: &TabId, path: &str) -> Result<Vec<u8>, SftpError> {
        let path = path.to_string();
        let options = OperationOptions::new(OperationKind::Read).path(&path);
        self.enqueue_operation(tab_id, options, move |ch| async move {
            ch.read_file(&path).await
        })
        .await
    }

    pub async fn write_file(
        &self,
        tab_id: &TabId,
        path: &str,
        content: Vec<u8>,
    ) -> Result<(), SftpError> {
        let path = path.to_string();
        let options = OperationOptions::new(OperationKind::Write).path(&path);
        self.enqueue_operation(tab_id, options, move |ch| async move {
            ch.write_file(&path, &content).await
        })
        .await
    }

    pub async fn rename(
        &self,
        tab_id: &TabId,
        old_path: &str,
        new_path: &str,
    ) -> Result<(), SftpError> {
        let (old_path, new_path) = (old_path.to_string(), new_path.to_string());
        let options = OperationOptions::new(OperationKind::Rename).path(&old_path);
        self.enqueue_operation(tab_id, options, move |ch| async move {
            ch.rename(&old_path, &new_path).await
        })
        .await
    }

    pub async fn mkdir(&self, tab_id: &TabId, path: &str) -> Result<(), SftpError> {
        let path = path.to_string();
        let options = OperationOptions::new(OperationKind::Mkdir).path(&path);
        self.enqueue_operation(tab_id, options, move |ch| async move { ch.mkdir(&path).await })
            .await
    }

    /// Delete a file or an empty directory
    pub async fn delete(&self, tab_id: &TabId, path: &str) -> Result<(), SftpError> {
        let path = path.to_string();
        let options = OperationOptions::new(OperationKind::Delete).path(&path);
        self.enqueue_operation(tab_id, options, move |ch| async move {
            if ch.stat(&path).await?.is_dir() {
                ch.remove_dir(&path).await
            } else {
                ch.remove_file(&path).await
            }
        })
        .await
    }

    /// Delete a tree as a single queue entry; returns the number of removed entries
    pub async fn delete_recursive(&self, tab_id: &TabId, path: &str) -> Result<u64, SftpError> {
        let path = path.to_string();
        let options = OperationOptions::new(OperationKind::Delete).path(&path);
        self.enqueue_operation(tab_id, options, move |ch| async move {
            sftp::delete_recursive(ch.as_ref(), &path).await
        })
        .await
    }

    pub async fn chmod(&self, tab_id: &TabId, path: &str, mode: u32) -> Result<(), SftpError> {
        let path = path.to_string();
        let options = OperationOptions::new(OperationKind::Chmod).path(&path);
        self.enqueue_operation(tab_id, options, move |ch| async move {
            ch.set_permissions(&path, mode).await
        })
        .await
    }

    // ========== Transfers ==========

    /// Chunked download tracked under `transfer_id`
    pub async fn download(
        &self,
        tab_id: &TabId,
        path: &str,
        transfer_id: &str,
    ) -> Result<Vec<u8>, SftpError> {
        let task = self
            .transfers
            .register(transfer_id, TransferDirection::Download, path)?;
        let _guard = TransferGuard::new(self.transfers.clone(), transfer_id);

        let worker = task.clone();
        let options = OperationOptions::new(OperationKind::Read).path(path);
        let queued = self.enqueue_operation(tab_id, options, move |ch| async move {
            transfer::download(ch.as_ref(), &worker).await
        });
        Self::until_cancelled(&task, queued).await
    }

    /// Chunked upload tracked under `transfer_id`; returns the bytes written
    pub async fn upload(
        &self,
        tab_id: &TabId,
        path: &str,
        content: Vec<u8>,
        transfer_id: &str,
    ) -> Result<u64, SftpError> {
        let task = self
            .transfers
            .register(transfer_id, TransferDirection::Upload, path)?;
        let _guard = TransferGuard::new(self.transfers.clone(), transfer_id);

        let worker = task.clone();
        let options = OperationOptions::new(OperationKind::Write).path(path);
        let queued = self.enqueue_operation(tab_id, options, move |ch| async move {
            transfer::upload(ch.as_ref(), &worker, &content).await
        });
        Self::until_cancelled(&task, queued).await
    }

    /// 取消后立即返回；仍在排队的条目轮到时会直接放弃
    async fn until_cancelled<T>(
        task: &TransferTask,
        queued: impl Future<Output = Result<T, SftpError>>,
    ) -> Result<T, SftpError> {
        tokio::select! {
            biased;
            result = queued => result,
            _ = task.cancelled() => Err(SftpError::TransferCancelled),
        }
    }

    pub fn cancel_transfer(&self, transfer_id: &str) -> bool {
        self.transfers.cancel(transfer_id)
    }

    pub fn transfer_progress(&self, transfer_id: &str) -> Option<TransferSnapshot> {
        self.transfers.progress(transfer_id)
    }

    pub fn subscribe_transfer(
        &self,
        transfer_id: &str,
    ) -> Option<tokio::sync::watch::Receiver<TransferSnapshot>> {
        self.transfers.get(transfer_id).map(|t| t.subscribe())
    }

    pub fn list_transfers(&self) -> Vec<TransferSnapshot> {
        self.transfers.list()
    }

    /// Cancel the tab's pending operations
    pub fn clear_queue(&self, tab_id: &TabId) -> usize {
        self.queue.clear(tab_id)
    }

    pub fn queue_len(&self, tab_id: &TabId) -> usize {
        self.queue.len(tab_id)
    }

    pub fn queue_lengths(&self) -> Vec<(TabId, usize)> {
        self.queue.lengths()
    }

    // ========== History ==========

    pub fn history(&self, tab_id: Option<&TabId>) -> Vec<OperationRecord> {
        self.queue.history().list(tab_id)
    }

    pub fn clear_history(&self) {
        self.queue.history().clear();
    }

    // ========== Events ==========

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn EngineEventListener>) -> ListenerId {
        self.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    // ========== Stats ==========

    pub fn connection_stats(&self) -> ConnectionPoolStats {
        self.registry.get_stats()
    }

    pub fn sftp_stats(&self) -> SftpPoolStats {
        self.sessions.get_stats()
    }

    /// Close every session and transport (application exit)
    pub async fn shutdown(&self) {
        if let Some(task) = self.wiring.lock().take() {
            task.abort();
        }
        let cancelled = self.transfers.cancel_all();
        if cancelled > 0 {
            debug!("Cancelled {} transfers on shutdown", cancelled);
        }
        self.sessions.close_all().await;
        self.registry.disconnect_all().await;
        info!("Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(task) = self.wiring.lock().take() {
            task.abort();
        }
    }
}
