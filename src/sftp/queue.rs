//! Per-tab operation queue
//!
//! Serializes the filesystem operations of one tab against its single SFTP
//! channel. Only the head entry executes; the channel is fetched from the
//! [`SftpSessionManager`] at execution time so a re-opened session is picked up
//! transparently.
//!
//! - `High` priority entries are inserted at index 1, behind the in-flight head
//! - A mergeable entry with the same `(kind, path)` as a queued one, including
//!   the in-flight head, joins it as a subscriber; every subscriber receives the
//!   identical outcome
//! - After each entry the drain pauses 50ms (`readdir`) or 100ms (others)

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::channel::SftpChannel;
use super::error::SftpError;
use super::history::{OperationHistory, OperationRecord, DEFAULT_HISTORY_LIMIT};
use super::path_utils::normalize_remote_path;
use super::session_manager::SftpSessionManager;
use super::types::{OperationKind, OperationOptions, Priority};
use crate::ssh::TabId;

/// Queue pacing and history configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// `readdir` 之后的间隔（毫秒）
    #[serde(default = "default_readdir_delay_ms")]
    pub readdir_delay_ms: u64,

    /// 其他操作之后的间隔（毫秒）
    #[serde(default = "default_operation_delay_ms")]
    pub operation_delay_ms: u64,

    /// 保留的操作历史条数
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_readdir_delay_ms() -> u64 {
    50
}

fn default_operation_delay_ms() -> u64 {
    100
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            readdir_delay_ms: default_readdir_delay_ms(),
            operation_delay_ms: default_operation_delay_ms(),
            history_limit: default_history_limit(),
        }
    }
}

impl QueueConfig {
    fn pacing(&self, kind: OperationKind) -> Duration {
        kind.pacing_delay(
            Duration::from_millis(self.readdir_delay_ms),
            Duration::from_millis(self.operation_delay_ms),
        )
    }
}

type OpValue = Arc<dyn Any + Send + Sync>;
type Outcome = Result<OpValue, SftpError>;
type Thunk = Box<dyn FnOnce(Arc<dyn SftpChannel>) -> BoxFuture<'static, Outcome> + Send>;

struct QueuedOperation {
    id: u64,
    /// drain 取走后为 `None`；Mutex 只为让队列可跨线程共享
    thunk: Mutex<Option<Thunk>>,
    /// 第一个是发起者，其余是合并进来的订阅者
    waiters: Vec<oneshot::Sender<Outcome>>,
    priority: Priority,
    kind: OperationKind,
    path: Option<String>,
    mergeable: bool,
    enqueued_at: Instant,
    started: bool,
}

impl QueuedOperation {
    /// 执行中的队头也接受订阅：结果在它出队时才分发
    fn accepts_merge(&self, kind: OperationKind, path: &Option<String>) -> bool {
        self.kind == kind && &self.path == path
    }
}

#[derive(Default)]
struct TabQueue {
    entries: VecDeque<QueuedOperation>,
    draining: bool,
}

/// Snapshot of one queue entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperationInfo {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub path: Option<String>,
    pub priority: Priority,
    pub mergeable: bool,
    pub subscribers: usize,
    pub started: bool,
    pub waited_ms: u64,
}

pub struct OperationQueue {
    sessions: Arc<SftpSessionManager>,
    queues: DashMap<TabId, TabQueue>,
    history: Arc<OperationHistory>,
    config: QueueConfig,
    next_id: AtomicU64,
    self_ref: Weak<OperationQueue>,
}

impl OperationQueue {
    pub fn new(sessions: Arc<SftpSessionManager>, config: QueueConfig) -> Arc<Self> {
        let history = Arc::new(OperationHistory::new(config.history_limit));
        Arc::new_cyclic(|self_ref| Self {
            sessions,
            queues: DashMap::new(),
            history,
            config,
            next_id: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    pub fn history(&self) -> &Arc<OperationHistory> {
        &self.history
    }

    /// Queue `op` for `tab_id` and wait for its outcome
    pub async fn enqueue<T, F, Fut>(
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
        let thunk: Thunk = Box::new(move |channel| {
            async move { op(channel).await.map(|v| Arc::new(v) as OpValue) }.boxed()
        });

        let rx = self.push(tab_id, options, thunk);

        let value = rx.await.unwrap_or(Err(SftpError::QueueCancelled))?;
        value.downcast::<T>().map(|v| (*v).clone()).map_err(|_| {
            SftpError::ProtocolError("merged operation produced a different result type".into())
        })
    }

    fn push(
        &self,
        tab_id: &TabId,
        options: OperationOptions,
        thunk: Thunk,
    ) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let path = options.path.as_deref().map(normalize_remote_path);
        let mut queue = self.queues.entry(tab_id.clone()).or_default();

        if options.mergeable {
            if let Some(existing) = queue
                .entries
                .iter_mut()
                .find(|e| e.accepts_merge(options.kind, &path))
            {
                existing.waiters.push(tx);
                debug!(
                    "Merged {} {:?} into pending operation #{} for tab {} ({} subscribers)",
                    options.kind.as_str(),
                    path,
                    existing.id,
                    tab_id,
                    existing.waiters.len() - 1
                );
                return rx;
            }
        }

        let entry = QueuedOperation {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            thunk: Mutex::new(Some(thunk)),
            waiters: vec![tx],
            priority: options.priority,
            kind: options.kind,
            path,
            mergeable: options.mergeable,
            enqueued_at: Instant::now(),
            started: false,
        };

        if entry.priority == Priority::High && !queue.entries.is_empty() {
            queue.entries.insert(1, entry);
        } else {
            queue.entries.push_back(entry);
        }

        if !queue.draining {
            queue.draining = true;
            drop(queue);
            self.spawn_drain(tab_id.clone());
        }
        rx
    }

    fn spawn_drain(&self, tab_id: TabId) {
        let Some(queue) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            queue.drain(tab_id).await;
        });
    }

    async fn drain(&self, tab_id: TabId) {
        loop {
            let next = {
                let Some(mut guard) = self.queues.get_mut(&tab_id) else {
                    return;
                };
                let queue = &mut *guard;
                match queue.entries.front_mut() {
                    Some(head) => {
                        head.started = true;
                        let thunk = head.thunk.lock().take();
                        Some((head.id, thunk, head.kind, head.path.clone()))
                    }
                    None => {
                        queue.draining = false;
                        None
                    }
                }
            };

            let Some((id, thunk, kind, path)) = next else {
                self.queues
                    .remove_if(&tab_id, |_, q| q.entries.is_empty() && !q.draining);
                return;
            };

            let outcome = match thunk {
                Some(thunk) => self.execute(&tab_id, thunk).await,
                None => Err(SftpError::QueueCancelled),
            };

            let waiters = match self.queues.get_mut(&tab_id) {
                Some(mut queue) if queue.entries.front().map(|h| h.id) == Some(id) => queue
                    .entries
                    .pop_front()
                    .map(|h| h.waiters)
                    .unwrap_or_default(),
                _ => Vec::new(),
            };

            self.history.record(OperationRecord {
                timestamp: Utc::now(),
                tab_id: tab_id.clone(),
                operation: kind,
                path,
                success: outcome.is_ok(),
                error: outcome.as_ref().err().map(|e| e.to_string()),
                callers: waiters.len(),
            });

            for waiter in waiters {
                // 调用方可能已放弃等待
                let _ = waiter.send(outcome.clone());
            }

            tokio::time::sleep(self.config.pacing(kind)).await;
        }
    }

    async fn execute(&self, tab_id: &TabId, thunk: Thunk) -> Outcome {
        let lease = self
            .sessions
            .lease(tab_id)
            .await
            .map_err(translate_error)?;

        let result = thunk(lease.channel()).await.map_err(translate_error);
        drop(lease);
        if let Err(SftpError::ConnectionReset) = &result {
            // 通道已失效，下一个操作重新打开
            warn!("SFTP channel for tab {} reset, dropping session", tab_id);
            self.sessions.close_session(tab_id).await;
        }
        result
    }

    /// Cancel every entry of `tab_id` that has not started.
    ///
    /// Returns the number of callers resolved with `QueueCancelled`.
    pub fn clear(&self, tab_id: &TabId) -> usize {
        let cancelled: Vec<QueuedOperation> = match self.queues.get_mut(tab_id) {
            Some(mut queue) => {
                let (running, pending): (VecDeque<_>, VecDeque<_>) =
                    queue.entries.drain(..).partition(|e| e.started);
                queue.entries = running;
                pending.into_iter().collect()
            }
            None => return 0,
        };

        let mut callers = 0;
        for entry in cancelled {
            for waiter in entry.waiters {
                callers += 1;
                let _ = waiter.send(Err(SftpError::QueueCancelled));
            }
        }
        if callers > 0 {
            debug!("Cleared queue for tab {}, {} callers cancelled", tab_id, callers);
        }
        callers
    }

    /// Entries in the tab's queue, including the in-flight head
    pub fn len(&self, tab_id: &TabId) -> usize {
        self.queues
            .get(tab_id)
            .map(|q| q.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, tab_id: &TabId) -> bool {
        self.len(tab_id) == 0
    }

    /// Queue length per tab
    pub fn lengths(&self) -> Vec<(TabId, usize)> {
        let mut lengths: Vec<(TabId, usize)> = self
            .queues
            .iter()
            .map(|e| (e.key().clone(), e.value().entries.len()))
            .collect();
        lengths.sort();
        lengths
    }

    pub fn snapshot(&self, tab_id: &TabId) -> Vec<QueuedOperationInfo> {
        self.queues
            .get(tab_id)
            .map(|q| {
                q.entries
                    .iter()
                    .map(|e| QueuedOperationInfo {
                        id: e.id,
                        kind: e.kind,
                        path: e.path.clone(),
                        priority: e.priority,
                        mergeable: e.mergeable,
                        subscribers: e.waiters.len().saturating_sub(1),
                        started: e.started,
                        waited_ms: e.enqueued_at.elapsed().as_millis() as u64,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Rewrite transport-level failures into the two messages callers retry on
pub fn translate_error(err: SftpError) -> SftpError {
    match err {
        SftpError::ReadyTimeout(_) | SftpError::ConnectionNotReady => SftpError::ConnectionNotReady,
        SftpError::Transport(_) | SftpError::ChannelError(_) | SftpError::ConnectionReset => {
            SftpError::ConnectionReset
        }
        other => {
            let message = other.to_string();
            if message.contains("ECONNRESET") || message.contains("channel open") {
                SftpError::ConnectionReset
            } else {
                other
            }
        }
    }
}
