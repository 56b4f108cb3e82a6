//! SFTP session pool
//!
//! One file-transfer sub-channel per tab, opened over the transport the tab is
//! bound to in the [`ConnectionRegistry`].
//!
//! # 生命周期
//!
//! - `get_session`：已有会话直接复用（刷新空闲计时器）；否则按 tab 单飞创建
//! - 空闲：`idle_timeout` 内未被使用且没有借出中的操作的会话被关闭
//! - 容量：每个 tab 最多 1 个会话；全局超过上限时先淘汰最早创建的会话
//! - 健康检查：仅在存在会话时运行，每 `health_interval` 对每个会话做一次有界探测

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::channel::SftpChannel;
use super::error::SftpError;
use super::health::{HealthProbe, ProbeOutcome};
use crate::single_flight::SingleFlight;
use crate::ssh::{ConnectionKey, ConnectionRegistry, TabId};

/// A tab never holds more than one live session
pub const MAX_SESSIONS_PER_TAB: usize = 1;

/// SFTP pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftpPoolConfig {
    /// 未使用多久后关闭会话（秒）
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// 单次会话创建的上限（秒）
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    /// 等待连接就绪的上限（秒）
    #[serde(default = "default_ready_wait_secs")]
    pub ready_wait_secs: u64,

    /// 全局会话上限
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// 健康检查间隔（秒）
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// 单次健康探测的上限（秒）
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    20
}

fn default_session_timeout_secs() -> u64 {
    20
}

fn default_ready_wait_secs() -> u64 {
    10
}

fn default_max_sessions() -> usize {
    10
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_health_timeout_secs() -> u64 {
    5
}

impl Default for SftpPoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            session_timeout_secs: default_session_timeout_secs(),
            ready_wait_secs: default_ready_wait_secs(),
            max_sessions: default_max_sessions(),
            health_interval_secs: default_health_interval_secs(),
            health_timeout_secs: default_health_timeout_secs(),
        }
    }
}

impl SftpPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn ready_wait(&self) -> Duration {
        Duration::from_secs(self.ready_wait_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

/// A live sub-channel owned by the pool
pub struct SftpSession {
    pub tab_id: TabId,
    pub connection: ConnectionKey,
    channel: Arc<dyn SftpChannel>,
    /// 每个会话唯一，防止旧计时器关闭新会话
    generation: u64,
    active: AtomicBool,
    /// 借出中的 [`SessionLease`] 数量
    in_use: AtomicUsize,
    created_at: Instant,
    last_used: Mutex<Instant>,
    last_checked: Mutex<Option<Instant>>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
}

impl SftpSession {
    fn new(
        tab_id: TabId,
        connection: ConnectionKey,
        channel: Arc<dyn SftpChannel>,
        generation: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            tab_id,
            connection,
            channel,
            generation,
            active: AtomicBool::new(true),
            in_use: AtomicUsize::new(0),
            created_at: now,
            last_used: Mutex::new(now),
            last_checked: Mutex::new(None),
            idle_timer: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> Arc<dyn SftpChannel> {
        self.channel.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Time left before the session counts as idle; `None` once it does.
    /// A leased session is never idle.
    fn idle_remaining(&self, idle: Duration) -> Option<Duration> {
        if self.in_use() > 0 {
            return Some(idle);
        }
        idle.checked_sub(self.idle_for()).filter(|left| !left.is_zero())
    }

    fn cancel_idle_timer(&self) {
        if let Some(handle) = self.idle_timer.lock().take() {
            handle.abort();
        }
    }

    fn to_info(&self) -> SftpSessionInfo {
        SftpSessionInfo {
            tab_id: self.tab_id.clone(),
            connection: self.connection.to_string(),
            age_secs: self.age().as_secs(),
            idle_secs: self.idle_for().as_secs(),
            in_use: self.in_use(),
            last_checked_secs: self.last_checked.lock().map(|t| t.elapsed().as_secs()),
        }
    }
}

impl std::fmt::Debug for SftpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSession")
            .field("tab_id", &self.tab_id)
            .field("connection", &self.connection)
            .field("active", &self.is_active())
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Borrow of a session's channel for the duration of one operation.
///
/// While any lease is outstanding the idle timer leaves the session alone;
/// dropping the lease counts as a use.
pub struct SessionLease {
    session: Arc<SftpSession>,
}

impl SessionLease {
    fn new(session: Arc<SftpSession>) -> Self {
        session.in_use.fetch_add(1, Ordering::SeqCst);
        session.touch();
        Self { session }
    }

    pub fn channel(&self) -> Arc<dyn SftpChannel> {
        self.session.channel()
    }

    pub fn tab_id(&self) -> &TabId {
        &self.session.tab_id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        // 先刷新时间再归还，计时器看到 in_use == 0 时 last_used 已是最新
        self.session.touch();
        self.session.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpSessionInfo {
    pub tab_id: TabId,
    pub connection: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub in_use: usize,
    pub last_checked_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpPoolStats {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub health_sweep_running: bool,
    pub sessions: Vec<SftpSessionInfo>,
}

/// Why a session left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Explicit,
    Idle,
    Capacity,
    HealthCheck,
    TransportLost,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::Explicit => "explicit close",
            CloseReason::Idle => "idle timeout",
            CloseReason::Capacity => "capacity eviction",
            CloseReason::HealthCheck => "health check failure",
            CloseReason::TransportLost => "transport lost",
        };
        f.write_str(s)
    }
}

pub struct SftpSessionManager {
    registry: Arc<ConnectionRegistry>,
    sessions: DashMap<TabId, Arc<SftpSession>>,
    creations: SingleFlight<TabId, Result<Arc<SftpSession>, SftpError>>,
    config: SftpPoolConfig,
    probe: HealthProbe,
    health_task: Mutex<Option<JoinHandle<()>>>,
    next_generation: AtomicU64,
    self_ref: Weak<SftpSessionManager>,
}

impl SftpSessionManager {
    pub fn new(registry: Arc<ConnectionRegistry>, config: SftpPoolConfig) -> Arc<Self> {
        let probe = HealthProbe::new(config.health_timeout());
        Arc::new_cyclic(|self_ref| Self {
            registry,
            sessions: DashMap::new(),
            creations: SingleFlight::new(),
            config,
            probe,
            health_task: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &SftpPoolConfig {
        &self.config
    }

    /// Channel for `tab_id`, creating the session if needed
    pub async fn get_session(&self, tab_id: &TabId) -> Result<Arc<dyn SftpChannel>, SftpError> {
        self.lease(tab_id).await.map(|lease| lease.channel())
    }

    /// Like [`get_session`](Self::get_session), but keeps the session marked
    /// in use until the returned lease is dropped
    pub async fn lease(&self, tab_id: &TabId) -> Result<SessionLease, SftpError> {
        if let Some(lease) = self.lease_live(tab_id) {
            return Ok(lease);
        }

        let manager = self.self_ref.upgrade().ok_or_else(|| {
            SftpError::InvalidConnection("session manager shut down".to_string())
        })?;
        let tab = tab_id.clone();
        let session = self
            .creations
            .run(tab_id.clone(), move || async move {
                let bound = manager.config.session_timeout();
                match tokio::time::timeout(bound, manager.create_session(tab.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(SftpError::SessionTimeout(format!(
                        "SFTP session for tab {} not created within {}s",
                        tab,
                        bound.as_secs()
                    ))),
                }
            })
            .await?;

        Ok(SessionLease::new(session))
    }

    /// 在持有分片读锁时计数，与空闲关闭的 `remove_if` 互斥
    fn lease_live(&self, tab_id: &TabId) -> Option<SessionLease> {
        self.sessions
            .get(tab_id)
            .filter(|e| e.value().is_active())
            .map(|e| SessionLease::new(e.value().clone()))
    }

    fn live_session(&self, tab_id: &TabId) -> Option<Arc<SftpSession>> {
        self.sessions
            .get(tab_id)
            .map(|e| e.value().clone())
            .filter(|s| s.is_active())
    }

    async fn create_session(&self, tab_id: TabId) -> Result<Arc<SftpSession>, SftpError> {
        // 单飞的 leader 之间可能已有人创建完成
        if let Some(session) = self.live_session(&tab_id) {
            return Ok(session);
        }

        let record = self.registry.record_for_tab(&tab_id).ok_or_else(|| {
            SftpError::InvalidConnection(format!("no connection bound to tab {}", tab_id))
        })?;

        if !record.wait_ready(self.config.ready_wait()).await {
            return Err(SftpError::ReadyTimeout(format!(
                "connection {} not ready after {}s",
                record.key,
                self.config.ready_wait_secs
            )));
        }
        let transport = record.transport().ok_or_else(|| {
            SftpError::ReadyTimeout(format!("connection {} lost readiness", record.key))
        })?;

        info!("Opening SFTP session for tab {} on {}", tab_id, record.key);
        let channel = transport.open_sftp().await?;
        record.touch();

        // 同一 tab 只保留一个会话
        if let Some((_, stale)) = self.sessions.remove(&tab_id) {
            self.shutdown_session(stale, CloseReason::Capacity).await;
        }
        self.enforce_capacity(self.config.max_sessions.saturating_sub(1))
            .await;

        let session = Arc::new(SftpSession::new(
            tab_id.clone(),
            record.key.clone(),
            channel,
            self.next_generation.fetch_add(1, Ordering::SeqCst),
        ));
        self.adopt(session.clone());

        info!(
            "SFTP session ready for tab {} ({} active)",
            tab_id,
            self.sessions.len()
        );
        Ok(session)
    }

    /// Evict oldest-created sessions until at most `limit` remain
    async fn enforce_capacity(&self, limit: usize) -> Vec<TabId> {
        let mut evicted = Vec::new();
        while self.sessions.len() > limit {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|e| e.value().created_at)
                .map(|e| e.key().clone());
            let Some(tab) = oldest else {
                break;
            };
            if let Some((_, session)) = self.sessions.remove(&tab) {
                warn!("SFTP session limit reached, evicting oldest session for tab {}", tab);
                self.shutdown_session(session, CloseReason::Capacity).await;
                evicted.push(tab);
            }
        }
        evicted
    }

    /// Insert a freshly opened session and start its timers
    fn adopt(&self, session: Arc<SftpSession>) {
        self.sessions.insert(session.tab_id.clone(), session.clone());
        self.arm_idle_timer(&session);
        self.ensure_health_sweep();
    }

    /// One timer per session. It wakes when the session could first become
    /// idle and re-checks, so uses and leases only push the deadline back.
    fn arm_idle_timer(&self, session: &Arc<SftpSession>) {
        let weak = self.self_ref.clone();
        let tab = session.tab_id.clone();
        let generation = session.generation;
        let idle = self.config.idle_timeout();

        let handle = tokio::spawn(async move {
            let mut wait = idle;
            loop {
                tokio::time::sleep(wait).await;
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                let remaining = match manager.sessions.get(&tab) {
                    Some(s) if s.generation == generation => s.idle_remaining(idle),
                    _ => return,
                };
                match remaining {
                    Some(left) => wait = left,
                    None => {
                        debug!("SFTP session for tab {} idle for {:?}", tab, idle);
                        if manager
                            .close_where(&tab, CloseReason::Idle, |s| {
                                s.generation == generation && s.idle_remaining(idle).is_none()
                            })
                            .await
                        {
                            return;
                        }
                        // 检查之后又被借出
                        wait = idle;
                    }
                }
            }
        });

        if let Some(old) = session.idle_timer.lock().replace(handle) {
            old.abort();
        }
    }

    /// Close `tab_id`'s session only if it is still the given generation
    async fn close_generation(&self, tab_id: &TabId, generation: u64, reason: CloseReason) -> bool {
        self.close_where(tab_id, reason, |s| s.generation == generation)
            .await
    }

    async fn close_where<P>(&self, tab_id: &TabId, reason: CloseReason, pred: P) -> bool
    where
        P: FnOnce(&SftpSession) -> bool,
    {
        let removed = self.sessions.remove_if(tab_id, |_, s| pred(s.as_ref()));
        match removed {
            Some((_, session)) => {
                self.shutdown_session(session, reason).await;
                true
            }
            None => false,
        }
    }

    async fn shutdown_session(&self, session: Arc<SftpSession>, reason: CloseReason) {
        if !session.active.swap(false, Ordering::SeqCst) {
            return;
        }
        // 当前任务可能就是空闲计时器本身，此时 abort 只在下一个 await 点生效
        let timer = session.idle_timer.lock().take();
        info!("Closing SFTP session for tab {} ({})", session.tab_id, reason);
        if let Err(e) = session.channel.close().await {
            debug!("SFTP close for tab {} failed: {}", session.tab_id, e);
        }
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    /// Close the session for `tab_id`. Returns `false` if there was none.
    pub async fn close_session(&self, tab_id: &TabId) -> bool {
        match self.sessions.remove(tab_id) {
            Some((_, session)) => {
                self.shutdown_session(session, CloseReason::Explicit).await;
                true
            }
            None => false,
        }
    }

    /// Close every session opened over `key`
    pub async fn close_sessions_for_connection(&self, key: &ConnectionKey) -> Vec<TabId> {
        let tabs: Vec<TabId> = self
            .sessions
            .iter()
            .filter(|e| &e.value().connection == key)
            .map(|e| e.key().clone())
            .collect();

        let mut closed = Vec::with_capacity(tabs.len());
        for tab in tabs {
            if let Some((_, session)) = self.sessions.remove_if(&tab, |_, s| &s.connection == key) {
                self.shutdown_session(session, CloseReason::TransportLost).await;
                closed.push(tab);
            }
        }
        closed
    }

    pub async fn close_all(&self) {
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
        }
        let tabs: Vec<TabId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for tab in tabs {
            self.close_session(&tab).await;
        }
    }

    pub fn has_session(&self, tab_id: &TabId) -> bool {
        self.live_session(tab_id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_health_sweep_running(&self) -> bool {
        self.health_task
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    fn ensure_health_sweep(&self) {
        let mut task = self.health_task.lock();
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let weak = self.self_ref.clone();
        let period = self.config.health_interval();
        *task = Some(tokio::spawn(async move {
            debug!("SFTP health sweep started (interval={:?})", period);
            loop {
                tokio::time::sleep(period).await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                {
                    let mut task = manager.health_task.lock();
                    if manager.sessions.is_empty() {
                        task.take();
                        break;
                    }
                }
                manager.health_sweep().await;
            }
            debug!("SFTP health sweep stopped");
        }));
    }

    /// Probe every session, closing the ones that fail, then re-apply the global cap.
    ///
    /// Returns the tabs whose session was closed.
    pub async fn health_sweep(&self) -> Vec<TabId> {
        let sessions: Vec<Arc<SftpSession>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();

        let mut closed = Vec::new();
        for session in sessions {
            let outcome = self.probe.check(session.channel.as_ref()).await;
            *session.last_checked.lock() = Some(Instant::now());
            match outcome {
                ProbeOutcome::Healthy { .. } => {}
                ProbeOutcome::Failed(e) => {
                    warn!("SFTP health check failed for tab {}: {}", session.tab_id, e);
                    if self
                        .close_generation(&session.tab_id, session.generation, CloseReason::HealthCheck)
                        .await
                    {
                        closed.push(session.tab_id.clone());
                    }
                }
                ProbeOutcome::TimedOut => {
                    warn!(
                        "SFTP health check timed out for tab {} ({:?})",
                        session.tab_id,
                        self.config.health_timeout()
                    );
                    if self
                        .close_generation(&session.tab_id, session.generation, CloseReason::HealthCheck)
                        .await
                    {
                        closed.push(session.tab_id.clone());
                    }
                }
            }
        }

        closed.extend(self.enforce_capacity(self.config.max_sessions).await);
        closed
    }

    pub fn get_stats(&self) -> SftpPoolStats {
        let mut sessions: Vec<SftpSessionInfo> =
            self.sessions.iter().map(|e| e.value().to_info()).collect();
        sessions.sort_by(|a, b| b.age_secs.cmp(&a.age_secs));
        SftpPoolStats {
            active_sessions: self.sessions.len(),
            max_sessions: self.config.max_sessions,
            health_sweep_running: self.is_health_sweep_running(),
            sessions,
        }
    }
}

impl Drop for SftpSessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
        }
        for entry in self.sessions.iter() {
            entry.value().cancel_idle_timer();
        }
    }
}
