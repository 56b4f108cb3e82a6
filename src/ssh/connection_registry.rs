//! SSH Connection Registry
//!
//! 独立的 SSH 连接池管理，与前端界面完全解耦。
//!
//! # 架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ConnectionRegistry                                          │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  ConnectionRecord (keyed by ConnectionKey)              │  │
//! │  │  ├── transport: Arc<dyn Transport>                      │  │
//! │  │  ├── config: SshConfig                                  │  │
//! │  │  ├── ready: watch::Sender<bool>                         │  │
//! │  │  ├── ref_count + tab bindings                           │  │
//! │  │  └── heartbeat_task: Option<JoinHandle>                 │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!          │
//!          │  record_for_tab(tab)
//!    ┌─────┴─────┬─────────────┐
//!    ▼           ▼             ▼
//!  Tab 1       Tab 2      Reconnection
//! ```
//!
//! # 生命周期
//!
//! - 首次 `acquire` 时协商（connect + auth），同一 key 的并发请求共享同一次协商
//! - `release` 只减少引用计数，不会立即断开
//! - 空闲清扫：引用计数为零且超过宽限期、且不在恢复中的连接才会被关闭
//! - 心跳连续失败或 IO 错误：标记 ready=false，广播 [`LinkEvent::Down`]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{ConnectionKey, SshConfig, TabId};
use super::error::SshError;
use super::transport::{PingResult, Transport, TransportFactory};
use crate::session::ReconnectTarget;
use crate::single_flight::SingleFlight;

/// 默认空闲宽限期（30 分钟）
const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(30 * 60);

/// 空闲清扫间隔
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// 等待协商中连接就绪的上限
const DEFAULT_READY_WAIT: Duration = Duration::from_secs(10);

/// 心跳间隔（15 秒）
/// 配合 HEARTBEAT_FAIL_THRESHOLD=2，确保 30 秒内检测到断连
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// 心跳连续失败次数阈值
const HEARTBEAT_FAIL_THRESHOLD: u32 = 2;

/// Capacity of the link event broadcast channel
const LINK_EVENT_CAPACITY: usize = 256;

/// 连接池配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    /// 引用计数归零后保留连接的时间（秒）
    #[serde(default = "default_idle_grace_secs")]
    pub idle_grace_secs: u64,

    /// 空闲清扫间隔（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// 等待协商中连接就绪的上限（秒）
    #[serde(default = "default_ready_wait_secs")]
    pub ready_wait_secs: u64,

    /// 心跳间隔（秒），0 = 关闭心跳
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// 心跳连续超时次数阈值
    #[serde(default = "default_heartbeat_fail_threshold")]
    pub heartbeat_fail_threshold: u32,

    /// 最大连接数（0 = 无限制）
    #[serde(default)]
    pub max_connections: usize,
}

fn default_idle_grace_secs() -> u64 {
    DEFAULT_IDLE_GRACE.as_secs()
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

fn default_ready_wait_secs() -> u64 {
    DEFAULT_READY_WAIT.as_secs()
}

fn default_heartbeat_interval_secs() -> u64 {
    HEARTBEAT_INTERVAL.as_secs()
}

fn default_heartbeat_fail_threshold() -> u32 {
    HEARTBEAT_FAIL_THRESHOLD
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            idle_grace_secs: default_idle_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            ready_wait_secs: default_ready_wait_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_fail_threshold: HEARTBEAT_FAIL_THRESHOLD,
            max_connections: 0,
        }
    }
}

impl ConnectionPoolConfig {
    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }

    pub fn ready_wait(&self) -> Duration {
        Duration::from_secs(self.ready_wait_secs)
    }
}

/// Transport-level signals published by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// 心跳判定链路断开
    Down { key: ConnectionKey, error: String },
    /// 重新协商成功，transport 已替换
    Restored { key: ConnectionKey },
    /// 记录已被销毁
    Removed { key: ConnectionKey },
}

/// 连接信息（用于前端显示）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub key: ConnectionKey,
    pub ready: bool,
    pub recovering: bool,
    pub ref_count: u32,
    pub tabs: Vec<TabId>,
    pub created_at: String,
    pub last_used: String,
}

/// 连接池统计信息（用于监控面板）
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPoolStats {
    pub total_connections: usize,
    pub ready_connections: usize,
    /// 无使用者，等待宽限期结束
    pub idle_connections: usize,
    /// 链路断开，等待重连
    pub recovering_connections: usize,
    pub total_ref_count: u32,
    /// 累计协商次数（含重连）
    pub negotiations: u64,
    pub pool_capacity: usize,
}

/// 单个已认证的 transport 条目
pub struct ConnectionRecord {
    pub key: ConnectionKey,

    /// 协商时使用的配置（不可变）
    pub config: SshConfig,

    transport: RwLock<Option<Arc<dyn Transport>>>,

    ready: watch::Sender<bool>,

    ref_count: AtomicU32,

    /// tab → 该 tab 持有的引用数
    tabs: Mutex<HashMap<TabId, u32>>,

    pub created_at: DateTime<Utc>,

    /// Unix 时间戳（秒）
    last_used: AtomicI64,

    /// 引用计数归零的时刻
    idle_since: Mutex<Option<Instant>>,

    /// 链路断开后等待重连期间为 true
    recovering: AtomicBool,

    heartbeat_failures: AtomicU32,

    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle returned to consumers of the pool
pub type ConnectionRef = Arc<ConnectionRecord>;

impl ConnectionRecord {
    fn new(key: ConnectionKey, config: SshConfig) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            key,
            config,
            transport: RwLock::new(None),
            ready,
            ref_count: AtomicU32::new(0),
            tabs: Mutex::new(HashMap::new()),
            created_at: Utc::now(),
            last_used: AtomicI64::new(Utc::now().timestamp()),
            idle_since: Mutex::new(Some(Instant::now())),
            recovering: AtomicBool::new(false),
            heartbeat_failures: AtomicU32::new(0),
            heartbeat_task: Mutex::new(None),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// Wait until the record is ready, up to `timeout`.
    ///
    /// Returns `false` on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Current transport, if the record is ready
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        if !self.is_ready() {
            return None;
        }
        self.transport.read().clone()
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn tabs(&self) -> Vec<TabId> {
        let mut tabs: Vec<TabId> = self.tabs.lock().keys().cloned().collect();
        tabs.sort();
        tabs
    }

    pub fn touch(&self) {
        self.last_used.store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    pub fn last_used(&self) -> i64 {
        self.last_used.load(Ordering::SeqCst)
    }

    fn add_ref(&self, tab_id: &TabId) -> u32 {
        *self.tabs.lock().entry(tab_id.clone()).or_insert(0) += 1;
        *self.idle_since.lock() = None;
        self.touch();
        let count = self.ref_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Connection {} ref count increased to {}", self.key, count);
        count
    }

    /// Returns the new count, or `None` if the tab held no reference
    fn release(&self, tab_id: &TabId) -> Option<u32> {
        {
            let mut tabs = self.tabs.lock();
            let held = tabs.get_mut(tab_id)?;
            *held -= 1;
            if *held == 0 {
                tabs.remove(tab_id);
            }
        }

        // 防止下溢
        let count = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)))
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0);
        if count == 0 {
            *self.idle_since.lock() = Some(Instant::now());
        }
        self.touch();
        debug!("Connection {} ref count decreased to {}", self.key, count);
        Some(count)
    }

    fn idle_for(&self) -> Option<Duration> {
        self.idle_since.lock().map(|since| since.elapsed())
    }

    /// Install a freshly negotiated transport and flip `ready`
    fn install(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        let previous = self.transport.write().replace(transport);
        self.heartbeat_failures.store(0, Ordering::SeqCst);
        self.recovering.store(false, Ordering::SeqCst);
        self.ready.send_replace(true);
        self.touch();
        previous
    }

    fn mark_down(&self) {
        self.ready.send_replace(false);
        self.recovering.store(true, Ordering::SeqCst);
    }

    fn cancel_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_task.lock().take() {
            handle.abort();
            debug!("Connection {} heartbeat task cancelled", self.key);
        }
    }

    fn set_heartbeat_task(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.heartbeat_task.lock().replace(handle) {
            old.abort();
        }
    }

    async fn teardown(&self) {
        self.cancel_heartbeat();
        self.ready.send_replace(false);
        let transport = self.transport.write().take();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
    }

    pub fn to_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            key: self.key.clone(),
            ready: self.is_ready(),
            recovering: self.is_recovering(),
            ref_count: self.ref_count(),
            tabs: self.tabs(),
            created_at: self.created_at.to_rfc3339(),
            last_used: DateTime::from_timestamp(self.last_used(), 0)
                .unwrap_or_default()
                .to_rfc3339(),
        }
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("key", &self.key)
            .field("ready", &self.is_ready())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Reference-counted pool of authenticated transports
pub struct ConnectionRegistry {
    records: DashMap<ConnectionKey, Arc<ConnectionRecord>>,

    /// 每个 tab 绑定的连接
    tab_bindings: DashMap<TabId, ConnectionKey>,

    negotiations: SingleFlight<ConnectionKey, Result<Arc<ConnectionRecord>, SshError>>,

    negotiation_count: AtomicU64,

    factory: Arc<dyn TransportFactory>,

    config: ConnectionPoolConfig,

    link_tx: broadcast::Sender<LinkEvent>,

    sweeper: Mutex<Option<JoinHandle<()>>>,

    self_ref: Weak<ConnectionRegistry>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, config: ConnectionPoolConfig) -> Arc<Self> {
        let (link_tx, _) = broadcast::channel(LINK_EVENT_CAPACITY);
        Arc::new_cyclic(|self_ref| Self {
            records: DashMap::new(),
            tab_bindings: DashMap::new(),
            negotiations: SingleFlight::new(),
            negotiation_count: AtomicU64::new(0),
            factory,
            config,
            link_tx,
            sweeper: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    /// Subscribe to link down / restored / removed signals
    pub fn subscribe_links(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }

    fn publish(&self, event: LinkEvent) {
        // 没有订阅者时发送失败是正常的
        let _ = self.link_tx.send(event);
    }

    /// 获取连接（增加引用计数并绑定 tab）
    ///
    /// 已存在的记录直接复用；否则执行协商。同一 key 的并发调用共享同一次协商。
    /// 调用者使用完后必须调用 `release`。
    pub async fn acquire(
        &self,
        key: &ConnectionKey,
        config: &SshConfig,
        tab_id: &TabId,
    ) -> Result<ConnectionRef, SshError> {
        let existing = self
            .records
            .get(key)
            .map(|e| e.value().clone())
            .filter(|r| r.is_ready() || r.is_recovering());

        let record = match existing {
            Some(record) => record,
            None => {
                let registry = self.self_ref.upgrade().ok_or(SshError::Disconnected)?;
                let flight_key = key.clone();
                let config = config.clone();
                self.negotiations
                    .run(key.clone(), move || async move {
                        registry.negotiate(flight_key, config).await
                    })
                    .await?
            }
        };

        record.add_ref(tab_id);
        if let Some(previous) = self.tab_bindings.insert(tab_id.clone(), key.clone()) {
            if &previous != key {
                warn!("Tab {} rebound from {} to {}", tab_id, previous, key);
            }
        }

        Ok(record)
    }

    /// 协商一个新的 transport（single-flight 内部调用）
    async fn negotiate(
        self: Arc<Self>,
        key: ConnectionKey,
        config: SshConfig,
    ) -> Result<Arc<ConnectionRecord>, SshError> {
        if let Some(record) = self.records.get(&key).map(|e| e.value().clone()) {
            if record.is_ready() {
                return Ok(record);
            }
        }

        let max = self.config.max_connections;
        if max > 0 && !self.records.contains_key(&key) && self.records.len() >= max {
            return Err(SshError::LimitReached {
                current: self.records.len(),
                max,
            });
        }

        let record = self
            .records
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ConnectionRecord::new(key.clone(), config)))
            .value()
            .clone();

        info!(
            "Negotiating SSH connection {} -> {}@{}:{}",
            key, record.config.username, record.config.host, record.config.port
        );

        match self.establish(&record).await {
            Ok(()) => {
                info!("SSH connection {} established", key);
                Ok(record)
            }
            Err(e) => {
                warn!("SSH connection {} negotiation failed: {}", key, e);
                // 只在没有使用者时移除，避免误删他人持有的记录
                if record.ref_count() == 0 && !record.is_recovering() {
                    self.records
                        .remove_if(&key, |_, current| Arc::ptr_eq(current, &record));
                }
                Err(e)
            }
        }
    }

    /// Run the handshake for `record` and install the resulting transport
    async fn establish(&self, record: &Arc<ConnectionRecord>) -> Result<(), SshError> {
        self.negotiation_count.fetch_add(1, Ordering::SeqCst);
        let timeout = Duration::from_secs(record.config.timeout_secs.max(1));

        let transport = tokio::time::timeout(timeout, self.factory.connect(&record.config))
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "negotiation with {} timed out after {}s",
                    record.key,
                    timeout.as_secs()
                ))
            })??;

        if let Some(previous) = record.install(transport) {
            // 旧 transport 已失效，尽力关闭
            previous.disconnect().await;
        }
        self.start_heartbeat(record);
        Ok(())
    }

    /// 释放连接引用（减少引用计数）
    ///
    /// 不会立即断开：其他 tab 可能仍依赖此连接，关闭由空闲清扫完成。
    pub fn release(&self, key: &ConnectionKey, tab_id: &TabId) -> Result<u32, SshError> {
        let record = self
            .records
            .get(key)
            .map(|e| e.value().clone())
            .ok_or_else(|| SshError::NotFound(key.to_string()))?;

        let count = match record.release(tab_id) {
            Some(count) => count,
            None => {
                warn!("Tab {} holds no reference on {}", tab_id, key);
                return Ok(record.ref_count());
            }
        };

        if !record.tabs.lock().contains_key(tab_id) {
            self.tab_bindings.remove_if(tab_id, |_, bound| bound == key);
        }

        if count == 0 {
            info!(
                "Connection {} idle, eligible for teardown in {}s",
                key, self.config.idle_grace_secs
            );
        }
        Ok(count)
    }

    /// Drop every reference `tab_id` holds. Returns the key it was bound to.
    pub fn release_tab(&self, tab_id: &TabId) -> Option<ConnectionKey> {
        let (_, key) = self.tab_bindings.remove(tab_id)?;
        if let Some(record) = self.get(&key) {
            let mut released = 0;
            while record.release(tab_id).is_some() {
                released += 1;
            }
            debug!(
                "Tab {} released {} references on {} ({} remaining)",
                tab_id,
                released,
                key,
                record.ref_count()
            );
        }
        Some(key)
    }

    /// Record currently bound to `tab_id`
    pub fn record_for_tab(&self, tab_id: &TabId) -> Option<Arc<ConnectionRecord>> {
        let key = self.tab_bindings.get(tab_id)?.value().clone();
        self.get(&key)
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<ConnectionRecord>> {
        self.records.get(key).map(|e| e.value().clone())
    }

    /// Number of handshakes performed so far (including reconnects)
    pub fn negotiation_count(&self) -> u64 {
        self.negotiation_count.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.records.len()
    }

    /// 清扫空闲连接
    ///
    /// 移除引用计数为零、超过宽限期、且不在恢复中的记录。返回被移除的 key。
    pub async fn sweep_idle(&self) -> Vec<ConnectionKey> {
        let grace = self.config.idle_grace();
        let expired: Vec<Arc<ConnectionRecord>> = self
            .records
            .iter()
            .filter(|e| {
                let r = e.value();
                r.ref_count() == 0
                    && !r.is_recovering()
                    && !self.negotiations.is_pending(&r.key)
                    && r.idle_for().map(|d| d >= grace).unwrap_or(false)
            })
            .map(|e| e.value().clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for record in expired {
            let key = record.key.clone();
            // 再次确认：清扫期间可能有新的使用者
            let taken = self
                .records
                .remove_if(&key, |_, r| Arc::ptr_eq(r, &record) && r.ref_count() == 0);
            if taken.is_none() {
                continue;
            }
            info!("Connection {} idle grace expired, disconnecting", key);
            record.teardown().await;
            self.publish(LinkEvent::Removed { key: key.clone() });
            removed.push(key);
        }
        removed
    }

    /// Start the periodic idle sweep (idempotent)
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let weak = self.self_ref.clone();
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                let removed = registry.sweep_idle().await;
                if !removed.is_empty() {
                    debug!("Idle sweep removed {} connections", removed.len());
                }
            }
        }));
    }

    /// 启动连接的心跳监控任务
    ///
    /// IO 错误立即判定断开；超时累计到阈值后判定断开。
    fn start_heartbeat(&self, record: &Arc<ConnectionRecord>) {
        if self.config.heartbeat_interval_secs == 0 {
            return;
        }

        let weak = self.self_ref.clone();
        let record_weak = Arc::downgrade(record);
        let period = Duration::from_secs(self.config.heartbeat_interval_secs);
        let threshold = self.config.heartbeat_fail_threshold.max(1);
        let key = record.key.clone();

        let task = tokio::spawn(async move {
            debug!(
                "Heartbeat task started for connection {} (interval={}s, threshold={})",
                key,
                period.as_secs(),
                threshold
            );
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(record) = record_weak.upgrade() else {
                    break;
                };
                let Some(transport) = record.transport() else {
                    break;
                };

                let reason = match transport.ping().await {
                    PingResult::Ok => {
                        record.heartbeat_failures.store(0, Ordering::SeqCst);
                        continue;
                    }
                    PingResult::IoError => "transport IO error".to_string(),
                    PingResult::Timeout => {
                        let failures = record.heartbeat_failures.fetch_add(1, Ordering::SeqCst) + 1;
                        warn!(
                            "Connection {} heartbeat timeout ({}/{})",
                            key, failures, threshold
                        );
                        if failures < threshold {
                            continue;
                        }
                        format!("{} consecutive heartbeat timeouts", failures)
                    }
                };

                if let Some(registry) = weak.upgrade() {
                    registry.mark_link_down(&key, &reason);
                }
                break;
            }

            debug!("Heartbeat task stopped for connection {}", key);
        });

        record.set_heartbeat_task(task);
    }

    /// 标记链路断开：ready=false，进入恢复状态，并广播 [`LinkEvent::Down`]
    pub fn mark_link_down(&self, key: &ConnectionKey, reason: &str) {
        let Some(record) = self.get(key) else {
            return;
        };
        if record.is_recovering() {
            return;
        }
        error!("Connection {} link down: {}", key, reason);
        record.mark_down();
        self.publish(LinkEvent::Down {
            key: key.clone(),
            error: reason.to_string(),
        });
    }

    /// Recovery gave up; the record becomes eligible for the idle sweep again
    pub fn end_recovery(&self, key: &ConnectionKey) {
        if let Some(record) = self.get(key) {
            record.recovering.store(false, Ordering::SeqCst);
            if record.ref_count() == 0 {
                *record.idle_since.lock() = Some(Instant::now());
            }
        }
    }

    /// 强制断开并移除
    pub async fn disconnect(&self, key: &ConnectionKey) -> Result<(), SshError> {
        let (_, record) = self
            .records
            .remove(key)
            .ok_or_else(|| SshError::NotFound(key.to_string()))?;
        self.tab_bindings.retain(|_, bound| bound != key);
        info!("Force disconnecting connection {}", key);
        record.teardown().await;
        self.publish(LinkEvent::Removed { key: key.clone() });
        Ok(())
    }

    /// 断开所有连接（应用退出时调用）
    pub async fn disconnect_all(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let keys: Vec<ConnectionKey> = self.records.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Err(e) = self.disconnect(&key).await {
                warn!("Failed to disconnect {}: {}", key, e);
            }
        }
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.records.iter().map(|e| e.value().to_info()).collect()
    }

    pub fn get_stats(&self) -> ConnectionPoolStats {
        let mut stats = ConnectionPoolStats {
            total_connections: self.records.len(),
            negotiations: self.negotiation_count(),
            pool_capacity: self.config.max_connections,
            ..Default::default()
        };
        for entry in self.records.iter() {
            let record = entry.value();
            if record.is_ready() {
                stats.ready_connections += 1;
            }
            if record.is_recovering() {
                stats.recovering_connections += 1;
            }
            if record.ref_count() == 0 {
                stats.idle_connections += 1;
            }
            stats.total_ref_count = stats.total_ref_count.saturating_add(record.ref_count());
        }
        stats
    }
}

#[async_trait]
impl ReconnectTarget for ConnectionRegistry {
    /// Re-run the handshake with the record's stored config and swap the
    /// transport in place.
    async fn reconnect(&self, key: &ConnectionKey) -> Result<Arc<dyn Transport>, SshError> {
        let record = self
            .get(key)
            .ok_or_else(|| SshError::NotFound(key.to_string()))?;
        record.mark_down();
        self.establish(&record).await?;
        let transport = record.transport().ok_or(SshError::Disconnected)?;
        info!("Connection {} re-negotiated", key);
        self.publish(LinkEvent::Restored { key: key.clone() });
        Ok(transport)
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        for entry in self.records.iter() {
            entry.value().cancel_heartbeat();
        }
    }
}
