//! Reconnection Manager
//!
//! Per-connection state machine that restores a lost transport.
//!
//! ```text
//! connected ──loss──▶ scheduled ──backoff──▶ reconnecting ──ok──▶ succeeded ──▶ connected
//!     ▲                   ▲  │                    │
//!     │                   │  pause               fail
//!     │                   │  ▼                    ▼
//!     │                 resume ◀── paused       failed ──▶ scheduled (retry < max)
//!     │                                           └──────▶ abandoned (retry ≥ max / auth)
//! ```
//!
//! The manager never owns a transport. Attempts go through a
//! [`ReconnectTarget`] (the connection registry), which swaps the transport in
//! place; the manager only keeps a `Weak` handle for status reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::{EngineEvent, EventBus};
use crate::ssh::{ConnectionKey, SshConfig, SshError, Transport};

/// Performs one re-negotiation for a connection
#[async_trait]
pub trait ReconnectTarget: Send + Sync {
    /// Re-run the handshake for `key`; returns the transport now in service
    async fn reconnect(&self, key: &ConnectionKey) -> Result<Arc<dyn Transport>, SshError>;
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial delay before first reconnection attempt (ms)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts (ms)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Whether loss detection schedules attempts automatically
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_enabled() -> bool {
    true
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            enabled: default_enabled(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before the attempt following `retry_count` failures
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let base = self.initial_delay_ms as f64;
        let delay = base * self.backoff_multiplier.max(1.0).powi(retry_count as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectState {
    Connected,
    Scheduled,
    Reconnecting,
    Paused,
    Succeeded,
    Failed,
    Abandoned,
}

/// Options for [`ReconnectionManager::register_session`]
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    /// Schedule an attempt immediately
    pub auto_start: bool,
    /// Initial state when not auto-starting; only `Connected` and `Paused` are honoured
    pub state: ReconnectState,
    pub max_retries: Option<u32>,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            auto_start: false,
            state: ReconnectState::Connected,
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconnectError {
    #[error("No reconnection session for {0}")]
    NoSession(String),

    #[error("Reconnection abandoned for {0}")]
    Abandoned(String),

    #[error("Reconnection already in progress for {0}")]
    InProgress(String),

    #[error("Reconnect failed: {0}")]
    Failed(#[from] SshError),
}

impl Serialize for ReconnectError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Snapshot of one session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectStatus {
    pub connection: ConnectionKey,
    pub state: ReconnectState,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Current backoff delay in milliseconds
    pub delay_ms: u64,
    pub last_error: Option<String>,
    pub paused: bool,
    /// `None` when no transport was registered or it has been dropped
    pub transport_connected: Option<bool>,
    pub host: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectStatistics {
    pub total_sessions: usize,
    pub connected: usize,
    pub scheduled: usize,
    pub reconnecting: usize,
    pub paused: usize,
    pub abandoned: usize,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_abandoned: u64,
}

struct ReconnectSession {
    key: ConnectionKey,
    state: ReconnectState,
    retry_count: u32,
    max_retries: u32,
    delay: Duration,
    last_error: Option<String>,
    /// 暂停标志独立于 state：进行中的尝试结束后仍需知道是否暂停
    paused: bool,
    in_flight: bool,
    timer: Option<JoinHandle<()>>,
    /// 每次调度/尝试递增，过期的定时器和尝试结果据此丢弃
    generation: u64,
    config: Option<SshConfig>,
    transport: Option<Weak<dyn Transport>>,
}

impl ReconnectSession {
    fn new(key: ConnectionKey, max_retries: u32) -> Self {
        Self {
            key,
            state: ReconnectState::Connected,
            retry_count: 0,
            max_retries,
            delay: Duration::ZERO,
            last_error: None,
            paused: false,
            in_flight: false,
            timer: None,
            generation: 0,
            config: None,
            transport: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn status(&self) -> ReconnectStatus {
        ReconnectStatus {
            connection: self.key.clone(),
            state: self.state,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            delay_ms: self.delay.as_millis() as u64,
            last_error: self.last_error.clone(),
            paused: self.paused,
            transport_connected: self
                .transport
                .as_ref()
                .and_then(|w| w.upgrade())
                .map(|t| t.is_connected()),
            host: self.config.as_ref().map(|c| c.host.clone()),
        }
    }
}

enum Trigger {
    Timer(u64),
    Manual,
}

pub struct ReconnectionManager {
    sessions: DashMap<ConnectionKey, Arc<Mutex<ReconnectSession>>>,
    target: Arc<dyn ReconnectTarget>,
    events: Arc<EventBus>,
    config: ReconnectConfig,
    total_attempts: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_abandoned: AtomicU64,
    self_ref: Weak<ReconnectionManager>,
}

impl ReconnectionManager {
    pub fn new(
        target: Arc<dyn ReconnectTarget>,
        events: Arc<EventBus>,
        config: ReconnectConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            sessions: DashMap::new(),
            target,
            events,
            config,
            total_attempts: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_abandoned: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    fn session(&self, key: &ConnectionKey) -> Option<Arc<Mutex<ReconnectSession>>> {
        self.sessions.get(key).map(|e| e.value().clone())
    }

    fn session_or_insert(&self, key: &ConnectionKey) -> Arc<Mutex<ReconnectSession>> {
        self.sessions
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ReconnectSession::new(
                    key.clone(),
                    self.config.max_retries,
                )))
            })
            .value()
            .clone()
    }

    /// Create or re-associate the session for `key`.
    ///
    /// Re-association resets the retry budget and leaves `abandoned`.
    pub fn register_session(
        &self,
        key: &ConnectionKey,
        transport: Option<&Arc<dyn Transport>>,
        config: SshConfig,
        options: RegisterOptions,
    ) {
        let entry = self.session_or_insert(key);
        let mut session = entry.lock();

        session.cancel_timer();
        session.generation += 1;
        session.in_flight = false;
        session.retry_count = 0;
        session.delay = Duration::ZERO;
        session.last_error = None;
        session.max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        session.config = Some(config);
        session.transport = transport.map(Arc::downgrade);

        if options.auto_start {
            session.paused = false;
            info!("Reconnection registered for {} (auto start)", key);
            self.schedule(&mut session);
        } else {
            session.paused = options.state == ReconnectState::Paused;
            session.state = if session.paused {
                ReconnectState::Paused
            } else {
                ReconnectState::Connected
            };
            debug!("Reconnection registered for {} ({:?})", key, session.state);
        }
    }

    /// Transport loss observed for `key`; schedules the first attempt
    pub fn handle_connection_lost(&self, key: &ConnectionKey, error: &str) {
        let entry = self.session_or_insert(key);
        let mut session = entry.lock();

        match session.state {
            ReconnectState::Scheduled | ReconnectState::Reconnecting | ReconnectState::Abandoned => {
                debug!(
                    "Connection loss for {} ignored in state {:?}",
                    key, session.state
                );
                return;
            }
            _ if session.in_flight => return,
            _ => {}
        }

        warn!("Connection {} lost: {}", key, error);
        session.last_error = Some(error.to_string());
        self.events.emit(
            key,
            EngineEvent::ConnectionLost {
                error: error.to_string(),
            },
        );

        session.retry_count = 0;
        if session.paused || !self.config.enabled {
            session.paused = true;
            session.state = ReconnectState::Paused;
            info!("Automatic reconnection for {} is paused", key);
            return;
        }
        self.schedule(&mut session);
    }

    /// Arm the backoff timer. Caller holds the session lock.
    fn schedule(&self, session: &mut ReconnectSession) {
        session.cancel_timer();
        session.generation += 1;
        session.delay = self.config.backoff(session.retry_count);
        session.state = ReconnectState::Scheduled;

        self.events.emit(
            &session.key,
            EngineEvent::ReconnectScheduled {
                delay: session.delay.as_millis() as u64,
                retry_count: session.retry_count,
            },
        );
        info!(
            "Reconnect for {} scheduled in {}ms (retry {}/{})",
            session.key,
            session.delay.as_millis(),
            session.retry_count,
            session.max_retries
        );

        let weak = self.self_ref.clone();
        let key = session.key.clone();
        let generation = session.generation;
        let delay = session.delay;
        session.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                if let Err(e) = manager.attempt(&key, Trigger::Timer(generation)).await {
                    debug!("Scheduled reconnect for {} ended: {}", key, e);
                }
            }
        }));
    }

    fn abandon(&self, session: &mut ReconnectSession, reason: String) {
        session.cancel_timer();
        session.state = ReconnectState::Abandoned;
        self.total_abandoned.fetch_add(1, Ordering::SeqCst);
        error!(
            "Reconnection for {} abandoned after {} attempts: {}",
            session.key, session.retry_count, reason
        );
        self.events.emit(
            &session.key,
            EngineEvent::ReconnectAbandoned {
                reason,
                attempts: session.retry_count,
            },
        );
    }

    async fn attempt(&self, key: &ConnectionKey, trigger: Trigger) -> Result<(), ReconnectError> {
        let entry = self
            .session(key)
            .ok_or_else(|| ReconnectError::NoSession(key.to_string()))?;

        let generation = {
            let mut session = entry.lock();
            let manual = match trigger {
                Trigger::Timer(generation) => {
                    if session.generation != generation
                        || session.state != ReconnectState::Scheduled
                        || session.paused
                    {
                        return Ok(());
                    }
                    false
                }
                Trigger::Manual => {
                    if session.state == ReconnectState::Abandoned {
                        return Err(ReconnectError::Abandoned(key.to_string()));
                    }
                    if session.in_flight {
                        return Err(ReconnectError::InProgress(key.to_string()));
                    }
                    true
                }
            };

            // 手动尝试时取消挂起的定时器；定时器触发时 take 的是自身句柄
            let timer = session.timer.take();
            if manual {
                if let Some(timer) = timer {
                    timer.abort();
                }
            }
            session.generation += 1;
            session.in_flight = true;
            session.retry_count += 1;
            session.state = ReconnectState::Reconnecting;
            self.total_attempts.fetch_add(1, Ordering::SeqCst);

            info!(
                "Reconnecting {} (attempt {}/{}{})",
                key,
                session.retry_count,
                session.max_retries,
                if manual { ", manual" } else { "" }
            );
            self.events.emit(
                key,
                EngineEvent::ReconnectStarted {
                    attempt: session.retry_count,
                    manual,
                },
            );
            session.generation
        };

        let result = self.target.reconnect(key).await;

        let mut session = entry.lock();
        if session.generation != generation || !self.sessions.contains_key(key) {
            debug!("Stale reconnect result for {} discarded", key);
            return result.map(|_| ()).map_err(ReconnectError::from);
        }
        session.in_flight = false;
        let attempts = session.retry_count;

        match result {
            Ok(transport) => {
                session.state = ReconnectState::Succeeded;
                self.total_successes.fetch_add(1, Ordering::SeqCst);
                info!("Reconnected {} after {} attempts", key, attempts);
                self.events
                    .emit(key, EngineEvent::ReconnectSuccess { attempts });

                session.transport = Some(Arc::downgrade(&transport));
                session.state = ReconnectState::Connected;
                session.retry_count = 0;
                session.delay = Duration::ZERO;
                session.last_error = None;
                session.paused = false;
                Ok(())
            }
            Err(e) => {
                session.state = ReconnectState::Failed;
                session.last_error = Some(e.to_string());
                self.total_failures.fetch_add(1, Ordering::SeqCst);
                warn!("Reconnect attempt {} for {} failed: {}", attempts, key, e);
                self.events.emit(
                    key,
                    EngineEvent::ReconnectFailed {
                        error: e.to_string(),
                        attempts,
                    },
                );

                if e.is_auth() {
                    self.abandon(&mut session, format!("authentication failed: {}", e));
                } else if session.paused {
                    session.state = ReconnectState::Paused;
                } else if session.retry_count >= session.max_retries {
                    let reason = format!("max retries ({}) exceeded", session.max_retries);
                    self.abandon(&mut session, reason);
                } else {
                    self.schedule(&mut session);
                }
                Err(ReconnectError::Failed(e))
            }
        }
    }

    /// Attempt immediately, bypassing the backoff delay. Works while paused.
    pub async fn manual_reconnect(&self, key: &ConnectionKey) -> Result<(), ReconnectError> {
        self.attempt(key, Trigger::Manual).await
    }

    /// Stop automatic attempts; an in-flight attempt runs to completion
    pub fn pause_reconnection(&self, key: &ConnectionKey) -> Result<(), ReconnectError> {
        let entry = self
            .session(key)
            .ok_or_else(|| ReconnectError::NoSession(key.to_string()))?;
        let mut session = entry.lock();
        if session.state == ReconnectState::Abandoned {
            return Err(ReconnectError::Abandoned(key.to_string()));
        }

        session.paused = true;
        if matches!(
            session.state,
            ReconnectState::Scheduled | ReconnectState::Reconnecting
        ) {
            if !session.in_flight {
                session.cancel_timer();
            }
            session.state = ReconnectState::Paused;
            info!("Reconnection for {} paused", key);
        }
        Ok(())
    }

    /// Resume automatic attempts; a paused session is rescheduled
    pub fn resume_reconnection(&self, key: &ConnectionKey) -> Result<(), ReconnectError> {
        let entry = self
            .session(key)
            .ok_or_else(|| ReconnectError::NoSession(key.to_string()))?;
        let mut session = entry.lock();
        if session.state == ReconnectState::Abandoned {
            return Err(ReconnectError::Abandoned(key.to_string()));
        }

        let was_paused = std::mem::replace(&mut session.paused, false);
        if !was_paused {
            return Ok(());
        }
        info!("Reconnection for {} resumed", key);
        if session.in_flight {
            session.state = ReconnectState::Reconnecting;
        } else if session.state == ReconnectState::Paused {
            self.schedule(&mut session);
        }
        Ok(())
    }

    pub fn get_session_status(&self, key: &ConnectionKey) -> Option<ReconnectStatus> {
        self.session(key).map(|s| s.lock().status())
    }

    pub fn list_sessions(&self) -> Vec<ReconnectStatus> {
        self.sessions
            .iter()
            .map(|e| e.value().lock().status())
            .collect()
    }

    pub fn get_statistics(&self) -> ReconnectStatistics {
        let mut stats = ReconnectStatistics {
            total_sessions: self.sessions.len(),
            total_attempts: self.total_attempts.load(Ordering::SeqCst),
            total_successes: self.total_successes.load(Ordering::SeqCst),
            total_failures: self.total_failures.load(Ordering::SeqCst),
            total_abandoned: self.total_abandoned.load(Ordering::SeqCst),
            ..Default::default()
        };
        for entry in self.sessions.iter() {
            match entry.value().lock().state {
                ReconnectState::Connected | ReconnectState::Succeeded => stats.connected += 1,
                ReconnectState::Scheduled | ReconnectState::Failed => stats.scheduled += 1,
                ReconnectState::Reconnecting => stats.reconnecting += 1,
                ReconnectState::Paused => stats.paused += 1,
                ReconnectState::Abandoned => stats.abandoned += 1,
            }
        }
        stats
    }

    /// Drop the session (owning connection destroyed)
    pub fn remove_session(&self, key: &ConnectionKey) -> bool {
        match self.sessions.remove(key) {
            Some((_, entry)) => {
                let mut session = entry.lock();
                session.cancel_timer();
                session.generation += 1;
                self.events.forget(key);
                debug!("Reconnection session for {} removed", key);
                true
            }
            None => false,
        }
    }
}

impl Drop for ReconnectionManager {
    fn drop(&mut self) {
        for entry in self.sessions.iter() {
            entry.value().lock().cancel_timer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::events::EventEnvelope;
    use crate::testing::MockTransport;
    use crate::testing::MockChannel;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

    /// Scripted target: pops one outcome per attempt, succeeding when empty
    struct ScriptedTarget {
        outcomes: Mutex<VecDeque<Result<(), SshError>>>,
        calls: AtomicU32,
        transport: Arc<dyn Transport>,
    }

    impl ScriptedTarget {
        fn new(outcomes: Vec<Result<(), SshError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
                transport: Arc::new(MockTransport::new(MockChannel::new())),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReconnectTarget for ScriptedTarget {
        async fn reconnect(&self, _key: &ConnectionKey) -> Result<Arc<dyn Transport>, SshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self.outcomes.lock().pop_front().unwrap_or(Ok(()));
            outcome.map(|_| self.transport.clone())
        }
    }

    fn key() -> ConnectionKey {
        ConnectionKey::new("example.com", 22, "alice", "fp")
    }

    fn transport_err() -> SshError {
        SshError::Transport("connection refused".into())
    }

    fn manager(
        target: Arc<ScriptedTarget>,
        max_retries: u32,
    ) -> (Arc<ReconnectionManager>, mpsc::UnboundedReceiver<EventEnvelope>) {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        let manager = ReconnectionManager::new(
            target,
            bus,
            ReconnectConfig {
                max_retries,
                ..Default::default()
            },
        );
        (manager, rx)
    }

    fn drain_names(rx: &mut mpsc::UnboundedReceiver<EventEnvelope>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(e) = rx.try_recv() {
            names.push(e.event.name());
        }
        names
    }

    #[test]
    fn test_backoff() {
        let config = ReconnectConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(1000));
        assert_eq!(config.backoff(1), Duration::from_millis(1500));
        assert_eq!(config.backoff(2), Duration::from_millis(2250));
        assert_eq!(config.backoff(20), Duration::from_millis(30000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_then_success() {
        let target = ScriptedTarget::new(vec![]);
        let (manager, mut rx) = manager(target.clone(), 3);

        manager.handle_connection_lost(&key(), "heartbeat failed");
        assert_eq!(
            manager.get_session_status(&key()).unwrap().state,
            ReconnectState::Scheduled
        );

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let status = manager.get_session_status(&key()).unwrap();
        assert_eq!(status.state, ReconnectState::Connected);
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.transport_connected, Some(true));
        assert_eq!(target.calls(), 1);
        assert_eq!(
            drain_names(&mut rx),
            vec![
                "connectionLost",
                "reconnectScheduled",
                "reconnectStarted",
                "reconnectSuccess"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_abandon_once() {
        let target = ScriptedTarget::new(vec![
            Err(transport_err()),
            Err(transport_err()),
            Err(transport_err()),
        ]);
        let (manager, mut rx) = manager(target.clone(), 3);

        manager.handle_connection_lost(&key(), "eof");
        tokio::time::sleep(Duration::from_secs(60)).await;

        let status = manager.get_session_status(&key()).unwrap();
        assert_eq!(status.state, ReconnectState::Abandoned);
        assert_eq!(target.calls(), 3);

        let names = drain_names(&mut rx);
        assert_eq!(
            names.iter().filter(|n| **n == "reconnectAbandoned").count(),
            1
        );
        assert_eq!(names.iter().filter(|n| **n == "reconnectFailed").count(), 3);
        assert_eq!(names.last(), Some(&"reconnectAbandoned"));

        // 放弃后不再有自动尝试，新的丢失信号也被忽略
        manager.handle_connection_lost(&key(), "eof");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(target.calls(), 3);
        assert_eq!(manager.get_statistics().total_abandoned, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_payload() {
        let target = ScriptedTarget::new(vec![Err(transport_err())]);
        let (manager, mut rx) = manager(target, 3);

        manager.handle_connection_lost(&key(), "eof");
        tokio::time::sleep(Duration::from_secs(10)).await;

        let scheduled: Vec<EngineEvent> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.event)
            .filter(|e| matches!(e, EngineEvent::ReconnectScheduled { .. }))
            .collect();
        assert_eq!(
            scheduled,
            vec![
                EngineEvent::ReconnectScheduled {
                    delay: 1000,
                    retry_count: 0
                },
                EngineEvent::ReconnectScheduled {
                    delay: 1500,
                    retry_count: 1
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_blocks_until_resume() {
        let target = ScriptedTarget::new(vec![]);
        let (manager, _rx) = manager(target.clone(), 3);

        manager.handle_connection_lost(&key(), "eof");
        manager.pause_reconnection(&key()).unwrap();
        assert_eq!(
            manager.get_session_status(&key()).unwrap().state,
            ReconnectState::Paused
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(target.calls(), 0);

        manager.resume_reconnection(&key()).unwrap();
        assert_eq!(
            manager.get_session_status(&key()).unwrap().state,
            ReconnectState::Scheduled
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(target.calls(), 1);
        assert_eq!(
            manager.get_session_status(&key()).unwrap().state,
            ReconnectState::Connected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_while_paused() {
        let target = ScriptedTarget::new(vec![Err(transport_err())]);
        let (manager, _rx) = manager(target.clone(), 3);

        manager.handle_connection_lost(&key(), "eof");
        manager.pause_reconnection(&key()).unwrap();

        let err = manager.manual_reconnect(&key()).await.unwrap_err();
        assert_eq!(err, ReconnectError::Failed(transport_err()));
        assert_eq!(
            manager.get_session_status(&key()).unwrap().state,
            ReconnectState::Paused
        );

        manager.manual_reconnect(&key()).await.unwrap();
        let status = manager.get_session_status(&key()).unwrap();
        assert_eq!(status.state, ReconnectState::Connected);
        assert!(!status.paused);
        assert_eq!(target.calls(), 2);
    }

    #[tokio::test]
    async fn test_manual_reconnect_unknown_key() {
        let target = ScriptedTarget::new(vec![]);
        let (manager, _rx) = manager(target, 3);
        assert!(matches!(
            manager.manual_reconnect(&key()).await,
            Err(ReconnectError::NoSession(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_abandons_immediately() {
        let target = ScriptedTarget::new(vec![Err(SshError::AuthenticationFailed(
            "password changed".into(),
        ))]);
        let (manager, mut rx) = manager(target.clone(), 5);

        manager.handle_connection_lost(&key(), "eof");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(target.calls(), 1);
        assert_eq!(
            manager.get_session_status(&key()).unwrap().state,
            ReconnectState::Abandoned
        );
        assert_eq!(drain_names(&mut rx).last(), Some(&"reconnectAbandoned"));
        assert!(matches!(
            manager.manual_reconnect(&key()).await,
            Err(ReconnectError::Abandoned(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_resets_abandoned() {
        let target = ScriptedTarget::new(vec![Err(SshError::KeyError("bad".into()))]);
        let (manager, _rx) = manager(target.clone(), 5);

        manager.handle_connection_lost(&key(), "eof");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            manager.get_session_status(&key()).unwrap().state,
            ReconnectState::Abandoned
        );

        manager.register_session(
            &key(),
            None,
            SshConfig::with_password("example.com", 22, "alice", "new"),
            RegisterOptions {
                auto_start: true,
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = manager.get_session_status(&key()).unwrap();
        assert_eq!(status.state, ReconnectState::Connected);
        assert_eq!(status.host.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn test_register_without_auto_start() {
        let target = ScriptedTarget::new(vec![]);
        let (manager, mut rx) = manager(target.clone(), 3);
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new(MockChannel::new()));

        manager.register_session(
            &key(),
            Some(&transport),
            SshConfig::default(),
            RegisterOptions {
                state: ReconnectState::Paused,
                ..Default::default()
            },
        );

        let status = manager.get_session_status(&key()).unwrap();
        assert_eq!(status.state, ReconnectState::Paused);
        assert_eq!(status.transport_connected, Some(true));
        assert!(drain_names(&mut rx).is_empty());

        drop(transport);
        assert_eq!(
            manager.get_session_status(&key()).unwrap().transport_connected,
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_session_cancels_timer() {
        let target = ScriptedTarget::new(vec![]);
        let (manager, _rx) = manager(target.clone(), 3);

        manager.handle_connection_lost(&key(), "eof");
        assert!(manager.remove_session(&key()));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(target.calls(), 0);
        assert!(manager.get_session_status(&key()).is_none());
        assert_eq!(manager.get_statistics().total_sessions, 0);
    }
}
