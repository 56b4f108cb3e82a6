//! Engine lifecycle events
//!
//! Reconnection transitions and transport loss are published as
//! [`EventEnvelope`]s. Consumers either register an [`EngineEventListener`]
//! (called synchronously, in emission order) or take an unbounded channel via
//! [`EventBus::subscribe`].
//!
//! 每个连接维护独立的单调递增序号（`seq`），前端可据此丢弃乱序或重复事件。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::ssh::ConnectionKey;

/// Event payloads. Serialized names are the wire names consumed by the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// Transport-level loss detected (heartbeat)
    ConnectionLost { error: String },

    ReconnectStarted { attempt: u32, manual: bool },

    ReconnectScheduled {
        /// Backoff before the next attempt, in milliseconds
        delay: u64,
        #[serde(rename = "retryCount")]
        retry_count: u32,
    },

    ReconnectSuccess { attempts: u32 },

    ReconnectFailed { error: String, attempts: u32 },

    ReconnectAbandoned { reason: String, attempts: u32 },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::ConnectionLost { .. } => "connectionLost",
            EngineEvent::ReconnectStarted { .. } => "reconnectStarted",
            EngineEvent::ReconnectScheduled { .. } => "reconnectScheduled",
            EngineEvent::ReconnectSuccess { .. } => "reconnectSuccess",
            EngineEvent::ReconnectFailed { .. } => "reconnectFailed",
            EngineEvent::ReconnectAbandoned { .. } => "reconnectAbandoned",
        }
    }
}

/// An event together with the connection it concerns
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub seq: u64,
    pub connection: ConnectionKey,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// Typed observer. Called on the emitting task while the emitter holds the
/// per-connection state lock, so it must not call back into the engine.
pub trait EngineEventListener: Send + Sync {
    fn on_event(&self, envelope: &EventEnvelope);
}

impl<F> EngineEventListener for F
where
    F: Fn(&EventEnvelope) + Send + Sync,
{
    fn on_event(&self, envelope: &EventEnvelope) {
        self(envelope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

/// 连接事件序列器：为每个连接维护独立的计数器
///
/// DashMap + AtomicU64，无锁递增。
pub struct EventSequencer {
    counters: DashMap<ConnectionKey, AtomicU64>,
}

impl EventSequencer {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// 下一个序号，从 1 开始（0 保留给"未初始化"）
    pub fn next(&self, key: &ConnectionKey) -> u64 {
        self.counters
            .entry(key.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// 当前序号（不递增），用于快照对齐
    pub fn current(&self, key: &ConnectionKey) -> u64 {
        self.counters
            .get(key)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn remove(&self, key: &ConnectionKey) {
        self.counters.remove(key);
    }
}

impl Default for EventSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan-out of engine events to listeners and channel subscribers
pub struct EventBus {
    sequencer: EventSequencer,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn EngineEventListener>)>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EventEnvelope>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            sequencer: EventSequencer::new(),
            listeners: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn EngineEventListener>) -> ListenerId {
        let id = ListenerId(Uuid::new_v4());
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Channel receiving every subsequent event in emission order
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EventEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, connection: &ConnectionKey, event: EngineEvent) -> EventEnvelope {
        // 持锁分配序号并投递，保证通道内顺序与 seq 一致
        let mut subscribers = self.subscribers.lock();
        let envelope = EventEnvelope {
            seq: self.sequencer.next(connection),
            connection: connection.clone(),
            timestamp: Utc::now(),
            event,
        };
        debug!(
            "Event {} #{} for {}",
            envelope.event.name(),
            envelope.seq,
            connection
        );

        for (_, listener) in self.listeners.read().iter() {
            listener.on_event(&envelope);
        }
        subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());
        envelope
    }

    pub fn current_seq(&self, connection: &ConnectionKey) -> u64 {
        self.sequencer.current(connection)
    }

    pub fn forget(&self, connection: &ConnectionKey) {
        self.sequencer.remove(connection);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConnectionKey {
        ConnectionKey::new("example.com", 22, "alice", "fp")
    }

    #[test]
    fn test_wire_format() {
        let envelope = EventEnvelope {
            seq: 3,
            connection: key(),
            timestamp: Utc::now(),
            event: EngineEvent::ReconnectScheduled {
                delay: 1500,
                retry_count: 1,
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "reconnectScheduled");
        assert_eq!(json["delay"], 1500);
        assert_eq!(json["retryCount"], 1);
        assert_eq!(json["seq"], 3);
        assert_eq!(json["connection"]["authFingerprint"], "fp");
    }

    #[test]
    fn test_sequence_per_connection() {
        let seq = EventSequencer::new();
        let other = ConnectionKey::new("other.com", 22, "alice", "fp");
        assert_eq!(seq.current(&key()), 0);
        assert_eq!(seq.next(&key()), 1);
        assert_eq!(seq.next(&key()), 2);
        assert_eq!(seq.next(&other), 1);
        seq.remove(&key());
        assert_eq!(seq.current(&key()), 0);
    }

    #[tokio::test]
    async fn test_listeners_and_subscribers_see_same_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = bus.add_listener(Arc::new(move |e: &EventEnvelope| {
            sink.lock().push(e.seq);
        }));
        let mut rx = bus.subscribe();

        bus.emit(&key(), EngineEvent::ConnectionLost { error: "eof".into() });
        bus.emit(&key(), EngineEvent::ReconnectSuccess { attempts: 1 });

        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(rx.recv().await.unwrap().event.name(), "connectionLost");
        assert_eq!(rx.recv().await.unwrap().seq, 2);

        assert!(bus.remove_listener(id));
        bus.emit(&key(), EngineEvent::ReconnectSuccess { attempts: 1 });
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let bus = EventBus::new();
        drop(bus.subscribe());
        bus.emit(&key(), EngineEvent::ReconnectSuccess { attempts: 1 });
        assert!(bus.subscribers.lock().is_empty());
    }
}
