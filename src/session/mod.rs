//! Session Management Module
//!
//! Provides:
//! - Reconnection state machine with exponential backoff and pause/resume
//! - Ordered lifecycle events with per-connection sequencing

pub mod events;
mod reconnect;

pub use events::{
    EngineEvent, EngineEventListener, EventBus, EventEnvelope, EventSequencer, ListenerId,
};
pub use reconnect::{
    ReconnectConfig, ReconnectError, ReconnectState, ReconnectStatistics, ReconnectStatus,
    ReconnectTarget, ReconnectionManager, RegisterOptions,
};
