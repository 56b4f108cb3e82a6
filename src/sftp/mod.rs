//! SFTP module - per-tab sessions and operation scheduling
//!
//! Provides the sub-channel seam, the per-tab session pool with idle/capacity
//! eviction and health probing, the per-tab operation queue and chunked
//! transfers with progress.

pub mod channel;
pub mod error;
pub mod health;
pub mod history;
pub mod path_utils;
pub mod queue;
pub mod session_manager;
pub mod transfer;
pub mod types;

pub use channel::{delete_recursive, RusshSftpChannel, SftpChannel};
pub use error::{ErrorKind, SftpError};
pub use health::{HealthProbe, ProbeOutcome};
pub use history::{OperationHistory, OperationRecord};
pub use queue::{translate_error, OperationQueue, QueueConfig, QueuedOperationInfo};
pub use session_manager::{
    CloseReason, SftpPoolConfig, SftpPoolStats, SftpSession, SftpSessionInfo,
    SessionLease, SftpSessionManager, MAX_SESSIONS_PER_TAB,
};
pub use transfer::{
    TransferControl, TransferDirection, TransferGuard, TransferManager, TransferSnapshot,
    TransferStatus, TransferTask,
};
pub use types::*;
