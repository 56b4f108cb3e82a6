//! Configuration Management Module
//!
//! Engine tunables and their persistent storage.

pub mod storage;
pub mod types;

pub use storage::{config_dir, engine_config_file, ConfigStorage, StorageError, CONFIG_PATH_ENV};
pub use types::{EngineConfig, CONFIG_VERSION};
