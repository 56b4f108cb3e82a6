//! SFTP data types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// File entry information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name (not full path)
    pub name: String,
    /// Full path
    pub path: String,
    /// File type
    pub file_type: FileType,
    /// File size in bytes
    pub size: u64,
    /// Last modified time (Unix timestamp)
    pub modified: i64,
    /// File permissions (octal string, e.g., "755")
    pub permissions: String,
}

/// File type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Dotfile
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }
}

/// Scheduling priority of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    /// Runs right after the in-flight head, never preempts it
    High,
}

/// Kind of filesystem operation, used for merge matching and pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Readdir,
    Stat,
    Read,
    Write,
    Rename,
    Mkdir,
    Delete,
    Chmod,
    #[default]
    Other,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Readdir => "readdir",
            OperationKind::Stat => "stat",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Rename => "rename",
            OperationKind::Mkdir => "mkdir",
            OperationKind::Delete => "delete",
            OperationKind::Chmod => "chmod",
            OperationKind::Other => "other",
        }
    }

    /// Pause inserted before the next queue entry runs
    pub fn pacing_delay(&self, readdir: Duration, other: Duration) -> Duration {
        match self {
            OperationKind::Readdir => readdir,
            _ => other,
        }
    }
}

/// Options accompanying an enqueued operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationOptions {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, rename = "type")]
    pub kind: OperationKind,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub mergeable: bool,
}

impl OperationOptions {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn mergeable(mut self, mergeable: bool) -> Self {
        self.mergeable = mergeable;
        self
    }

    /// Directory listing; mergeable with an identical pending listing
    pub fn readdir(path: impl Into<String>) -> Self {
        Self::new(OperationKind::Readdir).path(path).mergeable(true)
    }
}
