//! Operation history
//!
//! Bounded in-memory log of every executed queue entry, newest last.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::types::OperationKind;
use crate::ssh::TabId;

/// Default number of retained records
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// One executed filesystem operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub timestamp: DateTime<Utc>,
    pub tab_id: TabId,
    pub operation: OperationKind,
    pub path: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Callers resolved by this execution (1 + merged subscribers)
    pub callers: usize,
}

pub struct OperationHistory {
    records: Mutex<VecDeque<OperationRecord>>,
    limit: usize,
}

impl OperationHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            limit: limit.max(1),
        }
    }

    pub fn record(&self, record: OperationRecord) {
        let mut records = self.records.lock();
        while records.len() >= self.limit {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Records oldest first, optionally filtered by tab
    pub fn list(&self, tab_id: Option<&TabId>) -> Vec<OperationRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| tab_id.map(|t| &r.tab_id == t).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl Default for OperationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tab: &str, path: &str) -> OperationRecord {
        OperationRecord {
            timestamp: Utc::now(),
            tab_id: TabId::from(tab),
            operation: OperationKind::Readdir,
            path: Some(path.to_string()),
            success: true,
            error: None,
            callers: 1,
        }
    }

    #[test]
    fn test_bounded() {
        let history = OperationHistory::new(2);
        history.record(record("t", "/a"));
        history.record(record("t", "/b"));
        history.record(record("t", "/c"));

        let paths: Vec<_> = history
            .list(None)
            .into_iter()
            .filter_map(|r| r.path)
            .collect();
        assert_eq!(paths, vec!["/b", "/c"]);
    }

    #[test]
    fn test_filter_and_clear() {
        let history = OperationHistory::default();
        history.record(record("t1", "/a"));
        history.record(record("t2", "/b"));

        assert_eq!(history.list(Some(&TabId::from("t2"))).len(), 1);
        history.clear();
        assert!(history.is_empty());
    }
}
