//! Bounded record of recent backup runs.

use crate::metadata::{BackupMetadata, BackupType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::RwLock;

pub const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub timestamp: DateTime<Utc>,
    pub schedule_id: Option<String>,
    pub backup_type: BackupType,
    pub filename: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
    pub size: u64,
    pub error: Option<String>,
    pub metadata: Option<BackupMetadata>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounts {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Oldest entries fall off once the ring is full.
#[derive(Debug)]
pub struct RunHistory {
    items: RwLock<VecDeque<HistoryItem>>,
    capacity: usize,
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl RunHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, item: HistoryItem) {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        if items.len() == self.capacity {
            items.pop_front();
        }
        items.push_back(item);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<HistoryItem> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items.iter().rev().take(limit).cloned().collect()
    }

    pub fn counts(&self) -> RunCounts {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        let succeeded = items.iter().filter(|i| i.success).count();
        RunCounts {
            total: items.len(),
            succeeded,
            failed: items.len() - succeeded,
        }
    }

    /// Failed runs since the most recent success.
    pub fn consecutive_failures(&self) -> usize {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items.iter().rev().take_while(|i| !i.success).count()
    }

    pub fn last_success(&self) -> Option<HistoryItem> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items.iter().rev().find(|i| i.success).cloned()
    }
}
