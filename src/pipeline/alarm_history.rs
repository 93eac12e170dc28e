// src/pipeline/alarm_history.rs
//
// Bounded in-memory record of recent alarms for the status and history
// endpoints. Oldest entries are evicted first.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::{AlarmInfo, Rect};

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct AlarmHistoryEntry {
    pub alarm: AlarmInfo,
    /// Local wall-clock time, `%Y-%m-%d %H:%M:%S`
    pub timestamp_str: String,
}

/// JSON view of a history entry; the snapshot image is left out.
#[derive(Debug, Clone, Serialize)]
pub struct AlarmHistoryView {
    pub alarm_id: String,
    pub roi_id: i32,
    pub roi_name: String,
    pub group_id: i32,
    pub group_name: String,
    pub track_id: u32,
    pub class_id: i32,
    pub class_name: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub rect: Rect,
    pub timestamp: String,
    pub has_snapshot: bool,
}

impl From<&AlarmHistoryEntry> for AlarmHistoryView {
    fn from(entry: &AlarmHistoryEntry) -> Self {
        let a = &entry.alarm;
        Self {
            alarm_id: a.alarm_id.to_string(),
            roi_id: a.roi_id,
            roi_name: a.roi_name.clone(),
            group_id: a.group_id,
            group_name: a.group_name.clone(),
            track_id: a.track_id,
            class_id: a.class_id,
            class_name: a.class_name.clone(),
            confidence: a.confidence,
            rect: a.rect,
            timestamp: entry.timestamp_str.clone(),
            has_snapshot: a.snapshot.is_some(),
        }
    }
}

pub fn format_local_timestamp(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

pub struct AlarmHistory {
    entries: Mutex<VecDeque<AlarmHistoryEntry>>,
    capacity: usize,
}

impl Default for AlarmHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl AlarmHistory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, alarm: &AlarmInfo) {
        let entry = AlarmHistoryEntry {
            timestamp_str: format_local_timestamp(&alarm.timestamp),
            alarm: alarm.clone(),
        };

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Entries oldest → newest.
    pub fn query(&self) -> Vec<AlarmHistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
