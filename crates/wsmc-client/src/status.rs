//! Human-readable connection status history
//!
//! A bounded list of stage events ("handshake started", "connection closed",
//! ...) that the host can show to a user or persist as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Entries kept before the oldest are dropped
pub const STATUS_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub timestamp: DateTime<Utc>,
    pub level: StatusLevel,
    pub message: String,
}

/// Shared, cloneable status history
#[derive(Debug, Clone, Default)]
pub struct StatusLog {
    entries: Arc<Mutex<VecDeque<StatusEntry>>>,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(StatusLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.record(StatusLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(StatusLevel::Error, message);
    }

    /// Append an entry and mirror it to the log
    pub fn record(&self, level: StatusLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            StatusLevel::Info => info!("{}", message),
            StatusLevel::Warn => warn!("{}", message),
            StatusLevel::Error => error!("{}", message),
        }

        let mut entries = self.lock();
        if entries.len() == STATUS_LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(StatusEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<StatusEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn last(&self) -> Option<StatusEntry> {
        self.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.entries())
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Load a saved history, keeping only the newest entries
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut entries: VecDeque<StatusEntry> =
            serde_json::from_str(&content).map_err(std::io::Error::other)?;
        while entries.len() > STATUS_LOG_CAPACITY {
            entries.pop_front();
        }
        Ok(Self {
            entries: Arc::new(Mutex::new(entries)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<StatusEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_history() {
        let log = StatusLog::new();
        for i in 0..(STATUS_LOG_CAPACITY + 5) {
            log.info(format!("event {}", i));
        }
        assert_eq!(log.len(), STATUS_LOG_CAPACITY);
        assert_eq!(log.entries()[0].message, "event 5");
        assert_eq!(
            log.last().unwrap().message,
            format!("event {}", STATUS_LOG_CAPACITY + 4)
        );
    }

    #[test]
    fn test_clones_share_history() {
        let log = StatusLog::new();
        let other = log.clone();
        other.error("handshake failed: timeout");
        assert_eq!(log.last().unwrap().level, StatusLevel::Error);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let log = StatusLog::new();
        log.info("handshake started");
        log.warn("multiplexing not supported by server");
        log.save(&path).unwrap();

        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"level\": \"warn\""));

        let loaded = StatusLog::load(&path).unwrap();
        assert_eq!(loaded.entries(), log.entries());
    }
}
