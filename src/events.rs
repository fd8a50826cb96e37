//! Analytics Event Sink
//!
//! Structured records for every significant transition (intake, dispatch,
//! start, terminal, error-pattern threshold crossing, ...). The JSONL sink
//! writes one record per line, append-only, for the dashboard to consume.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Severity of an event record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Pipeline stage that produced the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventCategory {
    Intake,
    Classification,
    Dispatch,
    Start,
    Terminal,
    ErrorPattern,
    Rebalance,
    Summary,
    Internal,
}

/// A single analytics record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub task_id: Option<String>,
    pub level: EventLevel,
    pub category: EventCategory,
    pub message: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            task_id: None,
            level: EventLevel::Info,
            category,
            message: message.into(),
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn for_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn with_level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Destination for analytics records. Implementations must not block for long.
pub trait EventSink: Send + Sync {
    fn emit(&self, record: EventRecord);
}

/// Discards every record
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _record: EventRecord) {}
}

/// Keeps records in memory (status views, tests)
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    records: Mutex<Vec<EventRecord>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().clone()
    }

    pub fn count(&self, category: EventCategory) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.category == category)
            .count()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, record: EventRecord) {
        self.records.lock().push(record);
    }
}

/// Append-only line-delimited JSON file
pub struct JsonlEventSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlEventSink {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlEventSink {
    fn emit(&self, record: EventRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize event record: {}", e);
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!("Failed to write event to {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_appends_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");

        let sink = JsonlEventSink::open(&path).unwrap();
        sink.emit(EventRecord::new(EventCategory::Intake, "accepted").for_task("t1"));
        sink.emit(
            EventRecord::new(EventCategory::Terminal, "failed")
                .with_level(EventLevel::Warn)
                .with_data(serde_json::json!({"error": "boom"})),
        );
        drop(sink);

        // Reopening appends rather than truncating
        let sink = JsonlEventSink::open(&path).unwrap();
        sink.emit(EventRecord::new(EventCategory::Summary, "tick"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: EventRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.task_id.as_deref(), Some("t1"));
        assert_eq!(first.category, EventCategory::Intake);
        assert!(lines[1].contains("\"warn\""));
    }

    #[test]
    fn test_memory_sink_counts() {
        let sink = MemoryEventSink::new();
        sink.emit(EventRecord::new(EventCategory::Dispatch, "a"));
        sink.emit(EventRecord::new(EventCategory::Dispatch, "b"));
        sink.emit(EventRecord::new(EventCategory::Start, "c"));
        assert_eq!(sink.count(EventCategory::Dispatch), 2);
        assert_eq!(sink.records().len(), 3);
    }
}
