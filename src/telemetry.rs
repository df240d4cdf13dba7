//! Telemetry plumbing
//!
//! Peers push one report per served request onto a [SendQueue]; the peer
//! control client drains it towards the master, which stamps every record
//! and appends it to its [LogSink].

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;

/// Request header carrying caller supplied metadata for the report
pub const REPORT_DATA_HEADER: &str = "X-Pocketcdn-Data";
/// Request header telling how to read [REPORT_DATA_HEADER], `json` or raw
pub const REPORT_TYPE_HEADER: &str = "X-Pocketcdn-Type";

pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

pub type Report = Map<String, Value>;

/// Record appended to the master's durable log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: i64,
    pub peer: String,
    pub data: Report,
}

impl LogRecord {
    /// Stamps `data` with the current time and the sending peer
    pub fn new(peer: impl Into<String>, data: Report) -> LogRecord {
        LogRecord {
            timestamp: Utc::now().timestamp(),
            peer: peer.into(),
            data,
        }
    }
}

/// Append-only destination for [LogRecord]s. `append` may block on IO
pub trait LogSink: Send + Sync {
    fn append(&self, record: &LogRecord) -> std::io::Result<()>;

    /// File backing the sink, if any. It is what `/_log` serves
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// JSON-lines sink over a file, or stdout
pub struct FileLogSink {
    path: Option<PathBuf>,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl FileLogSink {
    /// `None` or `-` writes to stdout
    pub fn open(path: Option<&Path>) -> std::io::Result<FileLogSink> {
        match path {
            Some(path) if path != Path::new("-") => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(FileLogSink {
                    path: Some(path.to_path_buf()),
                    writer: Mutex::new(Box::new(file)),
                })
            }
            _ => Ok(FileLogSink::stdout()),
        }
    }

    pub fn stdout() -> FileLogSink {
        FileLogSink {
            path: None,
            writer: Mutex::new(Box::new(std::io::stdout())),
        }
    }
}

impl LogSink for FileLogSink {
    fn append(&self, record: &LogRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&line)?;
        writer.flush()
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// In-memory sink, for embedding and tests
#[derive(Default, Clone)]
pub struct MemoryLogSink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryLogSink {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, record: &LogRecord) -> std::io::Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

struct QueueInner {
    items: Mutex<VecDeque<Report>>,
    capacity: usize,
    ready: Notify,
    dropped: AtomicU64,
}

/// Bounded outbound queue of reports
///
/// [SendQueue::push] never waits: when the queue is full the oldest report
/// is dropped to make room
#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<QueueInner>,
}

impl Default for SendQueue {
    fn default() -> Self {
        SendQueue::new(DEFAULT_SEND_QUEUE_CAPACITY)
    }
}

impl SendQueue {
    pub fn new(capacity: usize) -> SendQueue {
        SendQueue {
            inner: Arc::new(QueueInner {
                items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
                capacity: capacity.max(1),
                ready: Notify::new(),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn items(&self) -> std::sync::MutexGuard<'_, VecDeque<Report>> {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues `report`, dropping the oldest one if the queue is full.
    /// Returns whether a report was dropped
    pub fn push(&self, report: Report) -> bool {
        let dropped = {
            let mut items = self.items();
            let dropped = if items.len() >= self.inner.capacity {
                items.pop_front().is_some()
            } else {
                false
            };
            items.push_back(report);
            dropped
        };
        if dropped {
            let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(dropped:% = total; "Send queue full, dropped the oldest report");
        }
        self.inner.ready.notify_one();
        dropped
    }

    /// Puts back a report that could not be delivered, ahead of the others.
    /// It is discarded when the queue is already full
    pub fn requeue(&self, report: Report) {
        let requeued = {
            let mut items = self.items();
            if items.len() < self.inner.capacity {
                items.push_front(report);
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.ready.notify_one();
        } else {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Waits for the next report
    pub async fn pop(&self) -> Report {
        loop {
            if let Some(report) = self.items().pop_front() {
                return report;
            }
            self.inner.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Reports lost to overflow so far
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// Builds the report of one peer-served request
pub fn build_report(
    remote_addr: &str,
    key: &str,
    success: bool,
    user_agent: Option<&str>,
    header_data: Option<&str>,
    header_type: Option<&str>,
) -> Report {
    let mut report = Map::new();
    report.insert("remote_addr".to_string(), Value::from(remote_addr));
    report.insert("key".to_string(), Value::from(key));
    report.insert("success".to_string(), Value::from(success));
    report.insert(
        "user_agent".to_string(),
        Value::from(user_agent.unwrap_or_default()),
    );

    let header_data = header_data.unwrap_or_default();
    let header_type = header_type.unwrap_or_default();
    if header_type == "json" {
        match serde_json::from_str::<Value>(header_data) {
            Ok(data) => {
                report.insert("header_data".to_string(), data);
                report.insert("header_type".to_string(), Value::from(header_type));
            }
            Err(err) => {
                warn!(key:% = key, error:% = err; "Report header data is not valid JSON");
            }
        }
    } else {
        report.insert("header_data".to_string(), Value::from(header_data));
        report.insert("header_type".to_string(), Value::from(header_type));
    }
    report
}
