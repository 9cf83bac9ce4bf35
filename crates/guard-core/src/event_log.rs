//! Bounded record of monitoring activity.
//!
//! The in-memory ring buffer is what status queries read. An optional JSONL
//! journal keeps a SHA-256 hash chain of every appended event on disk.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const DEFAULT_CAPACITY: usize = 100;
const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Info,
    Violation,
    Restore,
    Error,
    Success,
    Warning,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Violation => "violation",
            Self::Restore => "restore",
            Self::Error => "error",
            Self::Success => "success",
            Self::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub message: String,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct JournalLine<'a> {
    #[serde(flatten)]
    event: &'a Event,
    prev_hash: &'a str,
    hash: &'a str,
}

struct Journal {
    path: PathBuf,
    last_hash: String,
}

struct LogState {
    entries: VecDeque<Event>,
    last_seq: u64,
    journal: Option<Journal>,
}

pub struct EventLog {
    capacity: usize,
    inner: Mutex<LogState>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(LogState {
                entries: VecDeque::with_capacity(capacity),
                last_seq: 0,
                journal: None,
            }),
        }
    }

    /// Same as [`EventLog::new`] but every event is also appended to a JSONL
    /// journal at `path`.
    pub fn with_journal(capacity: usize, path: impl AsRef<Path>) -> Self {
        let log = Self::new(capacity);
        log.inner.lock().journal = Some(Journal {
            path: path.as_ref().to_path_buf(),
            last_hash: CHAIN_START.to_string(),
        });
        log
    }

    pub fn append(&self, kind: EventKind, message: impl Into<String>, path: Option<&Path>) -> Event {
        let message = message.into();
        match kind {
            EventKind::Violation | EventKind::Warning => {
                warn!(kind = kind.as_str(), path = ?path, "{message}")
            }
            EventKind::Error => error!(kind = kind.as_str(), path = ?path, "{message}"),
            _ => info!(kind = kind.as_str(), path = ?path, "{message}"),
        }

        let mut state = self.inner.lock();
        state.last_seq += 1;
        let event = Event {
            seq: state.last_seq,
            timestamp: Utc::now(),
            kind,
            message,
            path: path.map(Path::to_path_buf),
        };
        if state.entries.len() == self.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(event.clone());
        if let Some(journal) = state.journal.as_mut() {
            if let Err(e) = journal.write(&event) {
                warn!(path = %journal.path.display(), error = %e, "event journal write failed");
            }
        }
        event
    }

    /// Most recent first, at most `limit` entries.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let state = self.inner.lock();
        state.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Journal {
    fn write(&mut self, event: &Event) -> std::io::Result<()> {
        let body = serde_json::to_string(event)?;
        let mut hasher = Sha256::new();
        hasher.update(self.last_hash.as_bytes());
        hasher.update(body.as_bytes());
        let hash = hex::encode(hasher.finalize());

        let line = serde_json::to_string(&JournalLine {
            event,
            prev_hash: &self.last_hash,
            hash: &hash,
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        self.last_hash = hash;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn overflow_evicts_oldest() {
        let log = EventLog::new(DEFAULT_CAPACITY);
        for i in 0..150 {
            log.append(EventKind::Info, format!("event {i}"), None);
        }
        assert_eq!(log.len(), 100);

        let events = log.recent(200);
        assert_eq!(events.len(), 100);
        assert_eq!(events[0].message, "event 149");
        assert_eq!(events[99].message, "event 50");
        assert!(events.windows(2).all(|w| w[0].seq > w[1].seq));
    }

    #[test]
    fn recent_respects_limit_and_clear() {
        let log = EventLog::new(10);
        log.append(EventKind::Violation, "a", Some(Path::new("/tmp/a.txt")));
        log.append(EventKind::Restore, "b", None);
        let events = log.recent(1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Restore);

        log.clear();
        assert!(log.is_empty());
        assert!(log.recent(50).is_empty());

        // sequence keeps increasing after a clear
        let next = log.append(EventKind::Info, "c", None);
        assert_eq!(next.seq, 3);
    }

    #[test]
    fn journal_chains_hashes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::with_journal(2, &path);
        for i in 0..3 {
            log.append(EventKind::Success, format!("ok {i}"), None);
        }
        assert_eq!(log.len(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["prev_hash"], CHAIN_START);
        assert_eq!(lines[1]["prev_hash"], lines[0]["hash"]);
        assert_eq!(lines[2]["prev_hash"], lines[1]["hash"]);
        assert_eq!(lines[2]["kind"], "success");
    }
}
