// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Append-only, day-keyed event log.
//!
//! Every transition in the pipeline engine — a worker's response, a
//! decision, a state change, an error — is appended here before anything
//! downstream acts on it. Events live in UTF-8 JSONL files named
//! `YYYY-MM-DD.jsonl` under `events/stream/`; files older than the archive
//! threshold are moved under `events/stream/archive/` unmodified. Appends
//! are serialized through an internal lock and treated as fatal on I/O
//! failure; reads tolerate corrupt lines by skipping them and counting how
//! many were skipped, exposed via [`EventLog::corrupt_line_count`].

mod builder;
mod chain;

pub use builder::EventBuilder;
pub use chain::ChainError;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use pe_core::{Event, EventId};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, warn};

/// Errors raised by event log operations.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("event {event_id} references missing parent {missing_parent}")]
    BrokenParent { event_id: EventId, missing_parent: EventId },
    #[error(transparent)]
    Chain(#[from] ChainError),
}

const STREAM_DIR: &str = "stream";
const ARCHIVE_DIR: &str = "archive";

/// Append-only event log rooted at a directory (conventionally `events/`).
pub struct EventLog {
    root: PathBuf,
    archive_after_days: i64,
    index: RwLock<HashMap<EventId, Event>>,
    next_id: AtomicU64,
    corrupt_lines: AtomicU64,
    append_lock: Mutex<()>,
}

impl EventLog {
    /// Open (creating if needed) the event log rooted at `root`, hydrating
    /// the in-memory parent-chain index from every non-archived day file.
    /// Corrupt lines encountered during hydration are skipped and counted,
    /// never fatal — only a write failure is fatal for this log.
    pub async fn open(root: impl Into<PathBuf>, archive_after_days: i64) -> Result<Self, EventLogError> {
        let root = root.into();
        fs::create_dir_all(root.join(STREAM_DIR)).await?;
        fs::create_dir_all(root.join(STREAM_DIR).join(ARCHIVE_DIR)).await?;

        let log = Self {
            root,
            archive_after_days,
            index: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            corrupt_lines: AtomicU64::new(0),
            append_lock: Mutex::new(()),
        };
        log.hydrate().await?;
        Ok(log)
    }

    fn stream_dir(&self) -> PathBuf {
        self.root.join(STREAM_DIR)
    }

    fn archive_dir(&self) -> PathBuf {
        self.root.join(STREAM_DIR).join(ARCHIVE_DIR)
    }

    fn day_path(dir: &Path, date: NaiveDate) -> PathBuf {
        dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    async fn hydrate(&self) -> Result<(), EventLogError> {
        let mut entries = fs::read_dir(self.stream_dir()).await?;
        let mut max_id = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() || path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let raw = fs::read_to_string(&path).await?;
            let mut index = self.index.write().await;
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(line) {
                    Ok(event) => {
                        max_id = max_id.max(event.id);
                        index.insert(event.id, event);
                    }
                    Err(err) => {
                        self.corrupt_lines.fetch_add(1, Ordering::Relaxed);
                        warn!(path = %path.display(), error = %err, "skipping corrupt event-log line");
                    }
                }
            }
        }
        self.next_id.store(max_id + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of corrupt lines skipped across hydration and subsequent reads.
    #[must_use]
    pub fn corrupt_line_count(&self) -> u64 {
        self.corrupt_lines.load(Ordering::Relaxed)
    }

    /// Assign the next monotonic id, validate `parent_event_id` (if set)
    /// resolves to an already-indexed event, and append the event to its
    /// day-keyed file. A write failure here is fatal — callers should treat
    /// `Err` as unrecoverable for this invocation, per the append contract.
    pub async fn append(&self, mut event: Event) -> Result<EventId, EventLogError> {
        let _guard = self.append_lock.lock().await;

        if let Some(parent_id) = event.parent_event_id {
            let index = self.index.read().await;
            if !index.contains_key(&parent_id) {
                return Err(EventLogError::BrokenParent {
                    event_id: event.id,
                    missing_parent: parent_id,
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        event.id = id;

        let line = serde_json::to_string(&event)?;
        let path = Self::day_path(&self.stream_dir(), event.timestamp.date_naive());
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        self.index.write().await.insert(id, event);
        Ok(id)
    }

    /// Read every event recorded for `date`, checking the archive directory
    /// if the day file has already been rotated out of `stream/`. Corrupt
    /// lines are skipped and counted rather than failing the read.
    pub async fn read(&self, date: NaiveDate) -> Result<Vec<Event>, EventLogError> {
        let stream_path = Self::day_path(&self.stream_dir(), date);
        let archive_path = Self::day_path(&self.archive_dir(), date);
        let path = if fs::try_exists(&stream_path).await? {
            stream_path
        } else {
            archive_path
        };

        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    self.corrupt_lines.fetch_add(1, Ordering::Relaxed);
                    error!(date = %date, error = %err, "skipping corrupt event-log line on read");
                }
            }
        }
        Ok(events)
    }

    /// Walk `event_id`'s ancestry via `parent_event_id` and return the full
    /// causal chain, root first.
    pub async fn chain(&self, event_id: EventId) -> Result<Vec<Event>, EventLogError> {
        let index = self.index.read().await;
        Ok(chain::walk_chain(&index, event_id)?)
    }

    /// Move every `stream/` day file older than the archive threshold (as of
    /// `now`) into `stream/archive/`, unmodified. Returns the archived paths.
    pub async fn archive_due(&self, now: DateTime<Utc>) -> Result<Vec<PathBuf>, EventLogError> {
        let cutoff = now.date_naive() - chrono::Duration::days(self.archive_after_days);
        let mut archived = Vec::new();
        let mut entries = fs::read_dir(self.stream_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
                continue;
            };
            if date < cutoff {
                let dest = self.archive_dir().join(path.file_name().unwrap());
                fs::rename(&path, &dest).await?;
                archived.push(dest);
            }
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests;
