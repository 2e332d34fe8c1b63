//! Immutable audit logging.
//!
//! Records every vault operation: stores, reveals, deletions and key
//! rotations. The log is append-only and never holds plaintext or key
//! material, only identifiers. Supports pluggable sinks for forwarding
//! records to files or other stores. The in-memory copy is bounded; sinks
//! see everything.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A sink that receives audit records. Implement this to forward records
/// to a file, database, or other persistent store.
pub trait AuditSink: Send {
    /// Append a record. Called for every audited vault operation.
    fn append(&mut self, record: AuditRecord);
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Store,
    Reveal,
    Delete,
    RotateKey,
}

/// A permanent record of one vault operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: AuditAction,
    /// Vault item involved, if any.
    pub item_id: Option<String>,
    /// Owner of the item (e.g. a report id).
    pub owner_id: Option<String>,
    /// Logical field name of the item.
    pub field: Option<String>,
    /// Data key used, or the new key for a rotation.
    pub key_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            item_id: None,
            owner_id: None,
            field: None,
            key_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn item(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn owner(mut self, owner_id: impl Into<String>, field: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self.field = Some(field.into());
        self
    }

    pub fn key(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }
}

/// Records kept in memory when no retention is configured.
pub const DEFAULT_RETENTION: usize = 1024;

/// An append-only log of vault operations.
///
/// Only the most recent `retention` records stay in memory; older ones are
/// dropped from the front. Sinks added via `add_forward_sink` receive every
/// record and are the durable trail.
pub struct AuditLog {
    records: VecDeque<AuditRecord>,
    retention: usize,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records.len())
            .field("retention", &self.retention)
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that keeps at most `retention` records in memory. Zero keeps
    /// none and relies on forward sinks alone.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(retention.min(DEFAULT_RETENTION)),
            retention,
            forward_sinks: Vec::new(),
        }
    }

    /// Change the in-memory bound, dropping the oldest records if needed.
    pub fn set_retention(&mut self, retention: usize) {
        self.retention = retention;
        self.trim();
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Add a sink to receive a copy of every record, without replacing the
    /// in-memory log.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Append a new record to the log and forward to any attached sinks.
    pub fn append(&mut self, record: AuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }
        if self.retention > 0 {
            self.records.push_back(record);
            self.trim();
        }
    }

    /// Remove and return every retained record, oldest first.
    pub fn drain(&mut self) -> Vec<AuditRecord> {
        self.records.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, AuditRecord> {
        self.records.iter()
    }

    fn trim(&mut self) {
        while self.records.len() > self.retention {
            self.records.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit records as JSON lines (one per record) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    /// Open or create a file for append-only audit logging.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        let written = serde_json::to_string(&record)
            .map_err(std::io::Error::other)
            .and_then(|line| writeln!(self.file, "{line}"))
            .and_then(|()| self.file.flush());
        if let Err(err) = written {
            warn!(error = %err, "failed to write audit record");
        }
    }
}
