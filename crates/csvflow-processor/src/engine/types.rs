//! Core types for the processing engine

use chrono::{DateTime, Utc};
use csvflow_common::types::{ObjectRef, ProcessingStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::AsyncRead;

/// Streamed body of a source object
pub type ObjectBody = Box<dyn AsyncRead + Send + Unpin>;

/// Field delimiter, one of the supported candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    Comma,
    Semicolon,
    Tab,
    Pipe,
}

impl Delimiter {
    /// Candidates in priority order; earlier entries win ties.
    pub const CANDIDATES: [Delimiter; 4] = [
        Delimiter::Comma,
        Delimiter::Semicolon,
        Delimiter::Tab,
        Delimiter::Pipe,
    ];

    pub fn as_byte(self) -> u8 {
        match self {
            Delimiter::Comma => b',',
            Delimiter::Semicolon => b';',
            Delimiter::Tab => b'\t',
            Delimiter::Pipe => b'|',
        }
    }

    pub fn as_char(self) -> char {
        self.as_byte() as char
    }

    pub fn name(self) -> &'static str {
        match self {
            Delimiter::Comma => "comma",
            Delimiter::Semicolon => "semicolon",
            Delimiter::Tab => "tab",
            Delimiter::Pipe => "pipe",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::CANDIDATES.into_iter().find(|d| d.name() == name)
    }
}

impl std::fmt::Display for Delimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A source object opened for reading. Owned by exactly one attempt.
pub struct SourceFile {
    pub object: ObjectRef,
    pub size_bytes: Option<u64>,
    pub body: ObjectBody,
}

impl std::fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFile")
            .field("object", &self.object)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

/// Ordered, unique, sanitized column names derived from a header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    columns: Vec<String>,
}

impl Schema {
    /// Callers must guarantee uniqueness; use [`crate::engine::schema`] to build one.
    pub(crate) fn from_unique(columns: Vec<String>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column name for a field position. Fields past the header get `_{index}`,
    /// suffixed `_{n}` (n >= 2) when a header column already uses that name.
    pub fn column_name(&self, index: usize) -> String {
        if let Some(name) = self.columns.get(index) {
            return name.clone();
        }
        let base = format!("_{}", index);
        if !self.columns.contains(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{}_{}", base, n))
            .find(|candidate| !self.columns.contains(candidate))
            .unwrap_or(base)
    }
}

/// One parsed data row. Empty trailing fields missing from the record are absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// 1-based position among data rows (header excluded)
    pub number: u64,
    pub values: BTreeMap<String, String>,
}

/// Store key of a data or summary row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(String);

impl RowKey {
    pub(crate) fn new(key: String) -> Self {
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-file audit record, also the idempotency marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub file_hash: String,
    pub source_file: String,
    pub status: ProcessingStatus,
    /// Data rows detected in the file (so far, for FAILED records)
    pub total_rows: u64,
    /// Rows confirmed written
    pub processed_rows: u64,
    /// Rows that stayed unwritten after batch retries
    pub error_rows: u64,
    pub batches_written: u64,
    pub columns: Vec<String>,
    pub delimiter: Option<Delimiter>,
    pub size_bytes: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl SummaryRecord {
    pub fn is_completed(&self) -> bool {
        self.status == ProcessingStatus::Completed
    }
}

/// Per-file processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Received,
    Fetching,
    Detecting,
    Mapping,
    Writing,
    Summarizing,
    Completed,
    /// Notification did not refer to a file this worker processes
    Skipped,
    FailedTransient,
    FailedPermanent,
    DeadLettered,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Received => "RECEIVED",
            ProcessingState::Fetching => "FETCHING",
            ProcessingState::Detecting => "DETECTING",
            ProcessingState::Mapping => "MAPPING",
            ProcessingState::Writing => "WRITING",
            ProcessingState::Summarizing => "SUMMARIZING",
            ProcessingState::Completed => "COMPLETED",
            ProcessingState::Skipped => "SKIPPED",
            ProcessingState::FailedTransient => "FAILED_TRANSIENT",
            ProcessingState::FailedPermanent => "FAILED_PERMANENT",
            ProcessingState::DeadLettered => "DEAD_LETTERED",
        }
    }

    /// No further transition happens within this attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingState::Completed
                | ProcessingState::Skipped
                | ProcessingState::FailedTransient
                | ProcessingState::DeadLettered
        )
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters collected while an attempt runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptProgress {
    pub total_rows: u64,
    pub processed_rows: u64,
    pub error_rows: u64,
    pub batches_written: u64,
    pub columns: Vec<String>,
    pub delimiter: Option<Delimiter>,
    pub size_bytes: Option<u64>,
}

/// In-memory record of one delivery being processed. Never persisted.
#[derive(Debug, Clone)]
pub struct ProcessingAttempt {
    pub object: ObjectRef,
    pub fingerprint: String,
    /// 1-based delivery count reported by the queue
    pub delivery_attempt: u32,
    pub state: ProcessingState,
    pub started_at: DateTime<Utc>,
    pub progress: AttemptProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delimiter_names_round_trip() {
        for delimiter in Delimiter::CANDIDATES {
            assert_eq!(Delimiter::from_name(delimiter.name()), Some(delimiter));
        }
        assert_eq!(Delimiter::from_name("colon"), None);
        assert_eq!(Delimiter::Tab.as_char(), '\t');
    }

    #[test]
    fn test_schema_column_name_past_header() {
        let schema = Schema::from_unique(vec!["id".into(), "name".into()]);
        assert_eq!(schema.column_name(1), "name");
        assert_eq!(schema.column_name(4), "_4");
    }

    #[test]
    fn test_extra_field_name_avoids_header_columns() {
        let schema = Schema::from_unique(vec!["_2".into(), "b".into()]);
        assert_eq!(schema.column_name(0), "_2");
        assert_eq!(schema.column_name(2), "_2_2");

        let schema = Schema::from_unique(vec!["_2".into(), "_2_2".into()]);
        assert_eq!(schema.column_name(2), "_2_3");
        assert_eq!(schema.column_name(3), "_3");
    }

    #[test]
    fn test_terminal_states() {
        assert!(ProcessingState::Completed.is_terminal());
        assert!(ProcessingState::FailedTransient.is_terminal());
        assert!(!ProcessingState::FailedPermanent.is_terminal());
        assert!(!ProcessingState::Writing.is_terminal());
    }
}
