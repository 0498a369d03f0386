//! Per-file summary records
//!
//! The summary row lives at `_summary_{fingerprint}` and keeps every attribute in
//! the `metadata` family. A COMPLETED summary is the idempotency marker checked
//! before any work on a redelivered notification.

use chrono::{DateTime, SecondsFormat, Utc};
use csvflow_common::types::ProcessingStatus;
use tracing::{info, warn};

use super::keys::summary_key;
use super::types::{AttemptProgress, Delimiter, SummaryRecord};
use crate::error::StoreError;
use crate::store::{metadata, ColumnFamily, RowMutation, StoredRow, TableStore};

const STATUS: &str = "status";
const TOTAL_ROWS: &str = "total_rows";
const PROCESSED_ROWS: &str = "processed_rows";
const ERROR_ROWS: &str = "error_rows";
const BATCHES_WRITTEN: &str = "batches_written";
const COLUMNS: &str = "columns";
const DELIMITER: &str = "delimiter";
const SIZE_BYTES: &str = "size_bytes";
const STARTED_AT: &str = "started_at";
const FINISHED_AT: &str = "finished_at";
const ERROR: &str = "error";

impl SummaryRecord {
    /// Summary of a fully written file. `processed_rows` equals `total_rows`.
    pub fn completed(
        file_hash: impl Into<String>,
        source_file: impl Into<String>,
        progress: &AttemptProgress,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            file_hash: file_hash.into(),
            source_file: source_file.into(),
            status: ProcessingStatus::Completed,
            total_rows: progress.total_rows,
            processed_rows: progress.total_rows,
            error_rows: 0,
            batches_written: progress.batches_written,
            columns: progress.columns.clone(),
            delimiter: progress.delimiter,
            size_bytes: progress.size_bytes,
            started_at,
            finished_at: Utc::now(),
            error: None,
        }
    }

    /// Summary of an attempt that stopped on `error`, with the counts known at that point.
    pub fn failed(
        file_hash: impl Into<String>,
        source_file: impl Into<String>,
        progress: &AttemptProgress,
        started_at: DateTime<Utc>,
        error: impl std::fmt::Display,
    ) -> Self {
        Self {
            file_hash: file_hash.into(),
            source_file: source_file.into(),
            status: ProcessingStatus::Failed,
            total_rows: progress.total_rows,
            processed_rows: progress.processed_rows,
            error_rows: progress.error_rows,
            batches_written: progress.batches_written,
            columns: progress.columns.clone(),
            delimiter: progress.delimiter,
            size_bytes: progress.size_bytes,
            started_at,
            finished_at: Utc::now(),
            error: Some(error.to_string()),
        }
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Encode a summary as a single-row mutation.
pub fn encode_summary(record: &SummaryRecord) -> Result<RowMutation, StoreError> {
    let key = summary_key(&record.file_hash);
    let columns = serde_json::to_string(&record.columns).map_err(|e| StoreError::Corrupt {
        row_key: key.to_string(),
        message: e.to_string(),
    })?;

    let mut mutation = RowMutation::new(key.into_string());
    let finished_at = timestamp(&record.finished_at);
    mutation
        .set(ColumnFamily::Metadata, metadata::FILE_HASH, &record.file_hash)
        .set(ColumnFamily::Metadata, metadata::SOURCE_FILE, &record.source_file)
        .set(ColumnFamily::Metadata, STATUS, record.status.as_str())
        .set(ColumnFamily::Metadata, TOTAL_ROWS, record.total_rows.to_string())
        .set(ColumnFamily::Metadata, PROCESSED_ROWS, record.processed_rows.to_string())
        .set(ColumnFamily::Metadata, ERROR_ROWS, record.error_rows.to_string())
        .set(ColumnFamily::Metadata, BATCHES_WRITTEN, record.batches_written.to_string())
        .set(ColumnFamily::Metadata, COLUMNS, columns)
        .set(
            ColumnFamily::Metadata,
            DELIMITER,
            record.delimiter.map(Delimiter::name).unwrap_or_default(),
        )
        .set(
            ColumnFamily::Metadata,
            SIZE_BYTES,
            record.size_bytes.map(|s| s.to_string()).unwrap_or_default(),
        )
        .set(ColumnFamily::Metadata, STARTED_AT, timestamp(&record.started_at))
        .set(ColumnFamily::Metadata, FINISHED_AT, finished_at.clone())
        .set(ColumnFamily::Metadata, metadata::PROCESSED_AT, finished_at)
        // Always written so a COMPLETED overwrite clears an earlier failure message
        .set(
            ColumnFamily::Metadata,
            ERROR,
            record.error.clone().unwrap_or_default(),
        );
    Ok(mutation)
}

/// Decode a summary row written by [`encode_summary`].
pub fn decode_summary(row: &StoredRow) -> Result<SummaryRecord, StoreError> {
    let corrupt = |message: String| StoreError::Corrupt {
        row_key: row.row_key.clone(),
        message,
    };
    let field = |name: &str| {
        row.metadata
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| corrupt(format!("missing {}", name)))
    };
    let count = |name: &str| {
        field(name)?
            .parse::<u64>()
            .map_err(|e| corrupt(format!("{}: {}", name, e)))
    };
    let time = |name: &str| {
        DateTime::parse_from_rfc3339(field(name)?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("{}: {}", name, e)))
    };
    let optional = |name: &str| row.metadata.get(name).filter(|v| !v.is_empty());

    let status = field(STATUS)?
        .parse::<ProcessingStatus>()
        .map_err(|e| corrupt(e.to_string()))?;
    let columns = serde_json::from_str::<Vec<String>>(field(COLUMNS)?)
        .map_err(|e| corrupt(format!("{}: {}", COLUMNS, e)))?;
    let delimiter = match optional(DELIMITER) {
        Some(name) => Some(
            Delimiter::from_name(name)
                .ok_or_else(|| corrupt(format!("unknown delimiter '{}'", name)))?,
        ),
        None => None,
    };
    let size_bytes = match optional(SIZE_BYTES) {
        Some(size) => Some(size.parse::<u64>().map_err(|e| corrupt(format!("{}: {}", SIZE_BYTES, e)))?),
        None => None,
    };

    Ok(SummaryRecord {
        file_hash: field(metadata::FILE_HASH)?.to_string(),
        source_file: field(metadata::SOURCE_FILE)?.to_string(),
        status,
        total_rows: count(TOTAL_ROWS)?,
        processed_rows: count(PROCESSED_ROWS)?,
        error_rows: count(ERROR_ROWS)?,
        batches_written: count(BATCHES_WRITTEN)?,
        columns,
        delimiter,
        size_bytes,
        started_at: time(STARTED_AT)?,
        finished_at: time(FINISHED_AT)?,
        error: optional(ERROR).cloned(),
    })
}

/// Reads and writes summary records through a [`TableStore`].
pub struct SummaryRecorder<'a> {
    store: &'a dyn TableStore,
}

impl<'a> SummaryRecorder<'a> {
    pub fn new(store: &'a dyn TableStore) -> Self {
        Self { store }
    }

    /// Fetch the summary for `fingerprint`.
    ///
    /// A row that cannot be decoded is logged and treated as absent, which makes
    /// the file eligible for a clean re-attempt.
    pub async fn fetch(&self, fingerprint: &str) -> Result<Option<SummaryRecord>, StoreError> {
        let key = summary_key(fingerprint);
        let Some(row) = self.store.read_row(key.as_str()).await? else {
            return Ok(None);
        };

        match decode_summary(&row) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(file_hash = %fingerprint, error = %err, "Ignoring unreadable summary record");
                Ok(None)
            },
        }
    }

    /// Upsert the summary record.
    pub async fn record(&self, record: &SummaryRecord) -> Result<(), StoreError> {
        let mutation = encode_summary(record)?;
        self.store.commit_row(&mutation).await?;
        info!(
            file_hash = %record.file_hash,
            source_file = %record.source_file,
            status = %record.status,
            total_rows = record.total_rows,
            processed_rows = record.processed_rows,
            "Summary recorded"
        );
        Ok(())
    }
}
