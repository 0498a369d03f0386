//! Error taxonomy for the processing engine
//!
//! Every failure an attempt can hit maps to one [`ProcessingError`] variant, and
//! [`ProcessingError::class`] is the only place that decides whether a failure is
//! worth redelivering.

use std::time::Duration;
use thiserror::Error;

/// Whether a failure can succeed on a later delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// I/O hiccup; the message is redelivered with backoff.
    Transient,
    /// The input itself cannot be processed as-is.
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }
}

/// Delimiter detection or record-structure failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("file is empty")]
    EmptySample,

    #[error("no candidate delimiter splits the header into more than one field")]
    NoDelimiter,

    #[error("no candidate delimiter gives a consistent field count across {lines} sampled lines")]
    Inconsistent { lines: usize },

    #[error("malformed record at data row {row}: {message}")]
    MalformedRecord { row: u64, message: String },
}

/// Header could not be turned into a schema
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("header line is empty")]
    EmptyHeader,

    #[error("header has no columns")]
    NoColumns,
}

/// Row number outside what the key space (or configured limit) supports
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("row {row_number} exceeds the supported maximum of {limit} rows per file")]
pub struct CapacityError {
    pub row_number: u64,
    pub limit: u64,
}

/// Source object could not be read
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to read {path}: {message}")]
pub struct FetchError {
    pub path: String,
    pub message: String,
}

impl FetchError {
    pub fn new(path: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Failure of the table store as a whole (not of individual rows)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store returned {actual} row statuses for {expected} mutations")]
    StatusMismatch { expected: usize, actual: usize },

    #[error("row {row_key} is corrupt: {message}")]
    Corrupt { row_key: String, message: String },
}

/// Work queue failure
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("message {0} is not in flight")]
    NotInFlight(i64),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

/// Everything that can end a processing attempt early
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("invalid notification: {0}")]
    Notification(String),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{failed_rows} rows could not be written after retries ({processed_rows} rows written)")]
    PartialWrite {
        failed_rows: u64,
        processed_rows: u64,
    },

    #[error(transparent)]
    TransientStore(#[from] StoreError),

    #[error("attempt abandoned after {0:?}")]
    TimedOut(Duration),
}

impl ProcessingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProcessingError::Notification(_)
            | ProcessingError::Format(_)
            | ProcessingError::Schema(_)
            | ProcessingError::Capacity(_) => ErrorClass::Permanent,
            ProcessingError::Fetch(_)
            | ProcessingError::PartialWrite { .. }
            | ProcessingError::TransientStore(_)
            | ProcessingError::TimedOut(_) => ErrorClass::Transient,
        }
    }

    /// Whether the attempt should leave a FAILED summary record behind.
    ///
    /// Input errors and exhausted batch retries are audited; store outages,
    /// fetch failures and timeouts are not (the store may be the thing that is down).
    pub fn records_failure(&self) -> bool {
        matches!(
            self,
            ProcessingError::Format(_)
                | ProcessingError::Schema(_)
                | ProcessingError::Capacity(_)
                | ProcessingError::PartialWrite { .. }
        )
    }

    /// Short machine-friendly name used in logs and dead-letter reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::Notification(_) => "notification",
            ProcessingError::Format(_) => "format",
            ProcessingError::Schema(_) => "schema",
            ProcessingError::Capacity(_) => "capacity",
            ProcessingError::Fetch(_) => "fetch",
            ProcessingError::PartialWrite { .. } => "partial_write",
            ProcessingError::TransientStore(_) => "transient_store",
            ProcessingError::TimedOut(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_errors_are_permanent() {
        assert_eq!(
            ProcessingError::from(FormatError::NoDelimiter).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            ProcessingError::from(SchemaError::EmptyHeader).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            ProcessingError::from(CapacityError {
                row_number: 11,
                limit: 10
            })
            .class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_io_errors_are_transient() {
        assert_eq!(
            ProcessingError::from(FetchError::new("b/a.csv", "connection reset")).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ProcessingError::from(StoreError::Unavailable("down".into())).class(),
            ErrorClass::Transient
        );
        let partial = ProcessingError::PartialWrite {
            failed_rows: 3,
            processed_rows: 997,
        };
        assert_eq!(partial.class(), ErrorClass::Transient);
        assert!(partial.records_failure());
    }

    #[test]
    fn test_outages_do_not_record_failure() {
        assert!(!ProcessingError::from(StoreError::Unavailable("down".into())).records_failure());
        assert!(!ProcessingError::TimedOut(Duration::from_secs(1)).records_failure());
        assert!(!ProcessingError::Notification("bad json".into()).records_failure());
    }
}
