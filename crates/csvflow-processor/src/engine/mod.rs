//! CSV processing engine
//!
//! Leaf-first: [`detector`] picks the delimiter, [`schema`] maps the header,
//! [`keys`] derives row keys, [`writer`] applies batches, [`summary`] records the
//! outcome and [`coordinator`] drives the whole attempt.

pub mod coordinator;
pub mod detector;
pub mod keys;
pub mod reader;
pub mod schema;
pub mod summary;
pub mod types;
pub mod writer;

pub use coordinator::{
    transition, AttemptOutcome, AttemptReport, DeliveryCoordinator, DeliveryPolicy, Disposition,
    StageEvent,
};
pub use detector::{detect_delimiter, FormatDetector};
pub use keys::{fingerprint, row_key, summary_key};
pub use schema::{map_header_line, schema_from_fields};
pub use summary::SummaryRecorder;
pub use types::{
    AttemptProgress, Delimiter, ObjectBody, ProcessingAttempt, ProcessingState, Row, RowKey, Schema,
    SourceFile, SummaryRecord,
};
pub use writer::{BatchWriter, WriteContext, WriterSettings};
