//! Delivery coordinator
//!
//! Owns the per-file state machine. The transition function and the delivery
//! decision are pure; the coordinator performs I/O between transitions through the
//! injected [`ObjectSource`] and [`TableStore`] ports.
//!
//! ```text
//! RECEIVED -> FETCHING -> DETECTING -> MAPPING -> WRITING -> SUMMARIZING -> COMPLETED
//!     |                 (any non-terminal state)
//!     |                   |-- transient --> FAILED_TRANSIENT --(attempts exhausted)--+
//!     |                   '-- permanent --> FAILED_PERMANENT <--------------------------+
//!     |                                          '--> DEAD_LETTERED
//!     |-- summary COMPLETED --> COMPLETED
//!     '-- not for us -------> SKIPPED
//! ```

use chrono::Utc;
use csvflow_common::types::ObjectRef;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::detector::FormatDetector;
use super::keys::{fingerprint, row_key};
use super::reader::{read_sample, RowStream};
use super::schema::schema_from_fields;
use super::summary::SummaryRecorder;
use super::types::{AttemptProgress, ProcessingAttempt, ProcessingState, Schema, SummaryRecord};
use super::writer::{BatchWriter, WriteContext};
use crate::config::EngineConfig;
use crate::error::{CapacityError, ErrorClass, FetchError, ProcessingError, SchemaError, StoreError};
use crate::notification::{Decoded, Notification, SkipReason};
use crate::storage::ObjectSource;
use crate::store::TableStore;

/// Input of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    /// The current stage finished
    Advance,
    /// A COMPLETED summary already exists
    AlreadyCompleted,
    /// The notification is not for this worker
    Skip,
    Fail(ErrorClass),
    /// The delivery system will not redeliver again
    AttemptsExhausted,
    /// The payload was moved to the dead-letter channel
    DeadLettered,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: ProcessingState,
    pub event: StageEvent,
}

/// Pure transition function of the per-file state machine.
pub fn transition(
    state: ProcessingState,
    event: StageEvent,
) -> Result<ProcessingState, InvalidTransition> {
    use ProcessingState::*;

    let next = match (state, event) {
        (Received, StageEvent::AlreadyCompleted) => Completed,
        (Received, StageEvent::Skip) => Skipped,
        (Received, StageEvent::Advance) => Fetching,
        (Fetching, StageEvent::Advance) => Detecting,
        (Detecting, StageEvent::Advance) => Mapping,
        (Mapping, StageEvent::Advance) => Writing,
        (Writing, StageEvent::Advance) => Summarizing,
        (Summarizing, StageEvent::Advance) => Completed,
        (
            Received | Fetching | Detecting | Mapping | Writing | Summarizing,
            StageEvent::Fail(class),
        ) => match class {
            ErrorClass::Transient => FailedTransient,
            ErrorClass::Permanent => FailedPermanent,
        },
        (FailedTransient, StageEvent::AttemptsExhausted) => FailedPermanent,
        (FailedPermanent, StageEvent::DeadLettered) => DeadLettered,
        (from, event) => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}

/// What the delivery system should do with the message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Leave unacknowledged; redeliver after `delay`
    Retry { delay: Duration },
    /// Move the original payload to the dead-letter channel
    DeadLetter { reason: String },
}

/// Redelivery limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl DeliveryPolicy {
    /// Delay before redelivering after failed attempt `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// Decide the disposition of attempt `attempt` that ended with `outcome`.
    pub fn decide(&self, outcome: &AttemptOutcome, attempt: u32) -> Disposition {
        let AttemptOutcome::Failed(err) = outcome else {
            return Disposition::Ack;
        };

        match err.class() {
            ErrorClass::Permanent => Disposition::DeadLetter {
                reason: format!("{}: {}", err.kind(), err),
            },
            ErrorClass::Transient if attempt >= self.max_attempts => Disposition::DeadLetter {
                reason: format!(
                    "gave up after {} attempts, last error {}: {}",
                    attempt,
                    err.kind(),
                    err
                ),
            },
            ErrorClass::Transient => Disposition::Retry {
                delay: self.backoff(attempt),
            },
        }
    }
}

/// How an attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed(SummaryRecord),
    /// Redelivery of a file whose summary is already COMPLETED
    AlreadyCompleted(SummaryRecord),
    Skipped(SkipReason),
    Failed(ProcessingError),
}

/// Result of handling one delivery
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub object: Option<ObjectRef>,
    pub fingerprint: Option<String>,
    pub delivery_attempt: u32,
    /// Final state, after the disposition was applied to the state machine
    pub state: ProcessingState,
    pub outcome: AttemptOutcome,
    pub disposition: Disposition,
    pub progress: AttemptProgress,
}

impl AttemptReport {
    pub fn error(&self) -> Option<&ProcessingError> {
        match &self.outcome {
            AttemptOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

fn step(attempt: &mut ProcessingAttempt, event: StageEvent) {
    match transition(attempt.state, event) {
        Ok(next) => {
            debug!(
                file_hash = %attempt.fingerprint,
                from = %attempt.state,
                to = %next,
                "State transition"
            );
            attempt.state = next;
        },
        Err(err) => error!(file_hash = %attempt.fingerprint, error = %err, "Ignoring invalid state transition"),
    }
}

/// Drives one delivery through fetch, detection, mapping, writing and summary.
pub struct DeliveryCoordinator {
    objects: Arc<dyn ObjectSource>,
    store: Arc<dyn TableStore>,
    config: EngineConfig,
    detector: FormatDetector,
}

impl DeliveryCoordinator {
    pub fn new(
        objects: Arc<dyn ObjectSource>,
        store: Arc<dyn TableStore>,
        config: EngineConfig,
    ) -> Self {
        let detector = FormatDetector::new(config.sample_lines);
        Self {
            objects,
            store,
            config,
            detector,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current summary record of `object`, if any.
    pub async fn summary(&self, object: &ObjectRef) -> Result<Option<SummaryRecord>, StoreError> {
        SummaryRecorder::new(self.store.as_ref())
            .fetch(&fingerprint(object))
            .await
    }

    /// Handle a raw delivery payload on its `delivery_attempt`-th delivery.
    #[instrument(skip(self, payload), fields(attempt = delivery_attempt))]
    pub async fn handle_delivery(&self, payload: &[u8], delivery_attempt: u32) -> AttemptReport {
        let bucket = self.config.bucket.as_deref();

        let notification = match Notification::decode(payload) {
            Ok(Decoded::Event(notification)) => notification,
            Ok(Decoded::Skip(reason)) => return self.skipped(reason, delivery_attempt),
            Err(err) => return self.rejected(err, delivery_attempt),
        };

        if let Some(reason) = notification.skip_reason(bucket) {
            return self.skipped(reason, delivery_attempt);
        }

        debug!(
            event_type = notification.event_type.as_deref().unwrap_or_default(),
            content_type = notification.content_type.as_deref().unwrap_or_default(),
            size = ?notification.size,
            "Object notification received"
        );

        match notification.object(bucket) {
            Ok(object) => self.process_object(&object, delivery_attempt, false).await,
            Err(err) => self.rejected(err, delivery_attempt),
        }
    }

    /// Process `object` directly. With `force`, an existing COMPLETED summary does
    /// not short-circuit the attempt.
    #[instrument(skip(self), fields(path = %object, file_hash = tracing::field::Empty))]
    pub async fn process_object(
        &self,
        object: &ObjectRef,
        delivery_attempt: u32,
        force: bool,
    ) -> AttemptReport {
        let mut attempt = ProcessingAttempt {
            object: object.clone(),
            fingerprint: fingerprint(object),
            delivery_attempt,
            state: ProcessingState::Received,
            started_at: Utc::now(),
            progress: AttemptProgress::default(),
        };
        tracing::Span::current().record("file_hash", attempt.fingerprint.as_str());

        let run = tokio::time::timeout(
            self.config.attempt_timeout,
            self.run_attempt(&mut attempt, force),
        )
        .await;
        let result = match run {
            Ok(result) => result,
            Err(_) => Err(ProcessingError::TimedOut(self.config.attempt_timeout)),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                step(&mut attempt, StageEvent::Fail(err.class()));
                if err.records_failure() {
                    self.record_failure(&attempt, &err).await;
                }
                AttemptOutcome::Failed(err)
            },
        };

        let disposition = self.config.delivery.decide(&outcome, delivery_attempt);
        if matches!(disposition, Disposition::DeadLetter { .. }) {
            if attempt.state == ProcessingState::FailedTransient {
                step(&mut attempt, StageEvent::AttemptsExhausted);
            }
            step(&mut attempt, StageEvent::DeadLettered);
        }

        let report = AttemptReport {
            object: Some(attempt.object),
            fingerprint: Some(attempt.fingerprint),
            delivery_attempt,
            state: attempt.state,
            outcome,
            disposition,
            progress: attempt.progress,
        };
        log_report(&report);
        report
    }

    async fn run_attempt(
        &self,
        attempt: &mut ProcessingAttempt,
        force: bool,
    ) -> Result<AttemptOutcome, ProcessingError> {
        let recorder = SummaryRecorder::new(self.store.as_ref());

        if !force {
            if let Some(summary) = recorder.fetch(&attempt.fingerprint).await? {
                if summary.is_completed() {
                    step(attempt, StageEvent::AlreadyCompleted);
                    return Ok(AttemptOutcome::AlreadyCompleted(summary));
                }
                debug!(status = %summary.status, "Previous attempt did not complete, reprocessing");
            }
        }

        step(attempt, StageEvent::Advance);
        let path = attempt.object.storage_path();
        let file = self.objects.open(&attempt.object).await?;
        attempt.progress.size_bytes = file.size_bytes;
        let (sample, body) = read_sample(file.body, self.config.sample_bytes)
            .await
            .map_err(|e| FetchError::new(path.clone(), e))?;

        step(attempt, StageEvent::Advance);
        let header = sample.header_line();
        if header.trim_start_matches('\u{feff}').trim().is_empty() {
            return Err(SchemaError::EmptyHeader.into());
        }
        let delimiter = self.detector.detect(sample.bytes(), sample.is_complete())?;
        attempt.progress.delimiter = Some(delimiter);

        step(attempt, StageEvent::Advance);
        let mut rows = RowStream::new(body, delimiter, path.clone());
        let schema = schema_from_fields(rows.read_header().await?)?;
        attempt.progress.columns = schema.columns().to_vec();
        debug!(%delimiter, columns = schema.len(), "Schema mapped");

        step(attempt, StageEvent::Advance);
        let mut writer = BatchWriter::new(
            self.store.as_ref(),
            self.config.writer.clone(),
            WriteContext {
                fingerprint: attempt.fingerprint.clone(),
                source_file: path,
                processed_at: attempt.started_at,
            },
        );
        let written = self
            .write_rows(&mut rows, &schema, &mut writer, &attempt.fingerprint, &mut attempt.progress)
            .await;
        attempt.progress.processed_rows = writer.processed_rows();
        attempt.progress.batches_written = writer.batches_written();
        attempt.progress.error_rows = writer.failed_rows().len() as u64;
        written?;

        step(attempt, StageEvent::Advance);
        let summary = SummaryRecord::completed(
            attempt.fingerprint.clone(),
            attempt.object.storage_path(),
            &attempt.progress,
            attempt.started_at,
        );
        recorder.record(&summary).await?;

        step(attempt, StageEvent::Advance);
        Ok(AttemptOutcome::Completed(summary))
    }

    async fn write_rows(
        &self,
        rows: &mut RowStream,
        schema: &Schema,
        writer: &mut BatchWriter<'_>,
        file_hash: &str,
        progress: &mut AttemptProgress,
    ) -> Result<(), ProcessingError> {
        while let Some(row) = rows.next_row(schema).await? {
            if row.number > self.config.max_rows {
                return Err(CapacityError {
                    row_number: row.number,
                    limit: self.config.max_rows,
                }
                .into());
            }
            progress.total_rows = row.number;
            let key = row_key(file_hash, row.number)?;
            writer.push(key, row).await?;
        }
        writer.finish().await?;
        Ok(())
    }

    /// Best-effort FAILED summary; a store failure here is logged, not raised.
    /// A COMPLETED summary written by a concurrent delivery is never downgraded.
    async fn record_failure(&self, attempt: &ProcessingAttempt, err: &ProcessingError) {
        let recorder = SummaryRecorder::new(self.store.as_ref());
        if let Ok(Some(existing)) = recorder.fetch(&attempt.fingerprint).await {
            if existing.is_completed() {
                info!(
                    file_hash = %attempt.fingerprint,
                    error = %err,
                    "File already completed by another delivery; keeping COMPLETED summary"
                );
                return;
            }
        }

        let summary = SummaryRecord::failed(
            attempt.fingerprint.clone(),
            attempt.object.storage_path(),
            &attempt.progress,
            attempt.started_at,
            err,
        );
        if let Err(store_err) = recorder.record(&summary).await {
            warn!(error = %store_err, "Could not record FAILED summary");
        }
    }

    fn skipped(&self, reason: SkipReason, delivery_attempt: u32) -> AttemptReport {
        let report = AttemptReport {
            object: None,
            fingerprint: None,
            delivery_attempt,
            state: ProcessingState::Skipped,
            outcome: AttemptOutcome::Skipped(reason),
            disposition: Disposition::Ack,
            progress: AttemptProgress::default(),
        };
        log_report(&report);
        report
    }

    /// A payload that never identified a file: no fingerprint, so no summary.
    fn rejected(&self, err: ProcessingError, delivery_attempt: u32) -> AttemptReport {
        let outcome = AttemptOutcome::Failed(err);
        let disposition = self.config.delivery.decide(&outcome, delivery_attempt);
        let state = if matches!(disposition, Disposition::DeadLetter { .. }) {
            ProcessingState::DeadLettered
        } else {
            ProcessingState::FailedTransient
        };
        let report = AttemptReport {
            object: None,
            fingerprint: None,
            delivery_attempt,
            state,
            outcome,
            disposition,
            progress: AttemptProgress::default(),
        };
        log_report(&report);
        report
    }
}

/// One event per finished attempt, at a level matching how it ended.
fn log_report(report: &AttemptReport) {
    let source_file = report
        .object
        .as_ref()
        .map(ObjectRef::storage_path)
        .unwrap_or_default();
    let file_hash = report.fingerprint.as_deref().unwrap_or_default();

    match (&report.outcome, &report.disposition) {
        (AttemptOutcome::Completed(summary), _) => info!(
            file_hash,
            source_file = %source_file,
            row_count = summary.total_rows,
            batches = summary.batches_written,
            attempt = report.delivery_attempt,
            "File processed"
        ),
        (AttemptOutcome::AlreadyCompleted(summary), _) => info!(
            file_hash,
            source_file = %source_file,
            row_count = summary.total_rows,
            attempt = report.delivery_attempt,
            "File already processed, acknowledging"
        ),
        (AttemptOutcome::Skipped(reason), _) => info!(
            attempt = report.delivery_attempt,
            reason = %reason,
            "Notification skipped"
        ),
        (AttemptOutcome::Failed(err), Disposition::Retry { delay }) => warn!(
            file_hash,
            source_file = %source_file,
            attempt = report.delivery_attempt,
            state = %report.state,
            kind = err.kind(),
            error = %err,
            retry_in = ?delay,
            "Attempt failed, will be redelivered"
        ),
        (AttemptOutcome::Failed(err), _) => error!(
            file_hash,
            source_file = %source_file,
            attempt = report.delivery_attempt,
            state = %report.state,
            kind = err.kind(),
            error = %err,
            processed_rows = report.progress.processed_rows,
            "Attempt failed permanently"
        ),
    }
}
