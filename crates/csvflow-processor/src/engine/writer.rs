//! Batched row writes with per-row retry
//!
//! Rows are buffered into batches of `batch_size` and each batch goes to the store
//! as one multi-row upsert. Rows the store rejects are retried on their own, up to
//! `batch_retries` times; rows still rejected after that end the attempt with
//! [`ProcessingError::PartialWrite`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::types::{Row, RowKey};
use crate::error::{ProcessingError, StoreError};
use crate::store::{metadata, ColumnFamily, RowMutation, RowWriteStatus, TableStore};

/// Default rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default retries of the failed subset of a batch.
pub const DEFAULT_BATCH_RETRIES: u32 = 3;

/// Default pause before the first retry; later retries wait proportionally longer.
pub const DEFAULT_BATCH_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterSettings {
    pub batch_size: usize,
    pub batch_retries: u32,
    pub retry_delay: Duration,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_retries: DEFAULT_BATCH_RETRIES,
            retry_delay: DEFAULT_BATCH_RETRY_DELAY,
        }
    }
}

/// File-level values stamped into every row's `metadata` family.
#[derive(Debug, Clone)]
pub struct WriteContext {
    pub fingerprint: String,
    pub source_file: String,
    pub processed_at: DateTime<Utc>,
}

/// Counters reported once all rows were handed to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub processed_rows: u64,
    pub batches_written: u64,
}

pub struct BatchWriter<'a> {
    store: &'a dyn TableStore,
    settings: WriterSettings,
    context: WriteContext,
    pending_numbers: Vec<u64>,
    pending: Vec<RowMutation>,
    processed_rows: u64,
    batches_written: u64,
    failed_rows: Vec<u64>,
}

impl<'a> BatchWriter<'a> {
    pub fn new(store: &'a dyn TableStore, settings: WriterSettings, context: WriteContext) -> Self {
        let capacity = settings.batch_size.max(1);
        Self {
            store,
            settings,
            context,
            pending_numbers: Vec::with_capacity(capacity),
            pending: Vec::with_capacity(capacity),
            processed_rows: 0,
            batches_written: 0,
            failed_rows: Vec::new(),
        }
    }

    /// Rows confirmed written so far.
    pub fn processed_rows(&self) -> u64 {
        self.processed_rows
    }

    pub fn batches_written(&self) -> u64 {
        self.batches_written
    }

    /// Row numbers that stayed unwritten after retries.
    pub fn failed_rows(&self) -> &[u64] {
        &self.failed_rows
    }

    /// Buffer one row, writing the batch once it is full.
    pub async fn push(&mut self, key: RowKey, row: Row) -> Result<(), ProcessingError> {
        let mutation = self.mutation(key, row.number, row.values);
        self.pending_numbers.push(row.number);
        self.pending.push(mutation);

        if self.pending.len() >= self.settings.batch_size.max(1) {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write whatever is still buffered.
    pub async fn finish(&mut self) -> Result<WriteStats, ProcessingError> {
        self.flush().await?;
        Ok(WriteStats {
            processed_rows: self.processed_rows,
            batches_written: self.batches_written,
        })
    }

    /// Push every row of `rows` and finish.
    pub async fn write_all<I>(&mut self, rows: I) -> Result<WriteStats, ProcessingError>
    where
        I: IntoIterator<Item = (RowKey, Row)>,
    {
        for (key, row) in rows {
            self.push(key, row).await?;
        }
        self.finish().await
    }

    fn mutation(
        &self,
        key: RowKey,
        number: u64,
        values: std::collections::BTreeMap<String, String>,
    ) -> RowMutation {
        let mut mutation = RowMutation::new(key.into_string());
        for (column, value) in values {
            mutation.set(ColumnFamily::Data, column, value);
        }
        mutation
            .set(ColumnFamily::Metadata, metadata::ROW_NUMBER, number.to_string())
            .set(ColumnFamily::Metadata, metadata::FILE_HASH, &self.context.fingerprint)
            .set(ColumnFamily::Metadata, metadata::SOURCE_FILE, &self.context.source_file)
            .set(
                ColumnFamily::Metadata,
                metadata::PROCESSED_AT,
                self.context
                    .processed_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        mutation
    }

    async fn flush(&mut self) -> Result<(), ProcessingError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let batch = self.batches_written + 1;
        let mut numbers = std::mem::take(&mut self.pending_numbers);
        let mut mutations = std::mem::take(&mut self.pending);
        let mut retry = 0u32;

        loop {
            let statuses = self.store.mutate_rows(&mutations).await?;
            if statuses.len() != mutations.len() {
                return Err(StoreError::StatusMismatch {
                    expected: mutations.len(),
                    actual: statuses.len(),
                }
                .into());
            }

            let mut failed_numbers = Vec::new();
            let mut failed = Vec::new();
            let mut last_error = None;
            for ((number, mutation), status) in numbers.into_iter().zip(mutations).zip(statuses) {
                match status {
                    RowWriteStatus::Written => self.processed_rows += 1,
                    RowWriteStatus::Failed(message) => {
                        failed_numbers.push(number);
                        failed.push(mutation);
                        last_error = Some(message);
                    },
                }
            }

            if failed.is_empty() {
                break;
            }

            if retry >= self.settings.batch_retries {
                error!(
                    file_hash = %self.context.fingerprint,
                    batch,
                    failed_rows = failed_numbers.len(),
                    first_failed_row = failed_numbers.first().copied(),
                    error = last_error.as_deref().unwrap_or_default(),
                    "Batch rows unrecoverable after retries"
                );
                let failed_rows = failed_numbers.len() as u64;
                self.failed_rows.extend(failed_numbers);
                return Err(ProcessingError::PartialWrite {
                    failed_rows,
                    processed_rows: self.processed_rows,
                });
            }

            retry += 1;
            warn!(
                file_hash = %self.context.fingerprint,
                batch,
                failed_rows = failed.len(),
                retry,
                "Retrying rejected rows"
            );
            tokio::time::sleep(self.settings.retry_delay * retry).await;
            numbers = failed_numbers;
            mutations = failed;
        }

        self.batches_written = batch;
        debug!(
            file_hash = %self.context.fingerprint,
            batch,
            processed_rows = self.processed_rows,
            "Batch written"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::keys::row_key;
    use crate::store::MemoryTableStore;
    use std::collections::BTreeMap;

    const FP: &str = "0123456789ab";

    fn context() -> WriteContext {
        WriteContext {
            fingerprint: FP.to_string(),
            source_file: "uploads/data.csv".to_string(),
            processed_at: Utc::now(),
        }
    }

    fn settings(batch_size: usize) -> WriterSettings {
        WriterSettings {
            batch_size,
            batch_retries: 3,
            retry_delay: Duration::ZERO,
        }
    }

    fn rows(n: u64) -> Vec<(RowKey, Row)> {
        (1..=n)
            .map(|number| {
                let mut values = BTreeMap::new();
                values.insert("id".to_string(), number.to_string());
                (row_key(FP, number).unwrap(), Row { number, values })
            })
            .collect()
    }

    #[tokio::test]
    async fn test_rows_are_grouped_into_batches() {
        let store = MemoryTableStore::new();
        let mut writer = BatchWriter::new(&store, settings(4), context());
        let stats = writer.write_all(rows(10)).await.unwrap();

        assert_eq!(stats.processed_rows, 10);
        assert_eq!(stats.batches_written, 3);
        assert_eq!(store.mutate_calls().await, 3);

        let stored = store.rows_with_prefix(FP).await;
        assert_eq!(stored.len(), 10);
        assert_eq!(stored[9].metadata["row_number"], "10");
        assert_eq!(stored[0].metadata["file_hash"], FP);
        assert_eq!(stored[0].metadata["source_file"], "uploads/data.csv");
        assert_eq!(stored[0].data["id"], "1");
    }

    #[tokio::test]
    async fn test_failed_subset_is_retried_until_written() {
        let store = MemoryTableStore::new();
        for number in 500..=510 {
            store.fail_row(row_key(FP, number).unwrap().into_string(), 2).await;
        }

        let mut writer = BatchWriter::new(&store, settings(1000), context());
        let stats = writer.write_all(rows(1000)).await.unwrap();

        assert_eq!(stats.processed_rows, 1000);
        assert!(writer.failed_rows().is_empty());
        // one full batch plus two retries of the 11 rejected rows
        assert_eq!(store.mutate_calls().await, 3);
        assert_eq!(store.row_count().await, 1000);
    }

    #[tokio::test]
    async fn test_exhausted_retries_raise_partial_write() {
        let store = MemoryTableStore::new();
        store.fail_row(row_key(FP, 3).unwrap().into_string(), 10).await;

        let mut writer = BatchWriter::new(&store, settings(2), context());
        let err = writer.write_all(rows(6)).await.unwrap_err();

        assert_eq!(
            err,
            ProcessingError::PartialWrite {
                failed_rows: 1,
                processed_rows: 3,
            }
        );
        assert_eq!(writer.failed_rows(), [3]);
        assert_eq!(writer.batches_written(), 1);
        // initial write plus three retries for the second batch
        assert_eq!(store.mutate_calls().await, 1 + 4);
    }

    #[tokio::test]
    async fn test_store_outage_is_transient() {
        let store = MemoryTableStore::new();
        store.set_unavailable(true).await;

        let mut writer = BatchWriter::new(&store, settings(10), context());
        let err = writer.write_all(rows(3)).await.unwrap_err();
        assert!(matches!(err, ProcessingError::TransientStore(_)));
        assert_eq!(writer.processed_rows(), 0);
    }

    #[tokio::test]
    async fn test_rewriting_is_idempotent() {
        let store = MemoryTableStore::new();
        for _ in 0..2 {
            let mut writer = BatchWriter::new(&store, settings(3), context());
            writer.write_all(rows(7)).await.unwrap();
        }
        assert_eq!(store.row_count().await, 7);
    }
}
