//! In-process table store with failure injection

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::{RowMutation, RowWriteStatus, StoredRow, TableStore};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<String, StoredRow>,
    /// Remaining injected failures per row key
    row_failures: HashMap<String, u32>,
    /// Remaining whole-call failures
    outages: u32,
    unavailable: bool,
    mutate_calls: u64,
    cell_writes: u64,
}

/// Table store backed by a sorted map.
///
/// Rows are kept in key order, like the wide-column store they stand in for.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    inner: Mutex<Inner>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes to `row_key` for the next `times` attempts.
    pub async fn fail_row(&self, row_key: impl Into<String>, times: u32) {
        self.inner
            .lock()
            .await
            .row_failures
            .insert(row_key.into(), times);
    }

    /// Fail the next `calls` calls to [`TableStore::mutate_rows`] as a whole.
    pub async fn fail_next_calls(&self, calls: u32) {
        self.inner.lock().await.outages = calls;
    }

    /// Make every call fail with [`StoreError::Unavailable`] until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Rows whose key starts with `prefix`, in key order.
    pub async fn rows_with_prefix(&self, prefix: &str) -> Vec<StoredRow> {
        self.inner
            .lock()
            .await
            .rows
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub async fn row_count(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    pub async fn mutate_calls(&self) -> u64 {
        self.inner.lock().await.mutate_calls
    }

    /// Total cells upserted, including overwrites.
    pub async fn cell_writes(&self) -> u64 {
        self.inner.lock().await.cell_writes
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn mutate_rows(
        &self,
        mutations: &[RowMutation],
    ) -> Result<Vec<RowWriteStatus>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.mutate_calls += 1;

        if inner.unavailable {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        if inner.outages > 0 {
            inner.outages -= 1;
            return Err(StoreError::Unavailable("injected outage".into()));
        }

        let mut statuses = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            if let Some(remaining) = inner.row_failures.get_mut(&mutation.row_key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    statuses.push(RowWriteStatus::Failed("injected row failure".into()));
                    continue;
                }
            }

            inner.cell_writes += mutation.cells.len() as u64;
            inner
                .rows
                .entry(mutation.row_key.clone())
                .or_insert_with(|| StoredRow::new(mutation.row_key.clone()))
                .apply(mutation);
            statuses.push(RowWriteStatus::Written);
        }

        Ok(statuses)
    }

    async fn read_row(&self, row_key: &str) -> Result<Option<StoredRow>, StoreError> {
        let inner = self.inner.lock().await;
        if inner.unavailable {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(inner.rows.get(row_key).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::ColumnFamily;

    fn mutation(key: &str, value: &str) -> RowMutation {
        let mut m = RowMutation::new(key);
        m.set(ColumnFamily::Data, "v", value);
        m
    }

    #[tokio::test]
    async fn test_upsert_overwrites_instead_of_appending() {
        let store = MemoryTableStore::new();
        store.mutate_rows(&[mutation("k1", "a")]).await.unwrap();
        store.mutate_rows(&[mutation("k1", "b")]).await.unwrap();

        assert_eq!(store.row_count().await, 1);
        let row = store.read_row("k1").await.unwrap().unwrap();
        assert_eq!(row.data["v"], "b");
    }

    #[tokio::test]
    async fn test_injected_row_failures_run_out() {
        let store = MemoryTableStore::new();
        store.fail_row("k2", 2).await;
        let batch = [mutation("k1", "a"), mutation("k2", "b")];

        for _ in 0..2 {
            let statuses = store.mutate_rows(&batch).await.unwrap();
            assert_eq!(statuses[0], RowWriteStatus::Written);
            assert!(!statuses[1].is_written());
        }
        let statuses = store.mutate_rows(&batch).await.unwrap();
        assert!(statuses.iter().all(RowWriteStatus::is_written));
    }

    #[tokio::test]
    async fn test_outages_and_prefix_scan() {
        let store = MemoryTableStore::new();
        store.fail_next_calls(1).await;
        assert!(store.mutate_rows(&[mutation("abc_1", "x")]).await.is_err());

        store
            .mutate_rows(&[mutation("abc_2", "x"), mutation("abc_1", "y"), mutation("abd_1", "z")])
            .await
            .unwrap();
        let keys: Vec<_> = store
            .rows_with_prefix("abc_")
            .await
            .into_iter()
            .map(|r| r.row_key)
            .collect();
        assert_eq!(keys, ["abc_1", "abc_2"]);

        store.set_unavailable(true).await;
        assert!(store.read_row("abc_1").await.is_err());
        assert!(store.commit_row(&mutation("abc_3", "q")).await.is_err());
    }
}
