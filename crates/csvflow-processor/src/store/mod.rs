//! Wide-column table store port
//!
//! Rows are addressed by [`RowKey`](crate::engine::RowKey) and hold cells in two
//! column families: `data` (one qualifier per schema column) and `metadata`
//! (fixed bookkeeping qualifiers). Every write is an upsert of the given cells,
//! so replaying a mutation is harmless.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StoreError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryTableStore;
pub use postgres::PgTableStore;

/// Fixed `metadata` qualifiers carried by every data row
pub mod metadata {
    pub const ROW_NUMBER: &str = "row_number";
    pub const FILE_HASH: &str = "file_hash";
    pub const SOURCE_FILE: &str = "source_file";
    pub const PROCESSED_AT: &str = "processed_at";
}

/// Column family of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnFamily {
    Data,
    Metadata,
}

impl ColumnFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnFamily::Data => "data",
            ColumnFamily::Metadata => "metadata",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "data" => Some(ColumnFamily::Data),
            "metadata" => Some(ColumnFamily::Metadata),
            _ => None,
        }
    }
}

/// Single cell write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub family: ColumnFamily,
    pub qualifier: String,
    pub value: String,
}

/// All cells to upsert for one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMutation {
    pub row_key: String,
    pub cells: Vec<Cell>,
}

impl RowMutation {
    pub fn new(row_key: impl Into<String>) -> Self {
        Self {
            row_key: row_key.into(),
            cells: Vec::new(),
        }
    }

    pub fn set(
        &mut self,
        family: ColumnFamily,
        qualifier: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.cells.push(Cell {
            family,
            qualifier: qualifier.into(),
            value: value.into(),
        });
        self
    }
}

/// Outcome of one row within a multi-row write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowWriteStatus {
    Written,
    Failed(String),
}

impl RowWriteStatus {
    pub fn is_written(&self) -> bool {
        matches!(self, RowWriteStatus::Written)
    }
}

/// A row as read back from the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredRow {
    pub row_key: String,
    pub data: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
}

impl StoredRow {
    pub fn new(row_key: impl Into<String>) -> Self {
        Self {
            row_key: row_key.into(),
            ..Default::default()
        }
    }

    pub fn family(&self, family: ColumnFamily) -> &BTreeMap<String, String> {
        match family {
            ColumnFamily::Data => &self.data,
            ColumnFamily::Metadata => &self.metadata,
        }
    }

    pub fn family_mut(&mut self, family: ColumnFamily) -> &mut BTreeMap<String, String> {
        match family {
            ColumnFamily::Data => &mut self.data,
            ColumnFamily::Metadata => &mut self.metadata,
        }
    }

    /// Upsert the mutation's cells into this row.
    pub fn apply(&mut self, mutation: &RowMutation) {
        for cell in &mutation.cells {
            self.family_mut(cell.family)
                .insert(cell.qualifier.clone(), cell.value.clone());
        }
    }
}

/// Write and read capability over the wide-column table.
///
/// Implementations must allow concurrent writers on different rows without
/// cross-row locking.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Upsert several rows in one operation.
    ///
    /// Returns one status per mutation, in input order. `Err` means the store
    /// could not be reached at all and nothing can be assumed written.
    async fn mutate_rows(&self, mutations: &[RowMutation])
        -> Result<Vec<RowWriteStatus>, StoreError>;

    /// Upsert a single row, failing unless it was written.
    async fn commit_row(&self, mutation: &RowMutation) -> Result<(), StoreError> {
        let statuses = self.mutate_rows(std::slice::from_ref(mutation)).await?;
        match statuses.as_slice() {
            [RowWriteStatus::Written] => Ok(()),
            [RowWriteStatus::Failed(message)] => Err(StoreError::Unavailable(format!(
                "row {} rejected: {}",
                mutation.row_key, message
            ))),
            other => Err(StoreError::StatusMismatch {
                expected: 1,
                actual: other.len(),
            }),
        }
    }

    /// Read a row by key.
    async fn read_row(&self, row_key: &str) -> Result<Option<StoredRow>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_upserts_cells() {
        let mut row = StoredRow::new("k");
        let mut first = RowMutation::new("k");
        first
            .set(ColumnFamily::Data, "a", "1")
            .set(ColumnFamily::Metadata, "row_number", "1");
        row.apply(&first);

        let mut second = RowMutation::new("k");
        second.set(ColumnFamily::Data, "a", "2");
        row.apply(&second);
        row.apply(&second);

        assert_eq!(row.data.get("a").map(String::as_str), Some("2"));
        assert_eq!(row.metadata.len(), 1);
    }

    #[test]
    fn test_family_names() {
        assert_eq!(ColumnFamily::parse("data"), Some(ColumnFamily::Data));
        assert_eq!(ColumnFamily::parse(ColumnFamily::Metadata.as_str()), Some(ColumnFamily::Metadata));
        assert_eq!(ColumnFamily::parse("other"), None);
    }
}
