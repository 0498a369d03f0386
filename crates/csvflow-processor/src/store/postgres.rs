//! Postgres-backed table store
//!
//! Column families are emulated as cells in `table_cells`, keyed by
//! `(row_key, family, qualifier)`. A batch is upserted in one statement. If the
//! database rejects it, each row is retried on its own so a single bad row only
//! fails itself; a row is always either fully written or not at all.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{debug, warn};

use super::{ColumnFamily, RowMutation, RowWriteStatus, StoredRow, TableStore};
use crate::error::StoreError;

const UPSERT_BATCH: &str = r#"
    INSERT INTO table_cells (row_key, family, qualifier, value)
    SELECT cell.row_key, cell.family, cell.qualifier, cell.value
    FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[])
        AS cell(row_key, family, qualifier, value)
    ON CONFLICT (row_key, family, qualifier)
    DO UPDATE SET value = EXCLUDED.value, written_at = NOW()
"#;

const UPSERT_ROW: &str = r#"
    INSERT INTO table_cells (row_key, family, qualifier, value)
    SELECT $1, cell.family, cell.qualifier, cell.value
    FROM UNNEST($2::text[], $3::text[], $4::text[]) AS cell(family, qualifier, value)
    ON CONFLICT (row_key, family, qualifier)
    DO UPDATE SET value = EXCLUDED.value, written_at = NOW()
"#;

#[derive(Debug, Clone)]
pub struct PgTableStore {
    pool: PgPool,
}

impl PgTableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Errors that mean the database itself is unreachable, as opposed to one
/// statement being rejected.
fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Cells of a set of mutations as parallel arrays, one entry per cell.
#[derive(Debug, Default, PartialEq, Eq)]
struct CellColumns<'a> {
    row_keys: Vec<&'a str>,
    families: Vec<&'a str>,
    qualifiers: Vec<&'a str>,
    values: Vec<&'a str>,
}

impl<'a> CellColumns<'a> {
    fn from_mutations(mutations: &'a [RowMutation]) -> Self {
        let mut columns = Self::default();
        for mutation in mutations {
            for cell in &mutation.cells {
                columns.row_keys.push(&mutation.row_key);
                columns.families.push(cell.family.as_str());
                columns.qualifiers.push(&cell.qualifier);
                columns.values.push(&cell.value);
            }
        }
        columns
    }
}

impl PgTableStore {
    async fn upsert_each(
        &self,
        conn: &mut sqlx::PgConnection,
        mutations: &[RowMutation],
    ) -> Result<Vec<RowWriteStatus>, StoreError> {
        let mut statuses = Vec::with_capacity(mutations.len());

        for mutation in mutations {
            let cells = CellColumns::from_mutations(std::slice::from_ref(mutation));
            let result = sqlx::query(UPSERT_ROW)
                .bind(&mutation.row_key)
                .bind(&cells.families)
                .bind(&cells.qualifiers)
                .bind(&cells.values)
                .execute(&mut *conn)
                .await;

            match result {
                Ok(_) => statuses.push(RowWriteStatus::Written),
                Err(err) if is_connection_error(&err) => return Err(unavailable(err)),
                Err(err) => {
                    warn!(row_key = %mutation.row_key, error = %err, "Row upsert rejected");
                    statuses.push(RowWriteStatus::Failed(err.to_string()));
                },
            }
        }

        Ok(statuses)
    }
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn mutate_rows(
        &self,
        mutations: &[RowMutation],
    ) -> Result<Vec<RowWriteStatus>, StoreError> {
        if mutations.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.acquire().await.map_err(unavailable)?;

        let cells = CellColumns::from_mutations(mutations);
        let result = sqlx::query(UPSERT_BATCH)
            .bind(&cells.row_keys)
            .bind(&cells.families)
            .bind(&cells.qualifiers)
            .bind(&cells.values)
            .execute(&mut *conn)
            .await;

        match result {
            Ok(_) => {
                debug!(
                    rows = mutations.len(),
                    cells = cells.row_keys.len(),
                    "Applied row mutations"
                );
                Ok(vec![RowWriteStatus::Written; mutations.len()])
            },
            Err(err) if is_connection_error(&err) => Err(unavailable(err)),
            Err(err) => {
                warn!(
                    rows = mutations.len(),
                    error = %err,
                    "Batch upsert rejected, writing rows individually"
                );
                self.upsert_each(&mut *conn, mutations).await
            },
        }
    }

    async fn read_row(&self, row_key: &str) -> Result<Option<StoredRow>, StoreError> {
        let cells = sqlx::query(
            "SELECT family, qualifier, value FROM table_cells WHERE row_key = $1",
        )
        .bind(row_key)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        if cells.is_empty() {
            return Ok(None);
        }

        let mut row = StoredRow::new(row_key);
        for cell in cells {
            let family: String = cell.try_get("family").map_err(unavailable)?;
            let family = ColumnFamily::parse(&family).ok_or_else(|| StoreError::Corrupt {
                row_key: row_key.to_string(),
                message: format!("unknown column family '{}'", family),
            })?;
            let qualifier: String = cell.try_get("qualifier").map_err(unavailable)?;
            let value: String = cell.try_get("value").map_err(unavailable)?;
            row.family_mut(family).insert(qualifier, value);
        }

        Ok(Some(row))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_cells_flatten_in_row_order() {
        let mut first = RowMutation::new("abc_0000000001");
        first
            .set(ColumnFamily::Data, "sku", "A-1")
            .set(ColumnFamily::Metadata, "row_number", "1");
        let mut second = RowMutation::new("abc_0000000002");
        second.set(ColumnFamily::Data, "sku", "A-2");
        let empty = RowMutation::new("abc_0000000003");

        let mutations = [first, second, empty];
        let cells = CellColumns::from_mutations(&mutations);
        assert_eq!(
            cells.row_keys,
            ["abc_0000000001", "abc_0000000001", "abc_0000000002"]
        );
        assert_eq!(cells.families, ["data", "metadata", "data"]);
        assert_eq!(cells.qualifiers, ["sku", "row_number", "sku"]);
        assert_eq!(cells.values, ["A-1", "1", "A-2"]);
    }
}
