//! Postgres-backed work queue
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers can poll the same
//! table. Every settle statement is guarded by the attempt count the worker
//! claimed, which makes a lease that expired and was re-claimed a no-op.
//! Messages whose lease lapsed on their final attempt are swept into
//! `dead_letters` before each claim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, warn};

use super::{DeadLetter, Delivery, WorkQueue};
use crate::config::DEFAULT_MAX_DELIVERY_ATTEMPTS;
use crate::error::QueueError;

const SWEEP_EXPIRED: &str = r#"
    WITH expired AS (
        DELETE FROM work_queue
        WHERE id IN (
            SELECT id FROM work_queue
            WHERE visible_at <= NOW() AND attempts >= $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, payload, attempts, enqueued_at
    )
    INSERT INTO dead_letters (message_id, payload, attempts, reason, enqueued_at)
    SELECT id, payload, attempts, 'lease expired after ' || attempts || ' attempts', enqueued_at
    FROM expired
    ON CONFLICT (message_id) DO NOTHING
"#;

const CLAIM_NEXT: &str = r#"
    UPDATE work_queue
    SET attempts = attempts + 1,
        claimed_at = NOW(),
        visible_at = NOW() + make_interval(secs => $1)
    WHERE id = (
        SELECT id FROM work_queue
        WHERE visible_at <= NOW() AND attempts < $2
        ORDER BY visible_at, id
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING id, attempts, payload, enqueued_at
"#;

const MOVE_TO_DEAD_LETTERS: &str = r#"
    INSERT INTO dead_letters (message_id, payload, attempts, reason, enqueued_at)
    SELECT id, payload, attempts, $3, enqueued_at
    FROM work_queue
    WHERE id = $1 AND attempts = $2
    ON CONFLICT (message_id) DO NOTHING
"#;

#[derive(Debug, Clone)]
pub struct PgWorkQueue {
    pool: PgPool,
    max_attempts: u32,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self::with_max_attempts(pool, DEFAULT_MAX_DELIVERY_ATTEMPTS)
    }

    pub fn with_max_attempts(pool: PgPool, max_attempts: u32) -> Self {
        Self {
            pool,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Most recent dead letters, newest first.
    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, payload, attempts, reason, enqueued_at, dead_lettered_at
            FROM dead_letters
            ORDER BY dead_lettered_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<DeadLetter, sqlx::Error> {
                let attempts: i32 = row.try_get("attempts")?;
                Ok(DeadLetter {
                    message_id: row.try_get("message_id")?,
                    payload: row.try_get("payload")?,
                    attempts: attempts.max(0) as u32,
                    reason: row.try_get("reason")?,
                    enqueued_at: row.try_get::<DateTime<Utc>, _>("enqueued_at")?,
                    dead_lettered_at: row.try_get::<DateTime<Utc>, _>("dead_lettered_at")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(QueueError::from)
    }
}

fn lease_lost(rows_affected: u64, delivery: &Delivery) -> Result<(), QueueError> {
    if rows_affected == 0 {
        Err(QueueError::NotInFlight(delivery.id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn publish(&self, payload: &[u8]) -> Result<i64, QueueError> {
        let id: i64 = sqlx::query_scalar("INSERT INTO work_queue (payload) VALUES ($1) RETURNING id")
            .bind(payload)
            .fetch_one(&self.pool)
            .await?;
        debug!(message_id = id, bytes = payload.len(), "Published message");
        Ok(id)
    }

    async fn receive(&self, visibility: Duration) -> Result<Option<Delivery>, QueueError> {
        let max_attempts = self.max_attempts as i32;
        let swept = sqlx::query(SWEEP_EXPIRED)
            .bind(max_attempts)
            .execute(&self.pool)
            .await?;
        if swept.rows_affected() > 0 {
            warn!(
                count = swept.rows_affected(),
                max_attempts,
                "Lease expired on final attempt, dead-lettered messages"
            );
        }

        let Some(row) = sqlx::query(CLAIM_NEXT)
            .bind(visibility.as_secs_f64())
            .bind(max_attempts)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let attempts: i32 = row.try_get("attempts")?;
        Ok(Some(Delivery {
            id: row.try_get("id")?,
            attempt: attempts.max(0) as u32,
            payload: row.try_get("payload")?,
            enqueued_at: row.try_get("enqueued_at")?,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM work_queue WHERE id = $1 AND attempts = $2")
            .bind(delivery.id)
            .bind(delivery.attempt as i32)
            .execute(&self.pool)
            .await?;
        lease_lost(result.rows_affected(), delivery)
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue
            SET visible_at = NOW() + make_interval(secs => $3), claimed_at = NULL
            WHERE id = $1 AND attempts = $2
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.attempt as i32)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;
        lease_lost(result.rows_affected(), delivery)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(MOVE_TO_DEAD_LETTERS)
            .bind(delivery.id)
            .bind(delivery.attempt as i32)
            .bind(reason)
            .execute(&mut *tx)
            .await?;

        let removed = sqlx::query("DELETE FROM work_queue WHERE id = $1 AND attempts = $2")
            .bind(delivery.id)
            .bind(delivery.attempt as i32)
            .execute(&mut *tx)
            .await?;

        lease_lost(removed.rows_affected(), delivery)?;
        tx.commit().await?;
        Ok(())
    }
}
