//! Postgres adapters against a real database
//!
//! Requires Docker; run with `cargo test -- --ignored`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use csvflow_common::types::{ObjectRef, ProcessingStatus};
use csvflow_processor::config::{DatabaseConfig, EngineConfig};
use csvflow_processor::db;
use csvflow_processor::engine::{fingerprint, row_key, ProcessingState};
use csvflow_processor::error::QueueError;
use csvflow_processor::queue::{PgWorkQueue, WorkQueue};
use csvflow_processor::storage::MemoryObjectSource;
use csvflow_processor::store::{ColumnFamily, PgTableStore, RowMutation, TableStore};
use csvflow_processor::DeliveryCoordinator;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,csvflow_processor=debug")),
        )
        .with_test_writer()
        .try_init();
}

async fn database() -> Result<(ContainerAsync<Postgres>, sqlx::PgPool)> {
    init_tracing();
    let container = Postgres::default().with_tag("16-alpine").start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;

    let config = DatabaseConfig {
        url: format!("postgresql://postgres:postgres@{}:{}/postgres", host, port),
        max_connections: 5,
        min_connections: 1,
        connect_timeout_secs: 30,
    };
    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;
    db::health_check(&pool).await?;
    Ok((container, pool))
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_table_store_upserts_and_reads_rows() -> Result<()> {
    let (_container, pool) = database().await?;
    let store = PgTableStore::new(pool);

    let mut first = RowMutation::new("abc_0000000001");
    first
        .set(ColumnFamily::Data, "name", "alice")
        .set(ColumnFamily::Metadata, "row_number", "1");
    let statuses = store.mutate_rows(&[first]).await?;
    assert!(statuses.iter().all(|s| s.is_written()));

    let mut second = RowMutation::new("abc_0000000001");
    second.set(ColumnFamily::Data, "name", "alicia");
    store.commit_row(&second).await?;

    let row = store.read_row("abc_0000000001").await?.unwrap();
    assert_eq!(row.data["name"], "alicia");
    assert_eq!(row.metadata["row_number"], "1");
    assert!(store.read_row("missing").await?.is_none());
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_table_store_batch_falls_back_to_single_rows() -> Result<()> {
    let (_container, pool) = database().await?;
    let store = PgTableStore::new(pool);

    let batch: Vec<RowMutation> = (1..=50)
        .map(|n| {
            let mut mutation = RowMutation::new(format!("bat_{:010}", n));
            mutation.set(ColumnFamily::Data, "n", n.to_string());
            mutation
        })
        .collect();
    let statuses = store.mutate_rows(&batch).await?;
    assert_eq!(statuses.len(), 50);
    assert!(statuses.iter().all(|s| s.is_written()));
    assert_eq!(store.read_row("bat_0000000050").await?.unwrap().data["n"], "50");

    // Postgres text cannot hold NUL, so the batch statement is rejected
    let mut rejected = RowMutation::new("bad_0000000002");
    rejected.set(ColumnFamily::Data, "n", "nul\u{0}byte");
    let mut first = RowMutation::new("bad_0000000001");
    first.set(ColumnFamily::Data, "n", "1");
    let mut third = RowMutation::new("bad_0000000003");
    third.set(ColumnFamily::Data, "n", "3");

    let statuses = store.mutate_rows(&[first, rejected, third]).await?;
    assert!(statuses[0].is_written());
    assert!(!statuses[1].is_written());
    assert!(statuses[2].is_written());
    assert!(store.read_row("bad_0000000002").await?.is_none());
    assert_eq!(store.read_row("bad_0000000003").await?.unwrap().data["n"], "3");
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_coordinator_against_postgres_store() -> Result<()> {
    let (_container, pool) = database().await?;
    let objects = Arc::new(MemoryObjectSource::new());
    let object = ObjectRef::new("uploads", "2024/01/18/09/pg_orders.csv");
    objects.put(&object, "id,total\n1,9.99\n2,19.99\n3,4.00\n").await;

    let coordinator = DeliveryCoordinator::new(
        objects,
        Arc::new(PgTableStore::new(pool.clone())),
        EngineConfig::default(),
    );
    let report = coordinator.process_object(&object, 1, false).await;
    assert_eq!(report.state, ProcessingState::Completed);

    let summary = coordinator.summary(&object).await?.unwrap();
    assert_eq!(summary.status, ProcessingStatus::Completed);
    assert_eq!(summary.processed_rows, 3);

    let store = PgTableStore::new(pool);
    let key = row_key(&fingerprint(&object), 2)?;
    let row = store.read_row(key.as_str()).await?.unwrap();
    assert_eq!(row.data["total"], "19.99");
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_work_queue_redelivers_and_dead_letters() -> Result<()> {
    let (_container, pool) = database().await?;
    let queue = PgWorkQueue::new(pool);

    let id = queue.publish(b"payload").await?;
    let first = queue.receive(Duration::from_secs(60)).await?.unwrap();
    assert_eq!((first.id, first.attempt), (id, 1));
    assert!(queue.receive(Duration::from_secs(60)).await?.is_none());

    queue.retry(&first, Duration::ZERO).await?;
    let second = queue.receive(Duration::from_secs(60)).await?.unwrap();
    assert_eq!(second.attempt, 2);
    assert!(matches!(queue.ack(&first).await, Err(QueueError::NotInFlight(_))));

    queue.dead_letter(&second, "gave up").await?;
    assert!(queue.dead_letter(&second, "gave up").await.is_err());
    assert!(queue.receive(Duration::from_secs(60)).await?.is_none());

    let dead = queue.dead_letters(10).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, b"payload");
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(dead[0].reason, "gave up");
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_work_queue_dead_letters_lapsed_final_lease() -> Result<()> {
    let (_container, pool) = database().await?;
    let queue = PgWorkQueue::with_max_attempts(pool, 2);

    let id = queue.publish(b"crashes the worker").await?;
    // Zero visibility: each lease lapses as soon as it is granted
    for attempt in 1..=2 {
        let delivery = queue.receive(Duration::ZERO).await?.unwrap();
        assert_eq!((delivery.id, delivery.attempt), (id, attempt));
    }
    assert!(queue.receive(Duration::ZERO).await?.is_none());

    let dead = queue.dead_letters(10).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, id);
    assert_eq!(dead[0].payload, b"crashes the worker");
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(dead[0].reason, "lease expired after 2 attempts");
    Ok(())
}
