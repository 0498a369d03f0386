//! csvflow Processor - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use csvflow_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use csvflow_common::types::ObjectRef;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use csvflow_processor::engine::{fingerprint, row_key};
use csvflow_processor::notification::Notification;
use csvflow_processor::queue::PgWorkQueue;
use csvflow_processor::storage::{S3ObjectSource, StorageConfig};
use csvflow_processor::store::PgTableStore;
use csvflow_processor::{db, Cli, Commands, DeliveryCoordinator, ProcessorConfig, WorkQueue, Worker};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("csvflow-processor")
        .filter_directives("sqlx=warn,aws_smithy_runtime=info,aws_config=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: failed to initialize logging: {}", e);
            None
        },
    };

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Key { object, row } => {
            let object = object.object();
            match row {
                Some(row) => println!("{}", row_key(&fingerprint(&object), *row)?),
                None => println!("{}", fingerprint(&object)),
            }
            Ok(())
        },
        Commands::Run => run_worker().await,
        Commands::Process { object, force } => process_one(object.object(), *force).await,
        Commands::Publish { object } => publish(object.object()).await,
        Commands::Summary { object } => {
            let config = ProcessorConfig::load()?;
            let pool = db::create_pool(&config.database).await?;
            let coordinator = coordinator(&config, pool)?;

            let object = object.object();
            match coordinator.summary(&object).await? {
                Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                None => anyhow::bail!("no summary recorded for {}", object),
            }
            Ok(())
        },
        Commands::DeadLetters { limit } => {
            let config = ProcessorConfig::load()?;
            let pool = db::create_pool(&config.database).await?;
            for entry in PgWorkQueue::new(pool).dead_letters(*limit).await? {
                let line = serde_json::json!({
                    "message_id": entry.message_id,
                    "attempts": entry.attempts,
                    "reason": entry.reason,
                    "enqueued_at": entry.enqueued_at,
                    "dead_lettered_at": entry.dead_lettered_at,
                    "payload": String::from_utf8_lossy(&entry.payload),
                });
                println!("{}", line);
            }
            Ok(())
        },
    }
}

fn coordinator(config: &ProcessorConfig, pool: sqlx::PgPool) -> Result<DeliveryCoordinator> {
    let storage = StorageConfig::from_env().context("Failed to load storage configuration")?;
    Ok(DeliveryCoordinator::new(
        Arc::new(S3ObjectSource::new(&storage)),
        Arc::new(PgTableStore::new(pool)),
        config.engine.clone(),
    ))
}

async fn run_worker() -> Result<()> {
    let config = ProcessorConfig::load()?;
    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;

    let coordinator = Arc::new(coordinator(&config, pool.clone())?);
    let queue = PgWorkQueue::with_max_attempts(pool, config.engine.delivery.max_attempts);
    let worker = Worker::new(
        Arc::new(queue),
        coordinator,
        config.worker.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await;
    Ok(())
}

async fn process_one(object: ObjectRef, force: bool) -> Result<()> {
    if !object.is_csv() {
        warn!(path = %object, "Object name does not end in .csv; processing anyway");
    }

    let config = ProcessorConfig::load()?;
    let pool = db::create_pool(&config.database).await?;
    let coordinator = coordinator(&config, pool)?;

    let report = coordinator.process_object(&object, 1, force).await;
    if let Some(err) = report.error() {
        anyhow::bail!("{} ended in {}: {}", object, report.state, err);
    }

    println!(
        "{}: {} ({} rows written)",
        object, report.state, report.progress.processed_rows
    );
    Ok(())
}

async fn publish(object: ObjectRef) -> Result<()> {
    let config = ProcessorConfig::load()?;
    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;

    let id = PgWorkQueue::new(pool)
        .publish(&Notification::envelope_for(&object))
        .await?;
    info!(message_id = id, path = %object, "Notification published");
    println!("{}", id);
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, finishing in-flight deliveries"),
        _ = terminate => info!("Received terminate signal, finishing in-flight deliveries"),
    }
}
