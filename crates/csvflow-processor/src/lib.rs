//! csvflow Processor Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Streams uploaded CSV files from object storage into a wide-column table.
//!
//! # Overview
//!
//! - **Engine**: delimiter detection, schema mapping, row keys, batched writes and
//!   the per-file summary record, driven by the [`DeliveryCoordinator`]
//! - **Ports**: [`ObjectSource`] for reading uploads, [`TableStore`] for rows and
//!   summaries, [`WorkQueue`] for at-least-once notification delivery
//! - **Adapters**: S3 and Postgres for production, in-memory variants for tests
//! - **Worker**: concurrent consumer loops that settle each delivery by
//!   acknowledging, retrying with backoff, or dead-lettering it
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use csvflow_common::types::ObjectRef;
//! use csvflow_processor::config::EngineConfig;
//! use csvflow_processor::storage::MemoryObjectSource;
//! use csvflow_processor::store::MemoryTableStore;
//! use csvflow_processor::DeliveryCoordinator;
//!
//! # async fn example() {
//! let objects = Arc::new(MemoryObjectSource::new());
//! let object = ObjectRef::new("uploads", "2024/01/18/09/3f2a9c1e_sales.csv");
//! objects.put(&object, "id,name\n1,alice\n2,bob\n").await;
//!
//! let coordinator = DeliveryCoordinator::new(
//!     objects,
//!     Arc::new(MemoryTableStore::new()),
//!     EngineConfig::default(),
//! );
//! let report = coordinator.process_object(&object, 1, false).await;
//! assert_eq!(report.progress.total_rows, 2);
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod notification;
pub mod queue;
pub mod storage;
pub mod store;
pub mod worker;

pub use cli::{Cli, Commands};
pub use config::{EngineConfig, ProcessorConfig};
pub use engine::{AttemptOutcome, AttemptReport, DeliveryCoordinator, Disposition};
pub use error::{ErrorClass, ProcessingError};
pub use queue::WorkQueue;
pub use storage::ObjectSource;
pub use store::TableStore;
pub use worker::Worker;
