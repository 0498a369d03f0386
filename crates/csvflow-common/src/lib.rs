//! csvflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the csvflow workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Checksums**: storage path fingerprints
//! - **Logging**: centralized `tracing` subscriber setup
//! - **Types**: object references and processing status shared by every member
//!
//! # Example
//!
//! ```no_run
//! use csvflow_common::checksum::path_fingerprint;
//! use csvflow_common::types::ObjectRef;
//!
//! let object = ObjectRef::new("uploads", "2024/01/18/09/3f2a9c1e_sales.csv");
//! let fingerprint = path_fingerprint(&object.storage_path());
//! assert_eq!(fingerprint.len(), 12);
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
