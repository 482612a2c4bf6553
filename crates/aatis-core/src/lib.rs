//! aatis-core - Core library for the AATIS orchestration core
//!
//! This crate provides the leaf components shared by the SDK and the CLI:
//!
//! - **types**: Memory records, tasks, verdicts and capability descriptors
//! - **vector**: Similarity-search index over embedded records
//! - **audit**: Append-only audit event stream and sinks
//! - **db**: Direct SQLite persistence of the core's state

pub mod audit;
#[cfg(feature = "db")]
pub mod db;
pub mod error;
pub mod types;
pub mod vector;

// Re-export commonly used types
#[cfg(feature = "db")]
pub use db::Database;
pub use error::{Error, Result};
pub use vector::{SearchHit, Similarity, VectorIndex};
