//! AATIS SDK - Memory & Task Orchestration Core
//!
//! This crate ties the orchestration components together:
//!
//! # Core Modules (from aatis-core)
//!
//! - **types** - Memory records, tasks, verdicts, capability descriptors
//! - **vector** - Similarity-search index
//! - **audit** - Audit event stream and sinks
//! - **db** - Direct SQLite persistence
//!
//! # SDK Modules
//!
//! - **memory** - Tiered memory store (short, medium and long term)
//! - **tasks** - Task state engine
//! - **constitution** - Rule-based compliance gate
//! - **router** - Capability registry and routing pipeline
//!
//! # Example
//!
//! ```rust,no_run
//! use aatis_sdk::{Orchestrator, SDKConfig};
//! use aatis_sdk::types::{MemoryTier, Provenance};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let mut core = Orchestrator::new(SDKConfig::new("aatis.db"))?;
//!     core.initialize().await?;
//!
//!     // Store an observation in short-term memory
//!     core.ingest("ssh 7.4 on 10.0.0.5:22", Provenance::agent("operator")).await?;
//!
//!     // Retrieve relevant context
//!     let hits = core.recall("ssh", Some(MemoryTier::ShortTerm), 5).await?;
//!
//!     Ok(())
//! }
//! ```

// ─────────────────────────────────────────────────────────────────────────────
// Re-export core modules from aatis-core
// ─────────────────────────────────────────────────────────────────────────────

/// Audit event stream and sinks
pub use aatis_core::audit;

/// Database access
pub use aatis_core::db;

/// Core types (MemoryRecord, Task, PolicyVerdict, ...)
pub use aatis_core::types;

/// Similarity-search index
pub use aatis_core::vector;

/// Error types from core
pub use aatis_core::error as core_error;

// ─────────────────────────────────────────────────────────────────────────────
// SDK-specific modules
// ─────────────────────────────────────────────────────────────────────────────

pub mod constitution;
pub mod memory;
pub mod router;
pub mod tasks;
pub mod utils;

mod config;
mod error;
mod sdk;

// Re-export main SDK types
pub use config::{
    ConfigValidationError, ConstitutionConfig, MemoryConfig, RouterConfig, SDKConfig, TaskConfig,
};
pub use error::{SDKError, SDKResult};
pub use sdk::{MaintenanceReport, Orchestrator, OrchestratorBuilder};

pub use constitution::{ConstitutionGate, ProposedAction, RuleFile, RuleSet};
pub use memory::{EmbeddingProvider, HashingEmbedder, MemoryHit, MemoryStats, SweepReport, TieredMemory};
pub use router::{AgentCapability, CapabilityError, CapabilityOutput, CapabilityRegistry, Router};
pub use tasks::TaskEngine;
