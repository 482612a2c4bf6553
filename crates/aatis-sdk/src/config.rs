//! SDK Configuration
//!
//! Defines configuration options for the AATIS orchestration core. Every
//! section deserializes with defaults, so a TOML file only needs the keys it
//! changes.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use aatis_core::Similarity;

use crate::SDKResult;

/// SDK configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SDKConfig {
    /// Path to the SQLite database file (in-memory state only when unset)
    pub database_path: Option<PathBuf>,

    /// JSON-lines audit log appended next to the database (optional)
    pub audit_log_path: Option<PathBuf>,

    /// Dimension of every embedding vector
    pub embedding_dimensions: usize,

    /// Similarity metric of the vector index
    pub similarity: Similarity,

    /// Memory configuration
    pub memory: MemoryConfig,

    /// Task engine configuration
    pub tasks: TaskConfig,

    /// Router configuration
    pub router: RouterConfig,

    /// Constitution configuration
    pub constitution: ConstitutionConfig,
}

impl Default for SDKConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            audit_log_path: None,
            embedding_dimensions: 384,
            similarity: Similarity::Cosine,
            memory: MemoryConfig::default(),
            tasks: TaskConfig::default(),
            router: RouterConfig::default(),
            constitution: ConstitutionConfig::default(),
        }
    }
}

/// Tiered memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum STM records (default: 256)
    pub stm_capacity: usize,

    /// Accesses needed to promote STM -> MTM (default: 3)
    pub stm_promotion_threshold: u64,

    /// Last access must be this recent for STM promotion, seconds (default: 300)
    pub stm_recency_window_secs: u64,

    /// STM records idle this long are evicted, seconds (default: 900 = 15 minutes)
    pub stm_ttl_secs: u64,

    /// Maximum MTM records (default: 1024)
    pub mtm_capacity: usize,

    /// Accesses needed to promote MTM -> LTM (default: 8)
    pub mtm_promotion_threshold: u64,

    /// MTM records idle this long are demoted, seconds (default: 86400 = 1 day)
    pub mtm_ttl_secs: u64,

    /// Maximum LTM records (default: 10000)
    pub ltm_capacity: usize,

    /// Sweep interval in seconds (default: 60)
    pub sweep_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            stm_capacity: 256,
            stm_promotion_threshold: 3,
            stm_recency_window_secs: 300, // 5 minutes
            stm_ttl_secs: 900,            // 15 minutes
            mtm_capacity: 1024,
            mtm_promotion_threshold: 8,
            mtm_ttl_secs: 86_400, // 1 day
            ltm_capacity: 10_000,
            sweep_interval_secs: 60,
        }
    }
}

impl MemoryConfig {
    pub fn stm_recency_window(&self) -> Duration {
        secs(self.stm_recency_window_secs)
    }

    pub fn stm_ttl(&self) -> Duration {
        secs(self.stm_ttl_secs)
    }

    pub fn mtm_ttl(&self) -> Duration {
        secs(self.mtm_ttl_secs)
    }
}

/// Task engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Bound on Dispatched/Executing before a forced timeout, seconds (default: 600)
    pub execution_timeout_secs: u64,

    /// Terminal tasks older than this are archived, seconds (default: 604800 = 1 week)
    pub archive_retention_secs: u64,

    /// Failures after which a capability is excluded for a retry chain (default: 2)
    pub capability_failure_limit: u32,

    /// Times an escalated task may return to Routed (default: 1)
    pub max_reroutes: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 600,
            archive_retention_secs: 604_800, // 1 week
            capability_failure_limit: 2,
            max_reroutes: 1,
        }
    }
}

impl TaskConfig {
    pub fn execution_timeout(&self) -> Duration {
        secs(self.execution_timeout_secs)
    }

    pub fn archive_retention(&self) -> Duration {
        secs(self.archive_retention_secs)
    }
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Buffered completion events (default: 64)
    pub completion_channel_capacity: usize,

    /// Memory records handed to the gate as context (default: 5)
    pub memory_context_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            completion_channel_capacity: 64,
            memory_context_size: 5,
        }
    }
}

/// Constitution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstitutionConfig {
    /// TOML rule file replacing the built-in constitution (optional)
    pub rules_path: Option<PathBuf>,

    /// Jurisdiction whose law every action must respect (default: "Default")
    pub jurisdiction: String,
}

impl Default for ConstitutionConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            jurisdiction: "Default".into(),
        }
    }
}

impl SDKConfig {
    /// Create a new SDK config persisting to the given database path
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: Some(database_path.into()),
            ..Default::default()
        }
    }

    /// Create a config that keeps all state in memory
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Parse a config from TOML text
    pub fn from_toml_str(content: &str) -> SDKResult<Self> {
        let config: SDKConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a TOML file
    pub fn load(path: &Path) -> SDKResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Set the embedding dimension and metric
    pub fn with_embeddings(mut self, dimensions: usize, similarity: Similarity) -> Self {
        self.embedding_dimensions = dimensions;
        self.similarity = similarity;
        self
    }

    /// Set the audit log path
    pub fn with_audit_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log_path = Some(path.into());
        self
    }

    /// Set memory configuration
    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Set task engine configuration
    pub fn with_tasks(mut self, tasks: TaskConfig) -> Self {
        self.tasks = tasks;
        self
    }

    /// Set router configuration
    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// Set constitution configuration
    pub fn with_constitution(mut self, constitution: ConstitutionConfig) -> Self {
        self.constitution = constitution;
        self
    }

    /// A core lease without a heartbeat for this long is considered dead
    pub fn lease_ttl(&self) -> Duration {
        secs(self.memory.sweep_interval_secs.saturating_mul(3).max(30))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        positive("embedding_dimensions", self.embedding_dimensions as u64)?;

        let m = &self.memory;
        positive("memory.stm_capacity", m.stm_capacity as u64)?;
        positive("memory.mtm_capacity", m.mtm_capacity as u64)?;
        positive("memory.ltm_capacity", m.ltm_capacity as u64)?;
        positive("memory.stm_promotion_threshold", m.stm_promotion_threshold)?;
        positive("memory.mtm_promotion_threshold", m.mtm_promotion_threshold)?;
        duration("memory.stm_recency_window_secs", m.stm_recency_window_secs)?;
        duration("memory.stm_ttl_secs", m.stm_ttl_secs)?;
        duration("memory.mtm_ttl_secs", m.mtm_ttl_secs)?;
        duration("memory.sweep_interval_secs", m.sweep_interval_secs)?;

        let t = &self.tasks;
        duration("tasks.execution_timeout_secs", t.execution_timeout_secs)?;
        duration("tasks.archive_retention_secs", t.archive_retention_secs)?;
        positive("tasks.capability_failure_limit", t.capability_failure_limit as u64)?;

        positive(
            "router.completion_channel_capacity",
            self.router.completion_channel_capacity as u64,
        )?;

        if self.constitution.jurisdiction.trim().is_empty() {
            return Err(ConfigValidationError::InvalidValue {
                field: "constitution.jurisdiction".into(),
                message: "must not be empty".into(),
            });
        }

        Ok(())
    }
}

fn positive(field: &str, value: u64) -> Result<(), ConfigValidationError> {
    if value == 0 {
        return Err(ConfigValidationError::InvalidValue {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
    Ok(())
}

/// Upper bound for every duration setting (100 years)
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 86_400;

fn duration(field: &str, value: u64) -> Result<(), ConfigValidationError> {
    positive(field, value)?;
    if value > MAX_DURATION_SECS {
        return Err(ConfigValidationError::InvalidValue {
            field: field.into(),
            message: format!("must be at most {} seconds", MAX_DURATION_SECS),
        });
    }
    Ok(())
}

/// Seconds as a duration, saturating instead of overflowing
fn secs(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
