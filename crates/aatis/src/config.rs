//! Configuration management for aatis.
//!
//! Configuration is loaded from multiple sources with precedence:
//! 1. Environment variables (AATIS_*)
//! 2. Config file (~/.config/aatis/config.toml)
//! 3. Default values

use std::path::PathBuf;

use aatis_core::Database;
use aatis_sdk::SDKConfig;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File locations
    pub paths: PathsConfig,

    /// Orchestration core settings (memory, tasks, router, constitution)
    pub core: SDKConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// SQLite database shared with the running core
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// JSON-lines audit log (optional)
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            audit_log: None,
        }
    }
}

fn default_database() -> PathBuf {
    Database::find_database()
}

impl Config {
    /// Load configuration from file and environment.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            Self::from_toml_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Apply `AATIS_*` overrides
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("AATIS_DATABASE_PATH") {
            self.paths.database = PathBuf::from(path);
        }
        if let Some(path) = var("AATIS_AUDIT_LOG") {
            self.paths.audit_log = Some(PathBuf::from(path));
        }
        if let Some(path) = var("AATIS_RULES_PATH") {
            self.core.constitution.rules_path = Some(PathBuf::from(path));
        }
        if let Some(jurisdiction) = var("AATIS_JURISDICTION") {
            self.core.constitution.jurisdiction = jurisdiction;
        }
    }

    /// Get the config file path.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("AATIS_CONFIG") {
            return PathBuf::from(path);
        }
        match ProjectDirs::from("dev", "aatis", "aatis") {
            Some(dirs) => dirs.config_dir().join("config.toml"),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".aatis")
                .join("config.toml"),
        }
    }

    /// SDK configuration pointing at the configured database and audit log
    pub fn sdk_config(&self) -> SDKConfig {
        let mut core = self.core.clone();
        core.database_path = Some(self.paths.database.clone());
        core.audit_log_path = self.paths.audit_log.clone();
        core
    }

    /// Take the database lease for a command that changes persisted state.
    ///
    /// Fails while a running core holds the lease; the command would
    /// otherwise race the core's in-memory state.
    pub fn lease(&self) -> Result<CommandLease> {
        let db = self.open_database()?;
        let holder = format!("aatis-cli-{}", std::process::id());
        if let Some(other) = db.acquire_lease(&holder, self.core.lease_ttl())? {
            anyhow::bail!(
                "a running core ({}) is using {}; stop it before running this command",
                other,
                self.paths.database.display()
            );
        }
        Ok(CommandLease { db, holder })
    }

    /// Open the database read-write. Fails if it does not exist yet.
    pub fn open_database(&self) -> Result<Database> {
        if !self.paths.database.exists() {
            anyhow::bail!(
                "Database not found at {} (set AATIS_DATABASE_PATH or paths.database)",
                self.paths.database.display()
            );
        }
        Database::open_path(&self.paths.database).with_context(|| {
            format!("Failed to open database {}", self.paths.database.display())
        })
    }
}

/// Database lease held by a CLI command, released on drop
pub struct CommandLease {
    db: Database,
    holder: String,
}

impl Drop for CommandLease {
    fn drop(&mut self) {
        if let Err(e) = self.db.release_lease(&self.holder) {
            tracing::warn!(error = %e, "Failed to release database lease");
        }
    }
}
