//! Main SDK Entry Point
//!
//! Provides the [`Orchestrator`] that wires the memory store, task engine,
//! constitution gate and router together over one database and one audit
//! stream, and runs their background loops.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use uuid::Uuid;

use aatis_core::audit::{AuditSink, FanoutAuditSink, JsonlAuditSink};
use aatis_core::types::{MemoryTier, NewTask, Provenance, Task, VerdictOutcome};
use aatis_core::{Database, VectorIndex};

use crate::constitution::{ConstitutionGate, ProposedAction, RuleFile, default_rule_file};
use crate::memory::{EmbeddingProvider, HashingEmbedder, MemoryHit, SweepReport, TieredMemory};
use crate::router::{CapabilityRegistry, Router};
use crate::tasks::TaskEngine;
use crate::utils::{Clock, SystemClock};
use crate::{SDKConfig, SDKError, SDKResult};

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub sweep: SweepReport,
    pub timed_out: Vec<String>,
    pub archived: Vec<String>,
}

/// Database lease held while the background loops run
#[derive(Clone)]
struct Lease {
    db: Arc<Database>,
    holder: String,
    ttl: chrono::Duration,
}

impl Lease {
    fn renew(&self) {
        match self.db.acquire_lease(&self.holder, self.ttl) {
            Ok(None) => {}
            Ok(Some(other)) => tracing::error!(holder = %other, "Core lease taken over by another process"),
            Err(e) => tracing::error!(error = %e, "Failed to renew core lease"),
        }
    }
}

/// Components touched by the maintenance loop
#[derive(Clone)]
struct Maintenance {
    memory: Arc<TieredMemory>,
    engine: Arc<TaskEngine>,
    router: Arc<Router>,
    lease: Option<Lease>,
}

impl Maintenance {
    async fn run_once(&self) -> SDKResult<MaintenanceReport> {
        let sweep = self.memory.sweep().await?;
        let timed_out = self.router.enforce_timeouts().await;
        let archived = self
            .engine
            .archive_expired(self.engine.config().archive_retention())
            .await;
        Ok(MaintenanceReport {
            sweep,
            timed_out,
            archived,
        })
    }

    async fn run(self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(lease) = &self.lease {
                        lease.renew();
                    }
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Maintenance pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Maintenance loop stopped");
    }
}

/// AATIS orchestration core - Main entry point
///
/// # Example
///
/// ```rust,no_run
/// use aatis_sdk::{Orchestrator, SDKConfig};
/// use aatis_sdk::types::NewTask;
///
/// async fn example() -> anyhow::Result<()> {
///     let mut core = Orchestrator::new(SDKConfig::new("aatis.db"))?;
///     core.initialize().await?;
///     core.start()?;
///
///     let task = core.submit(NewTask::new("enumerate 10.0.0.0/24", ["scan"])).await?;
///     let done = core.tasks().wait_terminal(&task.id).await?;
///     println!("{} -> {}", done.id, done.state);
///
///     core.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct Orchestrator {
    config: SDKConfig,
    db: Option<Arc<Database>>,
    audit: Arc<dyn AuditSink>,
    memory: Arc<TieredMemory>,
    engine: Arc<TaskEngine>,
    gate: Arc<ConstitutionGate>,
    router: Arc<Router>,
    lease_holder: String,
    shutdown_tx: Option<watch::Sender<bool>>,
    workers: Vec<JoinHandle<()>>,
    initialized: bool,
}

/// Builder for [`Orchestrator`], for swapping the embedder, clock or adding
/// an audit sink
pub struct OrchestratorBuilder {
    config: SDKConfig,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl OrchestratorBuilder {
    pub fn new(config: SDKConfig) -> Self {
        Self {
            config,
            embedder: None,
            clock: None,
            audit: None,
        }
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Additional audit sink, next to the database and the JSON-lines log
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Build the orchestrator
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration validation fails
    /// - The database or audit log cannot be opened
    /// - The configured rule file is missing or malformed
    pub fn build(self) -> SDKResult<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let db = match &config.database_path {
            Some(path) => Some(Arc::new(Database::open_path(path)?)),
            None => None,
        };

        let mut fanout = FanoutAuditSink::new();
        if let Some(db) = &db {
            fanout = fanout.with(db.clone());
        }
        if let Some(path) = &config.audit_log_path {
            fanout = fanout.with(Arc::new(JsonlAuditSink::open(path)?));
        }
        if let Some(sink) = self.audit {
            fanout = fanout.with(sink);
        }
        let audit: Arc<dyn AuditSink> = Arc::new(fanout);

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(HashingEmbedder::new(config.embedding_dimensions)));
        if embedder.dimensions() != config.embedding_dimensions {
            tracing::warn!(
                embedder = embedder.dimensions(),
                index = config.embedding_dimensions,
                "Embedder dimension differs from the index; embedded writes will be rejected"
            );
        }

        let rules = match &config.constitution.rules_path {
            Some(path) => RuleFile::load(path)?,
            None => default_rule_file()?,
        };
        let gate = Arc::new(ConstitutionGate::new(
            &rules,
            config.constitution.jurisdiction.clone(),
            db.clone(),
            audit.clone(),
        )?);

        let mut memory = TieredMemory::new(
            config.memory.clone(),
            VectorIndex::new(config.embedding_dimensions, config.similarity),
            embedder,
        )
        .with_audit(audit.clone())
        .with_clock(clock.clone());
        let mut engine = TaskEngine::new(config.tasks.clone())
            .with_audit(audit.clone())
            .with_clock(clock);
        let mut registry = CapabilityRegistry::new().with_audit(audit.clone());
        if let Some(db) = &db {
            memory = memory.with_db(db.clone());
            engine = engine.with_db(db.clone());
            registry = registry.with_db(db.clone())?;
        }

        let memory = Arc::new(memory);
        let engine = Arc::new(engine);
        let router = Arc::new(Router::new(
            engine.clone(),
            gate.clone(),
            memory.clone(),
            Arc::new(registry),
            config.router.clone(),
        ));

        Ok(Orchestrator {
            config,
            db,
            audit,
            memory,
            engine,
            gate,
            router,
            lease_holder: format!("core-{}-{}", std::process::id(), Uuid::new_v4().simple()),
            shutdown_tx: None,
            workers: Vec::new(),
            initialized: false,
        })
    }
}

impl Orchestrator {
    /// Create an orchestrator with the default embedder and clock
    pub fn new(config: SDKConfig) -> SDKResult<Self> {
        OrchestratorBuilder::new(config).build()
    }

    pub fn builder(config: SDKConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Load persisted memory records and tasks
    pub async fn initialize(&mut self) -> SDKResult<()> {
        if self.initialized {
            return Ok(());
        }

        let records = self.memory.load_from_db().await?;
        let tasks = self.engine.load_from_db().await?;
        tracing::info!(
            records,
            tasks,
            rule_set = self.gate.version(),
            "Orchestrator initialized"
        );

        self.initialized = true;
        Ok(())
    }

    /// Take the database lease, then spawn the completion loop and the
    /// maintenance loop.
    ///
    /// # Errors
    ///
    /// Fails when another running core holds the lease on the same database.
    pub fn start(&mut self) -> SDKResult<()> {
        if self.shutdown_tx.is_some() {
            return Ok(()); // Already running
        }
        if let Some(lease) = self.lease() {
            if let Some(other) = lease.db.acquire_lease(&lease.holder, lease.ttl)? {
                return Err(SDKError::invalid_operation(format!(
                    "database is in use by running core {}",
                    other
                )));
            }
        }

        let (tx, rx) = watch::channel(false);
        let every = Duration::from_secs(self.config.memory.sweep_interval_secs);

        self.workers
            .push(tokio::spawn(self.router.clone().run_completion_loop(rx.clone())));
        self.workers.push(tokio::spawn(self.maintenance().run(every, rx)));
        self.shutdown_tx = Some(tx);

        tracing::info!(interval_secs = every.as_secs(), holder = %self.lease_holder, "Orchestrator started");
        Ok(())
    }

    /// Stop the background loops and wait for them to finish
    pub async fn shutdown(&mut self) -> SDKResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        let was_running = !self.workers.is_empty();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Background loop ended abnormally");
            }
        }
        if was_running {
            if let Some(lease) = self.lease() {
                lease.db.release_lease(&lease.holder)?;
            }
        }
        tracing::info!("Orchestrator stopped");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Run one maintenance pass now: memory sweep, timeout scan, archiving
    pub async fn maintain(&self) -> SDKResult<MaintenanceReport> {
        self.maintenance().run_once().await
    }

    fn maintenance(&self) -> Maintenance {
        Maintenance {
            memory: self.memory.clone(),
            engine: self.engine.clone(),
            router: self.router.clone(),
            lease: self.lease(),
        }
    }

    fn lease(&self) -> Option<Lease> {
        self.db.as_ref().map(|db| Lease {
            db: db.clone(),
            holder: self.lease_holder.clone(),
            ttl: self.config.lease_ttl(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &SDKConfig {
        &self.config
    }

    pub fn database(&self) -> Option<&Arc<Database>> {
        self.db.as_ref()
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub fn memory(&self) -> &Arc<TieredMemory> {
        &self.memory
    }

    pub fn tasks(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    pub fn gate(&self) -> &Arc<ConstitutionGate> {
        &self.gate
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        self.router.registry()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Submit a request; see [`Router::submit`]
    pub async fn submit(&self, input: NewTask) -> SDKResult<Task> {
        self.router.submit(input).await
    }

    /// Ingest text into STM after a memory-write compliance check
    pub async fn ingest(&self, text: &str, provenance: Provenance) -> SDKResult<MemoryHit> {
        let verdict = self.gate.check(None, &ProposedAction::memory_write(text), &[], false);
        match verdict.outcome {
            VerdictOutcome::Allow => {}
            VerdictOutcome::Deny => {
                return Err(SDKError::PolicyDenied {
                    rules: verdict.violated_rules,
                });
            }
            VerdictOutcome::Escalate => {
                return Err(SDKError::PolicyEscalated {
                    rules: verdict.violated_rules,
                });
            }
        }

        let record = self.memory.remember(text, provenance, MemoryTier::ShortTerm).await?;
        Ok(MemoryHit { record, score: 1.0 })
    }

    /// Recall records similar to `text`
    pub async fn recall(
        &self,
        text: &str,
        tier: Option<MemoryTier>,
        k: usize,
    ) -> SDKResult<Vec<MemoryHit>> {
        self.memory.recall(text, tier, k).await
    }

    /// Replace the rule set from a TOML file. Returns the new version.
    pub fn reload_rules(&self, path: &Path) -> SDKResult<u32> {
        self.gate.reload_from_path(path)
    }

    /// Hard and core rules rendered for agent prompts
    pub fn prompt_block(&self) -> String {
        self.gate.prompt_block()
    }
}
