//! Task State Engine
//!
//! Sole mutator of task state. Every task sits behind its own mutex, so
//! transitions of one task are linearizable and its log never interleaves,
//! while different tasks progress independently. Accepted transitions are
//! persisted, audited and published on a per-task watch channel.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use uuid::Uuid;

use aatis_core::Database;
use aatis_core::audit::{self, AuditEvent, AuditEventType, AuditSink, NullAuditSink};
use aatis_core::types::{
    Actor, FailureReason, MemoryId, NewTask, PolicyVerdict, Task, TaskState, TransitionEntry,
};

use super::state;
use crate::config::TaskConfig;
use crate::utils::{Clock, SystemClock, elapsed_since};
use crate::{SDKError, SDKResult};

struct TaskSlot {
    task: Mutex<Task>,
    state_tx: watch::Sender<TaskState>,
}

impl TaskSlot {
    fn new(task: Task) -> Arc<Self> {
        let (state_tx, _) = watch::channel(task.state);
        Arc::new(Self {
            task: Mutex::new(task),
            state_tx,
        })
    }
}

/// Owns every task and applies lifecycle transitions
pub struct TaskEngine {
    config: TaskConfig,
    tasks: RwLock<HashMap<String, Arc<TaskSlot>>>,
    db: Option<Arc<Database>>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl TaskEngine {
    pub fn new(config: TaskConfig) -> Self {
        Self {
            config,
            tasks: RwLock::new(HashMap::new()),
            db: None,
            audit: Arc::new(NullAuditSink),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_db(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creation
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a task in `Received`
    pub async fn create(&self, input: NewTask) -> SDKResult<Task> {
        if input.request.trim().is_empty() {
            return Err(SDKError::invalid_operation("task request is empty"));
        }
        let task = self.new_task(input.request, input.required_tags, input.priority);
        self.insert(task, "created").await
    }

    /// Create a new task repeating a failed one.
    ///
    /// The new task inherits the per-capability failure counts of the chain,
    /// so capabilities that already failed it too often stay excluded.
    pub async fn create_retry(&self, original_id: &str) -> SDKResult<Task> {
        let original = self
            .get(original_id)
            .await
            .ok_or_else(|| aatis_core::Error::TaskNotFound(original_id.to_string()))?;

        if original.failure.is_none() {
            return Err(SDKError::invalid_operation(format!(
                "task {} has not failed ({})",
                original.id, original.state
            )));
        }

        let mut task = self.new_task(original.request, original.required_tags, original.priority);
        task.capability_failures = original.capability_failures;
        task.retry_of = Some(original.id.clone());
        self.insert(task, &format!("retry of {}", original.id)).await
    }

    fn new_task(&self, request: String, required_tags: BTreeSet<String>, priority: i32) -> Task {
        let now = self.clock.now();
        Task {
            id: Uuid::new_v4().to_string(),
            request,
            required_tags,
            state: TaskState::Received,
            priority,
            assigned_capability: None,
            created_at: now,
            updated_at: now,
            transitions: Vec::new(),
            result_ref: None,
            failure: None,
            verdicts: Vec::new(),
            capability_failures: Default::default(),
            reroutes: 0,
            output_tags: BTreeSet::new(),
            retry_of: None,
        }
    }

    async fn insert(&self, task: Task, detail: &str) -> SDKResult<Task> {
        self.persist(&task);
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(&task.id, AuditEventType::TaskCreated, "engine", detail).at(task.created_at),
        );
        tracing::info!(task_id = %task.id, tags = ?task.required_tags, "Task received");

        self.tasks
            .write()
            .await
            .insert(task.id.clone(), TaskSlot::new(task.clone()));
        Ok(task)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Received -> Routed, assigning a capability
    pub async fn route(&self, task_id: &str, capability: &str) -> SDKResult<Task> {
        self.mutate(task_id, |engine, task| {
            engine.step(task, TaskState::Routed, Actor::Router, None, Some(format!("capability={}", capability)))?;
            task.assigned_capability = Some(capability.to_string());
            Ok(())
        })
        .await
    }

    /// Change the assigned capability of a routed task
    pub async fn reassign(&self, task_id: &str, capability: &str) -> SDKResult<Task> {
        self.mutate(task_id, |_, task| {
            if task.state != TaskState::Routed {
                return Err(SDKError::invalid_operation(format!(
                    "task {} is {}, not routed",
                    task.id, task.state
                )));
            }
            tracing::debug!(task_id = %task.id, capability, "Task reassigned");
            task.assigned_capability = Some(capability.to_string());
            Ok(())
        })
        .await
    }

    /// Routed -> Dispatched -> Executing, as one atomic step
    pub async fn dispatch(&self, task_id: &str) -> SDKResult<Task> {
        self.mutate(task_id, |engine, task| {
            let capability = task.assigned_capability.clone();
            engine.step(task, TaskState::Dispatched, Actor::Router, None, capability)?;
            engine.step(task, TaskState::Executing, Actor::Router, None, None)
        })
        .await
    }

    /// Executing -> Completed, reported by the assigned capability
    pub async fn complete(
        &self,
        task_id: &str,
        capability: &str,
        result_ref: Option<MemoryId>,
        output_tags: BTreeSet<String>,
    ) -> SDKResult<Task> {
        self.mutate(task_id, |engine, task| {
            let detail = result_ref.map(|id| format!("result={}", id));
            engine.step(task, TaskState::Completed, Actor::Capability(capability.to_string()), None, detail)?;
            task.result_ref = result_ref;
            task.output_tags = output_tags;
            Ok(())
        })
        .await
    }

    /// Executing -> Failed(CapabilityError), counting the failure against the
    /// capability
    pub async fn capability_failed(
        &self,
        task_id: &str,
        capability: &str,
        message: &str,
    ) -> SDKResult<Task> {
        self.mutate(task_id, |engine, task| {
            let reason = FailureReason::CapabilityError {
                capability: capability.to_string(),
                message: message.to_string(),
            };
            engine.step(task, TaskState::Failed, Actor::Capability(capability.to_string()), Some(reason), None)?;
            *task.capability_failures.entry(capability.to_string()).or_insert(0) += 1;
            Ok(())
        })
        .await
    }

    /// Force a task to `Failed` with a typed reason
    pub async fn fail(
        &self,
        task_id: &str,
        reason: FailureReason,
        actor: Actor,
        detail: Option<String>,
    ) -> SDKResult<Task> {
        self.mutate(task_id, |engine, task| {
            engine.step(task, TaskState::Failed, actor, Some(reason), detail)
        })
        .await
    }

    /// Any non-terminal state -> Escalated, by the constitution gate
    pub async fn escalate(&self, task_id: &str, rules: &[String]) -> SDKResult<Task> {
        self.mutate(task_id, |engine, task| {
            engine.step(task, TaskState::Escalated, Actor::Constitution, None, Some(rules.join(",")))
        })
        .await
    }

    /// Escalated -> Routed, on operator approval. Allowed once per task.
    pub async fn reroute(&self, task_id: &str, operator: &str) -> SDKResult<Task> {
        self.mutate(task_id, |engine, task| {
            engine.step(task, TaskState::Routed, Actor::Operator(operator.to_string()), None, Some("approved".into()))?;
            task.reroutes += 1;
            Ok(())
        })
        .await
    }

    /// Cancel a task. Terminal tasks are returned unchanged.
    pub async fn cancel(&self, task_id: &str, requested_by: &str) -> SDKResult<Task> {
        self.mutate(task_id, |engine, task| {
            if task.state.is_terminal() {
                return Ok(());
            }
            engine.step(
                task,
                TaskState::Failed,
                Actor::Operator(requested_by.to_string()),
                Some(FailureReason::Cancelled),
                None,
            )
        })
        .await
    }

    /// Completed | Failed -> Archived
    pub async fn archive(&self, task_id: &str, actor: Actor) -> SDKResult<Task> {
        self.mutate(task_id, |engine, task| {
            engine.step(task, TaskState::Archived, actor, None, None)
        })
        .await
    }

    /// Attach a verdict to the task without changing its state
    pub async fn record_verdict(&self, task_id: &str, verdict: PolicyVerdict) -> SDKResult<Task> {
        self.mutate(task_id, |_, task| {
            task.verdicts.push(verdict);
            Ok(())
        })
        .await
    }

    /// Fail every task that stayed Dispatched/Executing beyond the execution
    /// timeout. Returns the ids of the failed tasks.
    pub async fn check_timeouts(&self) -> Vec<String> {
        let limit = self.config.execution_timeout();
        let now = self.clock.now();
        let mut failed = Vec::new();

        for slot in self.slots().await {
            let mut task = slot.task.lock().await;
            if !matches!(task.state, TaskState::Dispatched | TaskState::Executing) {
                continue;
            }
            if elapsed_since(task.state_entered_at(), now) <= limit {
                continue;
            }
            let detail = format!("exceeded {}s", limit.num_seconds());
            if self
                .step(&mut task, TaskState::Failed, Actor::Engine, Some(FailureReason::Timeout), Some(detail))
                .is_ok()
            {
                self.publish(&slot, &task);
                failed.push(task.id.clone());
            }
        }

        if !failed.is_empty() {
            tracing::warn!(count = failed.len(), "Tasks timed out");
        }
        failed
    }

    /// Archive terminal tasks whose last update is older than `retention`.
    /// Returns the ids of the archived tasks.
    pub async fn archive_expired(&self, retention: Duration) -> Vec<String> {
        let now = self.clock.now();
        let mut archived = Vec::new();

        for slot in self.slots().await {
            let mut task = slot.task.lock().await;
            if !matches!(task.state, TaskState::Completed | TaskState::Failed) {
                continue;
            }
            if elapsed_since(task.updated_at, now) <= retention {
                continue;
            }
            if self.step(&mut task, TaskState::Archived, Actor::Engine, None, None).is_ok() {
                self.publish(&slot, &task);
                archived.push(task.id.clone());
            }
        }

        if !archived.is_empty() {
            tracing::info!(count = archived.len(), "Archived expired tasks");
        }
        archived
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        let slot = self.tasks.read().await.get(task_id).cloned()?;
        let task = slot.task.lock().await;
        Some(task.clone())
    }

    /// Tasks, oldest first, optionally filtered by state
    pub async fn list(&self, state: Option<TaskState>) -> Vec<Task> {
        let mut tasks = Vec::new();
        for slot in self.slots().await {
            let task = slot.task.lock().await;
            if state.is_none_or(|s| task.state == s) {
                tasks.push(task.clone());
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Watch the state of a task
    pub async fn subscribe(&self, task_id: &str) -> SDKResult<watch::Receiver<TaskState>> {
        Ok(self.slot(task_id).await?.state_tx.subscribe())
    }

    /// Wait until the task's state satisfies `done`, then return the task
    pub async fn wait_until(
        &self,
        task_id: &str,
        done: impl FnMut(&TaskState) -> bool,
    ) -> SDKResult<Task> {
        let mut rx = self.subscribe(task_id).await?;
        rx.wait_for(done)
            .await
            .map(|_| ())
            .map_err(|_| SDKError::invalid_operation("task engine dropped"))?;
        self.get(task_id)
            .await
            .ok_or_else(|| aatis_core::Error::TaskNotFound(task_id.to_string()).into())
    }

    /// Wait until the task reaches a terminal state
    pub async fn wait_terminal(&self, task_id: &str) -> SDKResult<Task> {
        self.wait_until(task_id, |s| s.is_terminal()).await
    }

    /// Load persisted tasks. Returns the number loaded.
    pub async fn load_from_db(&self) -> SDKResult<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let persisted = db.list_tasks(None, i64::MAX as usize)?;

        let mut tasks = self.tasks.write().await;
        let mut loaded = 0;
        for task in persisted {
            if tasks.contains_key(&task.id) {
                continue;
            }
            tasks.insert(task.id.clone(), TaskSlot::new(task));
            loaded += 1;
        }

        tracing::info!(loaded, "Loaded tasks");
        Ok(loaded)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    async fn slot(&self, task_id: &str) -> SDKResult<Arc<TaskSlot>> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| aatis_core::Error::TaskNotFound(task_id.to_string()).into())
    }

    async fn slots(&self) -> Vec<Arc<TaskSlot>> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Run `f` on a working copy of the task under its lock; the task is only
    /// updated, persisted and published when `f` succeeds
    async fn mutate<F>(&self, task_id: &str, f: F) -> SDKResult<Task>
    where
        F: FnOnce(&Self, &mut Task) -> SDKResult<()>,
    {
        let slot = self.slot(task_id).await?;
        let mut guard = slot.task.lock().await;
        let mut working = guard.clone();
        f(self, &mut working)?;

        if working != *guard {
            *guard = working;
            self.publish(&slot, &guard);
        }
        Ok(guard.clone())
    }

    /// Validate and apply one transition, appending its log entry
    fn step(
        &self,
        task: &mut Task,
        to: TaskState,
        actor: Actor,
        reason: Option<FailureReason>,
        detail: Option<String>,
    ) -> SDKResult<()> {
        let from = task.state;
        if let Err(message) = state::validate(task, to, &actor, reason.as_ref(), self.config.max_reroutes) {
            tracing::warn!(task_id = %task.id, %from, %to, %actor, %message, "Rejected task transition");
            return Err(SDKError::illegal_transition(&task.id, from, to, message));
        }

        let now = self.clock.now();
        let entry = TransitionEntry {
            seq: task.transitions.len() as u32 + 1,
            from,
            to,
            at: now,
            actor,
            reason: reason.clone(),
            detail,
        };

        task.state = to;
        task.updated_at = now;
        if to == TaskState::Failed {
            // a timeout under an assignment counts against the capability
            if matches!(reason, Some(FailureReason::Timeout)) {
                if let Some(capability) = &task.assigned_capability {
                    *task.capability_failures.entry(capability.clone()).or_insert(0) += 1;
                }
            }
            task.failure = reason;
        }

        let mut detail = format!("{} -> {}", from, to);
        if let Some(reason) = &entry.reason {
            detail.push_str(&format!(" ({})", reason));
        }
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(&task.id, AuditEventType::TaskTransition, entry.actor.to_string(), detail).at(now),
        );
        tracing::info!(task_id = %task.id, %from, %to, actor = %entry.actor, "Task transition");

        task.transitions.push(entry);
        Ok(())
    }

    fn publish(&self, slot: &TaskSlot, task: &Task) {
        self.persist(task);
        slot.state_tx.send_replace(task.state);
    }

    fn persist(&self, task: &Task) {
        if let Some(db) = &self.db {
            if let Err(e) = db.save_task(task) {
                tracing::error!(task_id = %task.id, error = %e, "Failed to persist task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use aatis_core::audit::MemoryAuditSink;

    fn engine() -> (TaskEngine, Arc<ManualClock>, Arc<MemoryAuditSink>) {
        let clock = Arc::new(ManualClock::default());
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = TaskEngine::new(TaskConfig::default())
            .with_clock(clock.clone())
            .with_audit(audit.clone());
        (engine, clock, audit)
    }

    async fn executing(engine: &TaskEngine) -> Task {
        let task = engine.create(NewTask::new("scan 10.0.0.5", ["scan"])).await.unwrap();
        engine.route(&task.id, "recon").await.unwrap();
        engine.dispatch(&task.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_log() {
        let (engine, _, audit) = engine();
        let task = executing(&engine).await;
        assert_eq!(task.state, TaskState::Executing);

        let done = engine
            .complete(&task.id, "recon", Some(MemoryId(7)), BTreeSet::from(["hosts".to_string()]))
            .await
            .unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.result_ref, Some(MemoryId(7)));

        let edges: Vec<_> = done.transitions.iter().map(|t| (t.seq, t.from, t.to)).collect();
        assert_eq!(
            edges,
            vec![
                (1, TaskState::Received, TaskState::Routed),
                (2, TaskState::Routed, TaskState::Dispatched),
                (3, TaskState::Dispatched, TaskState::Executing),
                (4, TaskState::Executing, TaskState::Completed),
            ]
        );
        assert_eq!(done.transitions[3].actor, Actor::Capability("recon".into()));
        assert_eq!(audit.events_of(AuditEventType::TaskTransition).len(), 4);
        assert_eq!(audit.events_of(AuditEventType::TaskCreated).len(), 1);
    }

    #[tokio::test]
    async fn test_illegal_transition_changes_nothing() {
        let (engine, _, _) = engine();
        let task = engine.create(NewTask::new("scan", ["scan"])).await.unwrap();

        let err = engine.dispatch(&task.id).await.unwrap_err();
        assert!(err.is_illegal_transition());

        let unchanged = engine.get(&task.id).await.unwrap();
        assert_eq!(unchanged.state, TaskState::Received);
        assert!(unchanged.transitions.is_empty());

        // the wrong capability cannot complete
        let task = executing(&engine).await;
        assert!(engine.complete(&task.id, "other", None, BTreeSet::new()).await.is_err());
        assert_eq!(engine.get(&task.id).await.unwrap().state, TaskState::Executing);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (engine, _, _) = engine();
        let task = executing(&engine).await;

        let first = engine.cancel(&task.id, "alice").await.unwrap();
        let second = engine.cancel(&task.id, "alice").await.unwrap();
        assert_eq!(first.state, TaskState::Failed);
        assert_eq!(first.failure, Some(FailureReason::Cancelled));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_escalation_reroutes_once() {
        let (engine, _, _) = engine();
        let task = engine.create(NewTask::new("masscan 10.0.0.0/8", ["scan"])).await.unwrap();
        engine.route(&task.id, "recon").await.unwrap();
        engine.escalate(&task.id, &["loud_scan".to_string()]).await.unwrap();

        let rerouted = engine.reroute(&task.id, "alice").await.unwrap();
        assert_eq!(rerouted.state, TaskState::Routed);
        assert_eq!(rerouted.reroutes, 1);

        engine.escalate(&task.id, &["loud_scan".to_string()]).await.unwrap();
        assert!(engine.reroute(&task.id, "alice").await.unwrap_err().is_illegal_transition());

        let failed = engine
            .fail(&task.id, FailureReason::EscalationRejected, Actor::Operator("alice".into()), None)
            .await
            .unwrap();
        assert_eq!(failed.failure, Some(FailureReason::EscalationRejected));
    }

    #[tokio::test]
    async fn test_timeouts() {
        let (engine, clock, _) = engine();
        let task = executing(&engine).await;
        let idle = engine.create(NewTask::new("idle", ["scan"])).await.unwrap();

        clock.advance(Duration::seconds(600));
        assert!(engine.check_timeouts().await.is_empty());

        clock.advance(Duration::seconds(1));
        assert_eq!(engine.check_timeouts().await, vec![task.id.clone()]);

        let failed = engine.get(&task.id).await.unwrap();
        assert_eq!(failed.failure, Some(FailureReason::Timeout));
        assert_eq!(failed.transitions.last().unwrap().actor, Actor::Engine);
        assert_eq!(engine.get(&idle.id).await.unwrap().state, TaskState::Received);
    }

    #[tokio::test]
    async fn test_timeouts_count_against_capability() {
        let (engine, clock, _) = engine();
        let task = executing(&engine).await;
        clock.advance(Duration::seconds(601));
        engine.check_timeouts().await;
        assert_eq!(engine.get(&task.id).await.unwrap().failures_for("recon"), 1);

        let retry = engine.create_retry(&task.id).await.unwrap();
        engine.route(&retry.id, "recon").await.unwrap();
        engine.dispatch(&retry.id).await.unwrap();
        let failed = engine
            .fail(&retry.id, FailureReason::Timeout, Actor::Engine, None)
            .await
            .unwrap();
        assert_eq!(failed.failures_for("recon"), 2);

        // other forced failures are not the capability's fault
        let cancelled = executing(&engine).await;
        let cancelled = engine.cancel(&cancelled.id, "alice").await.unwrap();
        assert_eq!(cancelled.failures_for("recon"), 0);
    }

    #[tokio::test]
    async fn test_retry_inherits_failures() {
        let (engine, _, _) = engine();
        let task = executing(&engine).await;
        engine.capability_failed(&task.id, "recon", "connection refused").await.unwrap();

        let retry = engine.create_retry(&task.id).await.unwrap();
        assert_eq!(retry.retry_of.as_deref(), Some(task.id.as_str()));
        assert_eq!(retry.failures_for("recon"), 1);
        assert_eq!(retry.state, TaskState::Received);

        // a live task cannot be retried
        assert!(engine.create_retry(&retry.id).await.is_err());
    }

    #[tokio::test]
    async fn test_archive_expired() {
        let (engine, clock, _) = engine();
        let done = executing(&engine).await;
        engine.complete(&done.id, "recon", None, BTreeSet::new()).await.unwrap();
        let live = engine.create(NewTask::new("live", ["scan"])).await.unwrap();

        let retention = Duration::days(7);
        assert!(engine.archive_expired(retention).await.is_empty());

        clock.advance(Duration::days(8));
        assert_eq!(engine.archive_expired(retention).await, vec![done.id.clone()]);
        assert_eq!(engine.get(&done.id).await.unwrap().state, TaskState::Archived);
        assert_eq!(engine.get(&live.id).await.unwrap().state, TaskState::Received);
    }

    #[tokio::test]
    async fn test_subscribe_sees_terminal_state() {
        let (engine, _, _) = engine();
        let engine = Arc::new(engine);
        let task = executing(&engine).await;

        let waiter = {
            let engine = engine.clone();
            let id = task.id.clone();
            tokio::spawn(async move { engine.wait_terminal(&id).await.unwrap() })
        };
        engine.complete(&task.id, "recon", None, BTreeSet::new()).await.unwrap();

        assert_eq!(waiter.await.unwrap().state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_concurrent_transitions_never_interleave() {
        let (engine, _, _) = engine();
        let engine = Arc::new(engine);
        let task = executing(&engine).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let engine = engine.clone();
            let id = task.id.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    engine.cancel(&id, "alice").await.is_ok()
                } else {
                    engine.complete(&id, "recon", None, BTreeSet::new()).await.is_ok()
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let task = engine.get(&task.id).await.unwrap();
        assert!(task.state.is_terminal());
        // exactly one terminal transition was accepted
        assert_eq!(task.transitions.len(), 4);
        let seqs: Vec<_> = task.transitions.iter().map(|t| t.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let engine = TaskEngine::new(TaskConfig::default()).with_db(db.clone());
        let task = engine.create(NewTask::new("scan", ["scan"])).await.unwrap();
        engine.route(&task.id, "recon").await.unwrap();

        assert_eq!(db.list_transitions(&task.id).unwrap().len(), 1);

        let reloaded = TaskEngine::new(TaskConfig::default()).with_db(db);
        assert_eq!(reloaded.load_from_db().await.unwrap(), 1);
        let task = reloaded.get(&task.id).await.unwrap();
        assert_eq!(task.state, TaskState::Routed);
        assert_eq!(task.assigned_capability.as_deref(), Some("recon"));
    }
}
