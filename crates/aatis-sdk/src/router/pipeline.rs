//! Router
//!
//! Drives tasks through selection, gating and dispatch. Invocations run as
//! spawned tokio tasks bounded by the execution timeout; their results come
//! back as [`CompletionEvent`]s over an mpsc channel and are applied by a
//! single completion loop, so the task engine stays the only mutator of task
//! state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::AbortHandle;

use aatis_core::types::{
    Actor, CapabilityDescriptor, FailureReason, MemoryTier, NewTask, PolicyVerdict, Provenance,
    Task, TaskState, VerdictOutcome,
};

use super::registry::{AgentCapability, CapabilityError, CapabilityOutput, CapabilityRegistry};
use crate::config::RouterConfig;
use crate::constitution::{ConstitutionGate, ProposedAction};
use crate::memory::TieredMemory;
use crate::tasks::TaskEngine;
use crate::{SDKError, SDKResult};

/// Result of one invocation, reported back to the router
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub task_id: String,
    pub capability: String,
    pub outcome: CompletionOutcome,
}

#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Succeeded(CapabilityOutput),
    Failed(CapabilityError),
    TimedOut,
}

/// Capability-based task router
pub struct Router {
    engine: Arc<TaskEngine>,
    gate: Arc<ConstitutionGate>,
    memory: Arc<TieredMemory>,
    registry: Arc<CapabilityRegistry>,
    config: RouterConfig,
    execution_timeout: Duration,
    completion_tx: mpsc::Sender<CompletionEvent>,
    completion_rx: Mutex<Option<mpsc::Receiver<CompletionEvent>>>,
    in_flight: Mutex<HashMap<String, AbortHandle>>,
}

impl Router {
    pub fn new(
        engine: Arc<TaskEngine>,
        gate: Arc<ConstitutionGate>,
        memory: Arc<TieredMemory>,
        registry: Arc<CapabilityRegistry>,
        config: RouterConfig,
    ) -> Self {
        let execution_timeout = Duration::from_secs(engine.config().execution_timeout_secs);
        let (completion_tx, completion_rx) = mpsc::channel(config.completion_channel_capacity.max(1));
        Self {
            engine,
            gate,
            memory,
            registry,
            config,
            execution_timeout,
            completion_tx,
            completion_rx: Mutex::new(Some(completion_rx)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Bound each invocation by `timeout` instead of the engine's execution
    /// timeout
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pipeline
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a task and run it through selection, gating and dispatch.
    ///
    /// Returns the task as it stands once the pipeline hands off to the
    /// capability (or stops at a failure or escalation).
    pub async fn submit(&self, input: NewTask) -> SDKResult<Task> {
        let task = self.engine.create(input).await?;
        self.advance(&task.id).await
    }

    /// Run a Received or Routed task up to dispatch
    async fn advance(&self, task_id: &str) -> SDKResult<Task> {
        let task = self.get_task(task_id).await?;
        let excluded = self.excluded_capabilities(&task);

        let task = match task.state {
            TaskState::Received => match self.registry.select(&task.required_tags, &excluded).await {
                Some(capability) => self.engine.route(task_id, &capability.name).await?,
                None => return self.fail_no_capability(&task).await,
            },
            TaskState::Routed => {
                let keep = match task.assigned_capability.as_deref() {
                    Some(name) => {
                        !excluded.contains(name) && self.registry.handler(name).await.is_some()
                    }
                    None => false,
                };
                if keep {
                    task
                } else {
                    match self.registry.select(&task.required_tags, &excluded).await {
                        Some(capability) => self.engine.reassign(task_id, &capability.name).await?,
                        None => return self.fail_no_capability(&task).await,
                    }
                }
            }
            other => {
                return Err(SDKError::invalid_operation(format!(
                    "task {} is {}, nothing to route",
                    task_id, other
                )));
            }
        };

        let context = self.memory_context(&task.request).await;
        let verdict = self.gate.check(
            Some(&task),
            &ProposedAction::dispatch(&task),
            &context,
            task.reroutes > 0,
        );
        if let Some(task) = self.apply_verdict(&task, verdict).await? {
            return Ok(task);
        }

        let Some(capability) = task.assigned_capability.clone() else {
            return self.fail_no_capability(&task).await;
        };
        let Some(handler) = self.registry.handler(&capability).await else {
            // deregistered or marked unhealthy since routing
            return self.fail_no_capability(&task).await;
        };

        // Held from dispatch until the invocation is tracked, so a cancel
        // that lands in between still finds the handle to abort
        let mut in_flight = self.in_flight.lock().await;
        let task = self.engine.dispatch(task_id).await?;
        let handle = self.spawn_invocation(&task, capability, handler);
        in_flight.insert(task.id.clone(), handle);
        Ok(task)
    }

    /// Record a verdict on the task and apply Deny / Escalate. Returns the
    /// updated task when the verdict stopped the pipeline.
    async fn apply_verdict(&self, task: &Task, verdict: PolicyVerdict) -> SDKResult<Option<Task>> {
        let outcome = verdict.outcome;
        let rules = verdict.violated_rules.clone();
        self.engine.record_verdict(&task.id, verdict).await?;

        match outcome {
            VerdictOutcome::Allow => Ok(None),
            VerdictOutcome::Deny => {
                let task = self
                    .engine
                    .fail(&task.id, FailureReason::PolicyDenied { rules }, Actor::Constitution, None)
                    .await?;
                Ok(Some(task))
            }
            VerdictOutcome::Escalate => Ok(Some(self.engine.escalate(&task.id, &rules).await?)),
        }
    }

    async fn fail_no_capability(&self, task: &Task) -> SDKResult<Task> {
        let tags: Vec<_> = task.required_tags.iter().cloned().collect();
        tracing::warn!(task_id = %task.id, tags = ?tags, "No capability for task");
        self.engine
            .fail(
                &task.id,
                FailureReason::NoCapability,
                Actor::Router,
                Some(format!("tags=[{}]", tags.join(","))),
            )
            .await
    }

    fn spawn_invocation(
        &self,
        task: &Task,
        capability: String,
        handler: Arc<dyn AgentCapability>,
    ) -> AbortHandle {
        let tx = self.completion_tx.clone();
        let timeout = self.execution_timeout;
        let snapshot = task.clone();

        tracing::info!(task_id = %task.id, capability = %capability, "Task dispatched");

        let handle = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, handler.invoke(&snapshot)).await {
                Ok(Ok(output)) => CompletionOutcome::Succeeded(output),
                Ok(Err(error)) => CompletionOutcome::Failed(error),
                Err(_) => CompletionOutcome::TimedOut,
            };
            let event = CompletionEvent {
                task_id: snapshot.id.clone(),
                capability,
                outcome,
            };
            if tx.send(event).await.is_err() {
                tracing::warn!(task_id = %snapshot.id, "Completion channel closed");
            }
        });
        handle.abort_handle()
    }

    /// Texts of the records most similar to `text`, for rule evaluation.
    /// Access statistics are left untouched.
    async fn memory_context(&self, text: &str) -> Vec<String> {
        if self.config.memory_context_size == 0 {
            return Vec::new();
        }
        match self.memory.peek(text, None, self.config.memory_context_size).await {
            Ok(hits) => hits.into_iter().map(|h| h.record.source_text).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Memory context unavailable");
                Vec::new()
            }
        }
    }

    fn excluded_capabilities(&self, task: &Task) -> BTreeSet<String> {
        let limit = self.engine.config().capability_failure_limit;
        task.capability_failures
            .iter()
            .filter(|(_, count)| **count >= limit)
            .map(|(name, _)| name.clone())
            .collect()
    }

    async fn get_task(&self, task_id: &str) -> SDKResult<Task> {
        self.engine
            .get(task_id)
            .await
            .ok_or_else(|| aatis_core::Error::TaskNotFound(task_id.to_string()).into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Completions
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply one completion event. Events for tasks that are no longer
    /// executing under the reporting capability are ignored.
    pub async fn handle_completion(&self, event: CompletionEvent) -> SDKResult<Option<Task>> {
        self.in_flight.lock().await.remove(&event.task_id);

        let Some(task) = self.engine.get(&event.task_id).await else {
            tracing::warn!(task_id = %event.task_id, "Completion for unknown task");
            return Ok(None);
        };
        if task.state != TaskState::Executing
            || task.assigned_capability.as_deref() != Some(event.capability.as_str())
        {
            tracing::warn!(
                task_id = %task.id,
                state = %task.state,
                capability = %event.capability,
                "Ignoring late completion"
            );
            return Ok(None);
        }

        let task = match event.outcome {
            CompletionOutcome::Succeeded(output) => {
                self.store_result(&task, &event.capability, output).await?
            }
            CompletionOutcome::Failed(error) => {
                tracing::warn!(task_id = %task.id, capability = %event.capability, error = %error, "Capability failed");
                self.engine
                    .capability_failed(&task.id, &event.capability, &error.message)
                    .await?
            }
            CompletionOutcome::TimedOut => {
                self.engine
                    .fail(
                        &task.id,
                        FailureReason::Timeout,
                        Actor::Engine,
                        Some(format!("no completion within {}ms", self.execution_timeout.as_millis())),
                    )
                    .await?
            }
        };
        Ok(Some(task))
    }

    /// Gate the result as a memory write, store it in STM and complete the
    /// task with the record as its result reference
    async fn store_result(
        &self,
        task: &Task,
        capability: &str,
        output: CapabilityOutput,
    ) -> SDKResult<Task> {
        let context = self.memory_context(&output.result).await;
        let verdict = self.gate.check(
            Some(task),
            &ProposedAction::memory_write(&output.result),
            &context,
            task.reroutes > 0,
        );
        if let Some(task) = self.apply_verdict(task, verdict).await? {
            return Ok(task);
        }

        let result_ref = match self
            .memory
            .remember(&output.result, Provenance::task(capability, &task.id), MemoryTier::ShortTerm)
            .await
        {
            Ok(record) => Some(record.id),
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Failed to store capability result");
                None
            }
        };

        let completed = self
            .engine
            .complete(&task.id, capability, result_ref, output.output_tags)
            .await;
        if completed.is_err() {
            // cancelled or timed out while the result was being stored
            if let Some(id) = result_ref {
                if let Err(e) = self.memory.evict(id, "task no longer executing").await {
                    tracing::warn!(task_id = %task.id, error = %e, "Failed to drop orphaned result");
                }
            }
        }
        completed
    }

    /// Apply completion events until `shutdown` flips to true or every sender
    /// is gone
    pub async fn run_completion_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut rx) = self.completion_rx.lock().await.take() else {
            tracing::warn!("Completion loop already running");
            return;
        };
        tracing::debug!("Completion loop started");

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let task_id = event.task_id.clone();
                    if let Err(e) = self.handle_completion(event).await {
                        tracing::warn!(task_id = %task_id, error = %e, "Failed to apply completion");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        *self.completion_rx.lock().await = Some(rx);
        tracing::debug!("Completion loop stopped");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operator Actions
    // ─────────────────────────────────────────────────────────────────────────

    /// Cancel a task, aborting its in-flight invocation. Idempotent on
    /// terminal tasks.
    pub async fn cancel(&self, task_id: &str, requested_by: &str) -> SDKResult<Task> {
        // Fail first: a dispatch that has not happened yet is then rejected,
        // and one that has already happened is tracked in `in_flight`
        let task = self.engine.cancel(task_id, requested_by).await?;
        let handle = self.in_flight.lock().await.remove(task_id);
        if let Some(handle) = handle {
            handle.abort();
            tracing::debug!(task_id, "Aborted in-flight invocation");
        }
        Ok(task)
    }

    /// Approve or reject an escalated task.
    ///
    /// An approval sends the task back to `Routed` and re-runs the pipeline
    /// with the operator override active; only one approval is allowed per
    /// task, after that the task fails with `EscalationRejected`.
    pub async fn resolve_escalation(
        &self,
        task_id: &str,
        approve: bool,
        reviewer: &str,
    ) -> SDKResult<Task> {
        let task = self.get_task(task_id).await?;
        if task.state != TaskState::Escalated {
            return Err(SDKError::invalid_operation(format!(
                "task {} is {}, not escalated",
                task_id, task.state
            )));
        }

        let operator = Actor::Operator(reviewer.to_string());
        if !approve {
            tracing::info!(task_id, reviewer, "Escalation rejected");
            return self
                .engine
                .fail(task_id, FailureReason::EscalationRejected, operator, Some("rejected".into()))
                .await;
        }
        if task.reroutes >= self.engine.config().max_reroutes {
            tracing::info!(task_id, reviewer, "Escalation budget spent");
            return self
                .engine
                .fail(
                    task_id,
                    FailureReason::EscalationRejected,
                    operator,
                    Some("re-route budget spent".into()),
                )
                .await;
        }

        tracing::info!(task_id, reviewer, "Escalation approved");
        self.engine.reroute(task_id, reviewer).await?;
        self.advance(task_id).await
    }

    /// Retry a failed task as a new task
    pub async fn retry(&self, task_id: &str) -> SDKResult<Task> {
        let task = self.engine.create_retry(task_id).await?;
        self.advance(&task.id).await
    }

    /// Fail tasks stuck past the execution timeout and abort their
    /// invocations. Returns the ids of the failed tasks.
    pub async fn enforce_timeouts(&self) -> Vec<String> {
        let failed = self.engine.check_timeouts().await;
        if !failed.is_empty() {
            let mut in_flight = self.in_flight.lock().await;
            for id in &failed {
                if let Some(handle) = in_flight.remove(id) {
                    handle.abort();
                }
            }
        }
        failed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Capabilities
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a capability after checking it against the constitution
    pub async fn register_capability(
        &self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn AgentCapability>,
    ) -> SDKResult<u64> {
        self.gated_registration(descriptor, handler, false).await
    }

    /// Register a capability an operator reviewed. Core rules cannot escalate
    /// it; hard rules still apply.
    pub async fn register_reviewed_capability(
        &self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn AgentCapability>,
        reviewer: &str,
    ) -> SDKResult<u64> {
        tracing::info!(capability = %descriptor.name, reviewer, "Reviewed capability registration");
        self.gated_registration(descriptor, handler, true).await
    }

    async fn gated_registration(
        &self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn AgentCapability>,
        override_active: bool,
    ) -> SDKResult<u64> {
        let verdict = self.gate.check(
            None,
            &ProposedAction::capability_registration(&descriptor),
            &[],
            override_active,
        );
        match verdict.outcome {
            VerdictOutcome::Allow => self.registry.register(descriptor, handler).await,
            VerdictOutcome::Deny => Err(SDKError::PolicyDenied {
                rules: verdict.violated_rules,
            }),
            VerdictOutcome::Escalate => Err(SDKError::PolicyEscalated {
                rules: verdict.violated_rules,
            }),
        }
    }

    pub async fn deregister_capability(&self, name: &str) -> SDKResult<CapabilityDescriptor> {
        self.registry.deregister(name).await
    }

    pub async fn set_health(&self, name: &str, healthy: bool) -> SDKResult<()> {
        self.registry.set_health(name, healthy).await
    }
}
