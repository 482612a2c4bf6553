//! Transition table of the task lifecycle.
//!
//! ```text
//! Received -> Routed -> Dispatched -> Executing -> Completed | Failed
//!                 ^                                     |
//!                 '---- Escalated <--- (any non-terminal)
//! Completed | Failed -> Archived
//! ```
//!
//! Each edge has exactly one authority. Forced failures carry a typed reason
//! and are only accepted from the states listed for that reason.

use aatis_core::types::{Actor, FailureReason, Task, TaskState};

/// Check whether `actor` may move `task` to `to`.
///
/// Returns a human-readable reason when the transition is refused.
pub fn validate(
    task: &Task,
    to: TaskState,
    actor: &Actor,
    reason: Option<&FailureReason>,
    max_reroutes: u32,
) -> Result<(), String> {
    use TaskState::*;

    let from = task.state;
    if from == Archived {
        return Err("archived tasks are immutable".into());
    }
    if from.is_terminal() && to != Archived {
        return Err(format!("task is already {}", from));
    }

    match to {
        Received => Err("no transition re-enters received".into()),

        Routed => match (from, actor) {
            (Received, Actor::Router) => Ok(()),
            (Escalated, Actor::Operator(_)) if task.reroutes < max_reroutes => Ok(()),
            (Escalated, Actor::Operator(_)) => {
                Err(format!("escalation already re-routed {} time(s)", task.reroutes))
            }
            (Received | Escalated, _) => Err(format!("{} cannot route", actor)),
            _ => Err("only received or escalated tasks can be routed".into()),
        },

        Dispatched => match (from, actor) {
            (Routed, Actor::Router) => Ok(()),
            (Routed, _) => Err(format!("{} cannot dispatch", actor)),
            _ => Err("only routed tasks can be dispatched".into()),
        },

        Executing => match (from, actor) {
            (Dispatched, Actor::Router) => Ok(()),
            (Dispatched, _) => Err(format!("{} cannot start execution", actor)),
            _ => Err("only dispatched tasks can start executing".into()),
        },

        Completed => {
            if from != Executing {
                return Err("only executing tasks can complete".into());
            }
            assigned_capability(task, actor)
        }

        Escalated => match (from, actor) {
            (Escalated, _) => Err("task is already escalated".into()),
            (_, Actor::Constitution) => Ok(()),
            _ => Err(format!("{} cannot escalate", actor)),
        },

        Archived => match (from, actor) {
            (Completed | Failed, Actor::Engine | Actor::Operator(_)) => Ok(()),
            (Completed | Failed, _) => Err(format!("{} cannot archive", actor)),
            _ => Err("only completed or failed tasks can be archived".into()),
        },

        Failed => {
            let Some(reason) = reason else {
                return Err("a failure needs a reason".into());
            };
            validate_failure(task, actor, reason)
        }
    }
}

fn validate_failure(task: &Task, actor: &Actor, reason: &FailureReason) -> Result<(), String> {
    use TaskState::*;

    let from = task.state;
    let (allowed_from, authority_ok): (&[TaskState], bool) = match reason {
        FailureReason::NoCapability => (&[Received, Routed], matches!(actor, Actor::Router)),
        FailureReason::PolicyDenied { .. } => (
            &[Received, Routed, Dispatched, Executing, Escalated],
            matches!(actor, Actor::Constitution),
        ),
        FailureReason::Timeout => (&[Dispatched, Executing], matches!(actor, Actor::Engine)),
        FailureReason::Cancelled => (
            &[Received, Routed, Dispatched, Executing, Escalated],
            matches!(actor, Actor::Operator(_) | Actor::Router),
        ),
        FailureReason::EscalationRejected => (&[Escalated], matches!(actor, Actor::Operator(_))),
        FailureReason::CapabilityError { capability, .. } => {
            if from != Executing {
                return Err("only executing tasks can report a capability error".into());
            }
            if task.assigned_capability.as_deref() != Some(capability.as_str()) {
                return Err(format!("{} is not the assigned capability", capability));
            }
            return assigned_capability(task, actor);
        }
    };

    if !allowed_from.contains(&from) {
        return Err(format!("{} failure is not allowed from {}", reason.as_str(), from));
    }
    if !authority_ok {
        return Err(format!("{} cannot force a {} failure", actor, reason.as_str()));
    }
    Ok(())
}

/// Only the capability a task was dispatched to may finish it
fn assigned_capability(task: &Task, actor: &Actor) -> Result<(), String> {
    match actor {
        Actor::Capability(name) if task.assigned_capability.as_deref() == Some(name.as_str()) => {
            Ok(())
        }
        _ => Err(format!("{} is not the assigned capability", actor)),
    }
}

/// Whether `from -> to` is an edge of the lifecycle graph, ignoring
/// authority and reason
pub fn is_lifecycle_edge(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Received, Routed)
            | (Routed, Dispatched)
            | (Dispatched, Executing)
            | (Executing, Completed)
            | (Escalated, Routed)
            | (Completed | Failed, Archived)
            | (Received | Routed | Dispatched | Executing, Escalated)
            | (Received | Routed | Dispatched | Executing | Escalated, Failed)
    )
}
