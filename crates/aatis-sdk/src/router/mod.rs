//! Router Module
//!
//! Capability registry and the routing pipeline: select a capability by
//! tags, consult the constitution, dispatch, and apply completions.

mod pipeline;
mod registry;

pub use pipeline::{CompletionEvent, CompletionOutcome, Router};
pub use registry::{
    AgentCapability, CapabilityError, CapabilityOutput, CapabilityRegistry,
};
