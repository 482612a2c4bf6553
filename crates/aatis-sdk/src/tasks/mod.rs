//! Task Module
//!
//! Lifecycle of units of work: the transition table and the engine that
//! applies it.

mod engine;
pub mod state;

pub use engine::TaskEngine;
pub use state::is_lifecycle_edge;
