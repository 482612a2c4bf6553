//! Command implementations for the aatis CLI.
//!
//! Each submodule implements the logic for a command group.

pub mod audit;
pub mod capability;
pub mod doctor;
pub mod maintain;
pub mod memory;
pub mod rules;
pub mod status;
pub mod task;
