//! SDK Utilities
//!
//! Common utilities for the SDK.

mod hashing;
mod time;
mod validation;

pub use hashing::{content_hash, hash_bucket};
pub use time::{Clock, ManualClock, SystemClock, elapsed_since, now_utc};
pub use validation::{ValidationError, validate_id};
