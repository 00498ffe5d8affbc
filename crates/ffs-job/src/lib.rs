#![forbid(unsafe_code)]
//! Persisted remap jobs.
//!
//! A job record is the only durable artifact of a remap: the plan's move
//! list, its fingerprint, and double-buffered progress. Everything needed
//! to resume after a crash is reconstructed from the record alone.

pub mod record;
mod state;

pub use record::{JobHeader, JobStatus, ProgressSlot};
pub use state::{JobState, peek_progress, sibling_path};
