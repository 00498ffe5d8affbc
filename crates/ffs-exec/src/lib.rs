#![forbid(unsafe_code)]
//! Plan execution.
//!
//! [`Executor`] drains a persisted job move by move: read source, write
//! destination, flush, optionally verify, then record progress. Progress
//! is recorded only after the destination is durable, so a crash at any
//! point leaves the job resumable by redoing at most one move.
//!
//! [`Remapper`] is the single entry point surrounding tooling calls: it
//! plans, creates or resumes the job record, executes, and archives.

mod executor;
mod progress;
mod remapper;

pub use executor::{ExecOptions, Executor, RunOutcome, RunSummary};
pub use progress::{ProgressMeter, ProgressReport};
pub use remapper::{Remapper, RemapperConfig};
