//! Resumable query execution core.
//!
//! Queries run as a chain of scheduled tasks: a `Create` task initializes the
//! query logic and either exhausts it or checkpoints, and each `Next` task
//! resumes from the stored checkpoint. Results flow through a per-query
//! queue to [`runner::NextCall`], which assembles bounded pages for clients.
//! [`iterators`] holds the sorted-stream cursors used by field-index scans.

#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod executor;
pub mod iterators;
pub mod logging;
pub mod logic;
pub mod metrics;
pub mod results;
pub mod runner;
pub mod status;
pub mod testing;
pub mod types;

pub use types::{CairnError, QueryId, QueryKey, Result, TaskId, TaskKey};
