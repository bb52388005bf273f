#![forbid(unsafe_code)]

//! Identifiers and the crate-wide error type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// CRC helpers used when framing persisted checkpoints.
pub mod checksum;

/// Opaque query identifier, stable for the lifetime of a query.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct QueryId(pub String);

/// Identifier of one task within a query.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TaskId(pub u64);

/// Logical query plus the concurrency slot (pool) it executes in.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct QueryKey {
    /// Query the key belongs to.
    pub query_id: QueryId,
    /// Executor pool the query is scheduled on.
    pub query_pool: String,
    /// Name of the query logic driving the query.
    pub query_logic: String,
}

/// Identifies one schedulable unit of query work.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct TaskKey {
    /// Task identifier, unique within the query.
    pub task_id: TaskId,
    /// Query key the task works on.
    pub query_key: QueryKey,
}

impl QueryId {
    /// Builds a query id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        QueryId(id.into())
    }

    /// Borrows the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl QueryKey {
    /// Builds a query key.
    pub fn new(
        query_id: QueryId,
        query_pool: impl Into<String>,
        query_logic: impl Into<String>,
    ) -> Self {
        Self {
            query_id,
            query_pool: query_pool.into(),
            query_logic: query_logic.into(),
        }
    }
}

impl TaskKey {
    /// Builds a task key.
    pub fn new(task_id: TaskId, query_key: QueryKey) -> Self {
        Self { task_id, query_key }
    }

    /// Query id of the owning query.
    pub fn query_id(&self) -> &QueryId {
        &self.query_key.query_id
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.query_pool, self.query_id, self.query_logic)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.query_key, self.task_id)
    }
}

impl From<&str> for QueryId {
    fn from(value: &str) -> Self {
        QueryId(value.to_owned())
    }
}

/// Errors surfaced by the execution core.
#[derive(thiserror::Error, Debug)]
pub enum CairnError {
    /// IO failure in a persistent store.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A collaborator is temporarily unavailable; the unit may be skipped.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Query logic failed to initialize or produce results.
    #[error("query logic: {0}")]
    Logic(String),
    /// A store rejected or failed an operation.
    #[error("store: {0}")]
    Store(String),
    /// A protocol or programming contract was broken.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// A persisted checkpoint failed validation.
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),
    /// No status record exists for the query.
    #[error("query {0} not found")]
    QueryNotFound(QueryId),
    /// No task exists under the key.
    #[error("task {0} not found")]
    TaskNotFound(TaskKey),
    /// A lifecycle state change that would move backwards or leave a terminal state.
    #[error("invalid query state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state name.
        from: &'static str,
        /// Requested state name.
        to: &'static str,
    },
    /// Bad configuration value or file.
    #[error("config: {0}")]
    Config(String),
}

impl CairnError {
    /// Whether the error must fail the query rather than skip a sub-unit.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CairnError::Unavailable(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CairnError>;
