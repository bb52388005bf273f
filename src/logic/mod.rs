#![forbid(unsafe_code)]

//! Contracts for pluggable query computations.
//!
//! A [`QueryLogic`] is initialized against a data-store connection, produces
//! a plan, and then yields a finite, lazy sequence of results. Logics that
//! can suspend and resume expose the [`CheckpointableQueryLogic`] capability
//! through [`QueryLogic::as_checkpointable`]; callers check for the
//! capability rather than the concrete type.

use crate::checkpoint::QueryCheckpoint;
use crate::status::Query;
use crate::types::{QueryKey, Result};

/// One produced result item.
pub type Payload = serde_json::Value;

/// Handle to the backing data store, supplied by the worker.
pub trait Connector: Send + Sync {
    /// Name of the store instance, for logging.
    fn instance(&self) -> &str;
}

/// Configuration produced by [`QueryLogic::initialize`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenericQueryConfiguration {
    /// Execution plan; recorded on the query status.
    pub query_string: String,
    /// Authorizations the plan was generated under.
    pub authorizations: Vec<String>,
}

/// Page and work limits declared by a logic. Negative values (and a zero byte
/// trigger) disable the corresponding check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogicLimits {
    /// Largest page the logic allows.
    pub max_page_size: usize,
    /// Accumulated page bytes that end a page early.
    pub page_byte_trigger: u64,
    /// Iterations plus seeks allowed per page.
    pub max_work: i64,
    /// Results a query may return over its lifetime.
    pub max_results: i64,
}

impl Default for LogicLimits {
    fn default() -> Self {
        Self {
            max_page_size: 0,
            page_byte_trigger: 0,
            max_work: -1,
            max_results: -1,
        }
    }
}

/// A pluggable query computation.
pub trait QueryLogic: Send {
    /// Prepares the logic and returns its configuration (including the plan).
    fn initialize(
        &mut self,
        connector: &dyn Connector,
        query: &Query,
        authorizations: &[String],
    ) -> Result<GenericQueryConfiguration>;

    /// Logic-specific setup once the plan is recorded.
    fn setup_query(&mut self, config: &GenericQueryConfiguration) -> Result<()>;

    /// Pulls the next result; `None` once exhausted.
    fn try_next(&mut self) -> Result<Option<Payload>>;

    /// Limits applied by page assembly.
    fn limits(&self) -> LogicLimits;

    /// Max results for a caller identified by `dn_list`. Logics with
    /// per-identity limits override this.
    fn result_limit(&self, _dn_list: &[String]) -> i64 {
        self.limits().max_results
    }

    /// The checkpoint capability, if the logic has one.
    fn as_checkpointable(&mut self) -> Option<&mut dyn CheckpointableQueryLogic> {
        None
    }
}

/// Capability of a logic that can suspend after partial progress.
pub trait CheckpointableQueryLogic: QueryLogic {
    /// Whether checkpointing is enabled for this instance.
    fn is_checkpointable(&self) -> bool;

    /// Reconstitutes state from a checkpoint instead of `initialize`.
    fn setup_from_checkpoint(
        &mut self,
        connector: &dyn Connector,
        checkpoint: &QueryCheckpoint,
    ) -> Result<()>;

    /// Captures the remaining work.
    fn checkpoint(&mut self, query_key: &QueryKey) -> Result<QueryCheckpoint>;

    /// Refreshes an existing checkpoint with the logic's current position.
    fn update_checkpoint(&mut self, checkpoint: QueryCheckpoint) -> Result<QueryCheckpoint> {
        let query_key = checkpoint.query_key().clone();
        self.checkpoint(&query_key)
    }
}

/// Resolves logic instances by name.
pub trait QueryLogicFactory: Send + Sync {
    /// Creates a fresh logic instance for `name`.
    fn query_logic(&self, name: &str) -> Result<Box<dyn QueryLogic>>;
}

impl<F> QueryLogicFactory for F
where
    F: Fn(&str) -> Result<Box<dyn QueryLogic>> + Send + Sync,
{
    fn query_logic(&self, name: &str) -> Result<Box<dyn QueryLogic>> {
        self(name)
    }
}
