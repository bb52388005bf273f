#![forbid(unsafe_code)]

//! Per-query lifecycle records and the store that owns them.
//!
//! Callers never hold a mutable reference to a [`QueryStatus`]; they read
//! snapshots through [`QueryStatusStore::get`] and mutate only through
//! [`QueryStatusStore::update`], which bumps the record version and enforces
//! forward-only lifecycle transitions.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{CairnError, QueryId, QueryKey, Result};

/// Lifecycle state of a query.
///
/// Ordered: `Defined < Created < Running < Closed`, with `Failed` terminal and
/// reachable from every non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueryState {
    /// Query persisted, nothing executed yet.
    Defined,
    /// Logic initialized and plan recorded.
    Created,
    /// At least one resumed task has produced results.
    Running,
    /// Closed by the client or after completion.
    Closed,
    /// Failed with a recorded error.
    Failed,
}

impl QueryState {
    /// Stable name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            QueryState::Defined => "DEFINED",
            QueryState::Created => "CREATED",
            QueryState::Running => "RUNNING",
            QueryState::Closed => "CLOSED",
            QueryState::Failed => "FAILED",
        }
    }

    /// Whether no further transitions are allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryState::Closed | QueryState::Failed)
    }

    /// Whether `self -> next` is a legal transition. Re-asserting the
    /// current non-terminal state is allowed.
    pub fn can_transition_to(self, next: QueryState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next >= self
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The query definition as submitted by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Name of the logic that evaluates the query.
    pub logic_name: String,
    /// Query text handed to the logic.
    pub query_string: String,
    /// Requested results per page.
    pub page_size: usize,
    /// Caller-supplied max results; authoritative over the logic default when set.
    pub max_results_override: Option<i64>,
    /// Distinguished names of the caller's identity chain.
    pub dn_list: Vec<String>,
    /// Distinguished name of the caller.
    pub user_dn: String,
}

impl Query {
    /// Query with a page size of 10 and no override.
    pub fn new(logic_name: impl Into<String>, query_string: impl Into<String>) -> Self {
        Self {
            logic_name: logic_name.into(),
            query_string: query_string.into(),
            page_size: 10,
            max_results_override: None,
            dn_list: Vec::new(),
            user_dn: String::new(),
        }
    }

    /// Sets the caller page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets a caller result limit that replaces the logic's.
    pub fn with_max_results_override(mut self, max_results: i64) -> Self {
        self.max_results_override = Some(max_results);
        self
    }

    /// Sets the caller identity.
    pub fn with_user(mut self, user_dn: impl Into<String>, dn_list: Vec<String>) -> Self {
        self.user_dn = user_dn.into();
        self.dn_list = dn_list;
        self
    }
}

/// Store-owned lifecycle record for one query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryStatus {
    /// Identity of the query.
    pub query_key: QueryKey,
    /// Lifecycle state.
    pub state: QueryState,
    /// The query as submitted.
    pub query: Query,
    /// Authorizations resolved for the caller.
    pub calculated_auths: Vec<String>,
    /// Execution plan generated by the logic.
    pub plan: Option<String>,
    /// Service that defined the query, notified on creation.
    pub origin_service: Option<String>,
    /// Wall-clock millis of the last mutation.
    pub last_updated_millis: u64,
    /// Results already handed out across all pages.
    pub num_results_returned: u64,
    /// Error text once the query failed.
    pub failure: Option<String>,
    /// Incremented on every store mutation.
    pub version: u64,
}

impl QueryStatus {
    /// Fresh `Defined` record.
    pub fn new(query_key: QueryKey, query: Query) -> Self {
        Self {
            query_key,
            state: QueryState::Defined,
            query,
            calculated_auths: Vec::new(),
            plan: None,
            origin_service: None,
            last_updated_millis: now_millis(),
            num_results_returned: 0,
            failure: None,
            version: 0,
        }
    }

    /// Sets the resolved authorizations.
    pub fn with_auths(mut self, auths: Vec<String>) -> Self {
        self.calculated_auths = auths;
        self
    }

    /// Sets the service notified on creation.
    pub fn with_origin(mut self, origin_service: impl Into<String>) -> Self {
        self.origin_service = Some(origin_service.into());
        self
    }

    /// Query this belongs to.
    pub fn query_id(&self) -> &QueryId {
        &self.query_key.query_id
    }

    /// Moves to `next`, rejecting backward or post-terminal moves.
    pub fn transition(&mut self, next: QueryState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CairnError::InvalidTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Mutation applied inside [`QueryStatusStore::update`].
pub type StatusUpdate<'a> = &'a mut dyn FnMut(&mut QueryStatus) -> Result<()>;

/// Owner of all query status records.
pub trait QueryStatusStore: Send + Sync {
    /// Persists a new record. Fails if the query already exists.
    fn create(&self, status: QueryStatus) -> Result<()>;

    /// Snapshot of the current record.
    fn get(&self, query_id: &QueryId) -> Result<QueryStatus>;

    /// Applies `update` atomically and returns the new snapshot. The record
    /// is left untouched when `update` fails.
    fn update(&self, query_id: &QueryId, update: StatusUpdate<'_>) -> Result<QueryStatus>;

    /// Marks the query failed with the causing error. Queries already in a
    /// terminal state keep their state and original error.
    fn update_failed_status(&self, query_id: &QueryId, error: &CairnError) -> Result<()> {
        let message = error.to_string();
        self.update(query_id, &mut |status| {
            if status.state.is_terminal() {
                return Ok(());
            }
            status.state = QueryState::Failed;
            status.failure = Some(message.clone());
            Ok(())
        })
        .map(|_| ())
    }

    /// Records the plan produced by query logic initialization.
    fn set_plan(&self, query_id: &QueryId, plan: &str) -> Result<QueryStatus> {
        self.update(query_id, &mut |status| {
            status.plan = Some(plan.to_owned());
            Ok(())
        })
    }

    /// Moves the query to `state`.
    fn set_state(&self, query_id: &QueryId, state: QueryState) -> Result<QueryStatus> {
        self.update(query_id, &mut |status| status.transition(state))
    }

    /// Adds `count` to the results-returned counter.
    fn add_results_returned(&self, query_id: &QueryId, count: u64) -> Result<QueryStatus> {
        self.update(query_id, &mut |status| {
            status.num_results_returned = status.num_results_returned.saturating_add(count);
            Ok(())
        })
    }
}

/// In-process status store.
#[derive(Default)]
pub struct InMemoryQueryStatusStore {
    records: RwLock<HashMap<QueryId, QueryStatus>>,
}

impl InMemoryQueryStatusStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueryStatusStore for InMemoryQueryStatusStore {
    fn create(&self, status: QueryStatus) -> Result<()> {
        let mut records = self.records.write();
        let id = status.query_id().clone();
        if records.contains_key(&id) {
            return Err(CairnError::Store(format!("query {id} already exists")));
        }
        debug!(query_id = %id, "status.create");
        records.insert(id, status);
        Ok(())
    }

    fn get(&self, query_id: &QueryId) -> Result<QueryStatus> {
        self.records
            .read()
            .get(query_id)
            .cloned()
            .ok_or_else(|| CairnError::QueryNotFound(query_id.clone()))
    }

    fn update(&self, query_id: &QueryId, update: StatusUpdate<'_>) -> Result<QueryStatus> {
        let mut records = self.records.write();
        let current = records
            .get_mut(query_id)
            .ok_or_else(|| CairnError::QueryNotFound(query_id.clone()))?;
        let mut next = current.clone();
        if let Err(err) = update(&mut next) {
            warn!(query_id = %query_id, error = %err, "status.update.rejected");
            return Err(err);
        }
        next.version = current.version + 1;
        next.last_updated_millis = now_millis();
        *current = next.clone();
        Ok(next)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
