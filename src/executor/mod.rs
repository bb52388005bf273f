#![forbid(unsafe_code)]

//! Task execution: the `Create`/`Next` state machine and its entry point.
//!
//! A worker pulls a task key from the external scheduler and calls
//! [`QueryExecutor::handle`]. The executor loads the task (and its
//! checkpoint), loads the query status, dispatches on the action tag and
//! removes the task once handled. Checkpointed work is re-enqueued as a new
//! `Next` task in the task store.

mod action;

use std::sync::Arc;

use tracing::{error, info, warn};

pub use action::{ExecutorAction, TaskOutcome};

use crate::checkpoint::QueryTaskStore;
use crate::config::QueryProperties;
use crate::logic::{Connector, QueryLogicFactory};
use crate::metrics::{MetricSink, NoopMetricSink, NoopOriginNotifier, OriginNotifier};
use crate::results::ResultQueueManager;
use crate::status::QueryStatusStore;
use crate::types::{CairnError, Result, TaskKey};

/// Collaborators shared by every task execution.
#[derive(Clone)]
pub struct ExecutorContext {
    /// Executor bounds and timing.
    pub properties: QueryProperties,
    /// Source of truth for query lifecycle state.
    pub status_store: Arc<dyn QueryStatusStore>,
    /// Where tasks and their checkpoints live.
    pub task_store: Arc<dyn QueryTaskStore>,
    /// Builds a fresh logic per task.
    pub logic_factory: Arc<dyn QueryLogicFactory>,
    /// Per-query result queues.
    pub results: Arc<ResultQueueManager>,
    /// Best-effort metric destination.
    pub metric_sink: Arc<dyn MetricSink>,
    /// Best-effort creation callback.
    pub origin_notifier: Arc<dyn OriginNotifier>,
}

impl ExecutorContext {
    /// Context with default properties and no-op side channels.
    pub fn new(
        status_store: Arc<dyn QueryStatusStore>,
        task_store: Arc<dyn QueryTaskStore>,
        logic_factory: Arc<dyn QueryLogicFactory>,
        results: Arc<ResultQueueManager>,
    ) -> Self {
        Self {
            properties: QueryProperties::default(),
            status_store,
            task_store,
            logic_factory,
            results,
            metric_sink: Arc::new(NoopMetricSink),
            origin_notifier: Arc::new(NoopOriginNotifier),
        }
    }

    /// Sets the properties.
    pub fn properties(mut self, properties: QueryProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Sets the metric sink.
    pub fn metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Sets the origin notifier.
    pub fn origin_notifier(mut self, notifier: Arc<dyn OriginNotifier>) -> Self {
        self.origin_notifier = notifier;
        self
    }
}

/// Worker-side entry point for dispatched tasks.
pub struct QueryExecutor {
    ctx: ExecutorContext,
}

impl QueryExecutor {
    /// Executor over `ctx`.
    pub fn new(ctx: ExecutorContext) -> Self {
        Self { ctx }
    }

    /// Shared collaborators.
    pub fn context(&self) -> &ExecutorContext {
        &self.ctx
    }

    /// Loads and runs one task, deleting it once handled.
    ///
    /// A missing task was already handled and deleted by an earlier
    /// delivery; it is reported as [`TaskOutcome::Abandoned`]. A task whose
    /// checkpoint fails validation fails the query.
    pub fn handle(&self, task_key: &TaskKey, connector: &dyn Connector) -> Result<TaskOutcome> {
        let task = match self.ctx.task_store.get_task(task_key) {
            Ok(task) => task,
            Err(CairnError::TaskNotFound(_)) => {
                warn!(task = %task_key, "executor.task.already_handled");
                return Ok(TaskOutcome::Abandoned);
            }
            Err(err) => {
                error!(task = %task_key, error = %err, "executor.task.load_failed");
                if err.is_fatal() {
                    self.mark_failed(task_key, &err);
                }
                return Err(err);
            }
        };
        let status = self.ctx.status_store.get(task.query_id())?;
        let action = ExecutorAction::from(task);
        info!(action = %action, store = connector.instance(), "executor.task.start");
        let outcome = action.execute(&self.ctx, &status, connector)?;
        self.ctx.task_store.delete_task(task_key)?;
        Ok(outcome)
    }

    fn mark_failed(&self, task_key: &TaskKey, err: &CairnError) {
        if let Err(mark_err) = self
            .ctx
            .status_store
            .update_failed_status(task_key.query_id(), err)
        {
            error!(task = %task_key, error = %mark_err, "executor.task.mark_failed_error");
        }
    }
}
