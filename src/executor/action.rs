use std::fmt;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::checkpoint::{QueryCheckpoint, QueryTask, TaskAction};
use crate::executor::ExecutorContext;
use crate::logic::{Connector, QueryLogic};
use crate::metrics::{spawn_best_effort, MetricType, MetricUpdate};
use crate::status::{QueryState, QueryStatus};
use crate::types::{CairnError, Result, TaskKey};

/// Results published between re-reads of the query state.
const STATUS_CHECK_INTERVAL: usize = 32;

/// How a handled task left the query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Work remains; a `Next` task carrying a fresh checkpoint was stored.
    Checkpointed,
    /// Results are exhausted and the end-of-stream marker was published.
    Exhausted,
    /// The query was already closed or failed; nothing was done.
    Abandoned,
}

/// A dispatched unit of work, tagged by kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutorAction {
    /// Initialize the logic; checkpoint once or exhaust.
    Create(QueryTask),
    /// Resume from the task's checkpoint.
    Next(QueryTask),
}

impl From<QueryTask> for ExecutorAction {
    fn from(task: QueryTask) -> Self {
        match task.action {
            TaskAction::Create => ExecutorAction::Create(task),
            TaskAction::Next => ExecutorAction::Next(task),
        }
    }
}

impl fmt::Display for ExecutorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.task().action, self.task().task_key)
    }
}

impl ExecutorAction {
    /// The task being handled.
    pub fn task(&self) -> &QueryTask {
        match self {
            ExecutorAction::Create(task) | ExecutorAction::Next(task) => task,
        }
    }

    /// Runs the action against `status`. Any fatal error marks the query
    /// failed in the status store before it is returned.
    pub fn execute(
        &self,
        ctx: &ExecutorContext,
        status: &QueryStatus,
        connector: &dyn Connector,
    ) -> Result<TaskOutcome> {
        let task_key = &self.task().task_key;
        if status.state.is_terminal() {
            info!(task = %task_key, state = %status.state, "executor.task.abandoned");
            return Ok(TaskOutcome::Abandoned);
        }
        if let Some(reason) = redelivery(ctx, self.task())? {
            warn!(task = %task_key, reason, "executor.task.redelivered");
            return Ok(TaskOutcome::Abandoned);
        }
        let result = match self {
            ExecutorAction::Create(task) => create(ctx, task, status, connector),
            ExecutorAction::Next(task) => next(ctx, task, status, connector),
        };
        match result {
            Ok(outcome) => {
                debug!(task = %task_key, ?outcome, "executor.task.handled");
                Ok(outcome)
            }
            Err(err) if err.is_fatal() => {
                error!(task = %task_key, error = %err, "executor.task.failed");
                if let Err(mark_err) = ctx
                    .status_store
                    .update_failed_status(task_key.query_id(), &err)
                {
                    error!(
                        task = %task_key,
                        error = %mark_err,
                        "executor.task.mark_failed_error"
                    );
                }
                Err(err)
            }
            Err(err) => {
                warn!(task = %task_key, error = %err, "executor.task.transient");
                Err(err)
            }
        }
    }
}

fn create(
    ctx: &ExecutorContext,
    task: &QueryTask,
    status: &QueryStatus,
    connector: &dyn Connector,
) -> Result<TaskOutcome> {
    let task_key = &task.task_key;
    let query_id = task_key.query_id();

    let mut logic = ctx.logic_factory.query_logic(&status.query.logic_name)?;
    debug!(query_id = %query_id, "executor.create.initialize");
    let config = logic.initialize(connector, &status.query, &status.calculated_auths)?;

    debug!(query_id = %query_id, "executor.create.plan");
    let updated = ctx.status_store.set_plan(query_id, &config.query_string)?;

    let update = MetricUpdate {
        query_id: query_id.clone(),
        plan: updated.plan.clone(),
        last_updated_millis: updated.last_updated_millis,
        metric_type: MetricType::Distributed,
    };
    let sink = ctx.metric_sink.clone();
    spawn_best_effort("metric_update", query_id.clone(), move || {
        sink.submit(update)
    });

    debug!(query_id = %query_id, "executor.create.setup");
    logic.setup_query(&config)?;

    let checkpointable = logic
        .as_checkpointable()
        .is_some_and(|cp| cp.is_checkpointable());

    ctx.status_store.set_state(query_id, QueryState::Created)?;
    notify_origin_of_creation(ctx, status);

    if checkpointable {
        let cp_logic = logic.as_checkpointable().ok_or_else(|| {
            CairnError::InvariantViolation("checkpoint capability disappeared".into())
        })?;
        debug!(query_id = %query_id, "executor.create.checkpoint");
        let checkpoint = cp_logic.checkpoint(&task_key.query_key)?;
        store_checkpoint(ctx, task_key, checkpoint)?;
        return Ok(TaskOutcome::Checkpointed);
    }

    debug!(query_id = %query_id, "executor.create.exhaust");
    if !pull_results(ctx, task_key, logic.as_mut(), true)? {
        return Err(CairnError::InvariantViolation(
            "expected to have exhausted results".into(),
        ));
    }
    Ok(TaskOutcome::Exhausted)
}

fn next(
    ctx: &ExecutorContext,
    task: &QueryTask,
    status: &QueryStatus,
    connector: &dyn Connector,
) -> Result<TaskOutcome> {
    let task_key = &task.task_key;
    let query_id = task_key.query_id();

    let mut logic = ctx.logic_factory.query_logic(&status.query.logic_name)?;
    let cp_logic = match logic.as_checkpointable() {
        Some(cp_logic) if cp_logic.is_checkpointable() => cp_logic,
        _ => {
            return Err(CairnError::InvariantViolation(
                "attempted to resume an uninitialized, non-checkpointable query logic".into(),
            ))
        }
    };
    let checkpoint = task.checkpoint.as_ref().ok_or_else(|| {
        CairnError::InvariantViolation(format!("task {task_key} has no checkpoint to resume"))
    })?;
    if checkpoint.query_key() != &task_key.query_key {
        return Err(CairnError::CorruptCheckpoint(format!(
            "checkpoint for {} attached to task {task_key}",
            checkpoint.query_key()
        )));
    }

    cp_logic.setup_from_checkpoint(connector, checkpoint)?;
    if status.state == QueryState::Created {
        ctx.status_store.set_state(query_id, QueryState::Running)?;
    }

    if pull_results(ctx, task_key, &mut *cp_logic, false)? {
        return Ok(TaskOutcome::Exhausted);
    }
    let refreshed = cp_logic.update_checkpoint(checkpoint.clone())?;
    store_checkpoint(ctx, task_key, refreshed)?;
    Ok(TaskOutcome::Checkpointed)
}

/// Publishes results on the query's queue. With `exhaust` set, pulls until
/// the logic runs dry; otherwise stops at the per-task result bound or time
/// guard. Returns whether the logic was exhausted (and the end-of-stream
/// marker published).
fn pull_results<L>(
    ctx: &ExecutorContext,
    task_key: &TaskKey,
    logic: &mut L,
    exhaust: bool,
) -> Result<bool>
where
    L: QueryLogic + ?Sized,
{
    let query_id = task_key.query_id();
    let publisher = ctx.results.publisher(query_id);
    let bounds = &ctx.properties.executor;
    let deadline = bounds.task_deadline();
    let started = Instant::now();
    let mut published = 0usize;
    loop {
        if published % STATUS_CHECK_INTERVAL == 0 {
            let state = ctx.status_store.get(query_id)?.state;
            if state.is_terminal() {
                info!(task = %task_key, %state, published, "executor.pull.query_terminated");
                return Ok(false);
            }
        }
        if !exhaust {
            if published >= bounds.max_results_per_task {
                debug!(task = %task_key, published, "executor.pull.bound_reached");
                return Ok(false);
            }
            if started.elapsed() >= deadline {
                info!(
                    task = %task_key,
                    published,
                    deadline_ms = deadline.as_millis() as u64,
                    "executor.pull.deadline_reached"
                );
                return Ok(false);
            }
        }
        match logic.try_next()? {
            Some(payload) => {
                publisher.publish(payload)?;
                published += 1;
            }
            None => {
                publisher.finish()?;
                debug!(task = %task_key, published, "executor.pull.exhausted");
                return Ok(true);
            }
        }
    }
}

fn store_checkpoint(
    ctx: &ExecutorContext,
    task_key: &TaskKey,
    checkpoint: QueryCheckpoint,
) -> Result<QueryTask> {
    let task = ctx.task_store.create_successor(task_key, checkpoint)?;
    info!(task = %task.task_key, predecessor = %task_key, "executor.checkpoint.stored");
    Ok(task)
}

/// Detects a task delivered again after an earlier delivery handled it but
/// before it was deleted.
fn redelivery(ctx: &ExecutorContext, task: &QueryTask) -> Result<Option<&'static str>> {
    if let Some(successor) = ctx.task_store.superseded_by(&task.task_key)? {
        debug!(task = %task.task_key, successor = %successor, "executor.task.superseded");
        return Ok(Some("superseded"));
    }
    if ctx.results.publisher(task.query_id()).is_finished() {
        return Ok(Some("results_exhausted"));
    }
    Ok(None)
}

fn notify_origin_of_creation(ctx: &ExecutorContext, status: &QueryStatus) {
    let Some(origin) = status.origin_service.clone() else {
        return;
    };
    debug!(query_id = %status.query_id(), origin = %origin, "executor.create.notify_origin");
    let notifier = ctx.origin_notifier.clone();
    let query_id = status.query_id().clone();
    spawn_best_effort("origin_notify", query_id.clone(), move || {
        notifier.notify_created(&origin, &query_id)
    });
}
