#![forbid(unsafe_code)]

//! Best-effort side channels: query metric updates and origin notifications.
//!
//! Nothing here may fail the primary flow. Work is handed to
//! [`spawn_best_effort`], which runs it detached and only logs the outcome.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::types::{QueryId, Result};

/// Terminal reason recorded on a page request's metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    /// Still collecting, or stopped for a reason with no special lifecycle.
    Results,
    /// Stopped because the caller cancelled.
    Cancelled,
    /// Stopped at the effective max-results limit.
    MaxResults,
    /// Stopped at the logic's max-work limit.
    MaxWork,
    /// Stopped by a time short circuit.
    NextTimeout,
}

/// How a metric update should be merged by the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MetricType {
    /// Partial update from one distributed component.
    Distributed,
    /// Full replacement of the stored metric.
    Complete,
}

/// Metric update submitted after query creation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricUpdate {
    /// Query the update describes.
    pub query_id: QueryId,
    /// Plan recorded during creation.
    pub plan: Option<String>,
    /// Status timestamp at plan time.
    pub last_updated_millis: u64,
    /// Kind of metric record.
    pub metric_type: MetricType,
}

/// Receiver of metric updates.
pub trait MetricSink: Send + Sync {
    /// Records one update.
    fn submit(&self, update: MetricUpdate) -> Result<()>;
}

/// Publisher of "query created" notifications to the defining service.
pub trait OriginNotifier: Send + Sync {
    /// Tells `origin_service` that `query_id` was created.
    fn notify_created(&self, origin_service: &str, query_id: &QueryId) -> Result<()>;
}

/// A [`MetricSink`] that discards every update.
#[derive(Default)]
pub struct NoopMetricSink;

impl MetricSink for NoopMetricSink {
    fn submit(&self, _update: MetricUpdate) -> Result<()> {
        Ok(())
    }
}

/// An [`OriginNotifier`] that publishes nothing.
#[derive(Default)]
pub struct NoopOriginNotifier;

impl OriginNotifier for NoopOriginNotifier {
    fn notify_created(&self, _origin_service: &str, _query_id: &QueryId) -> Result<()> {
        Ok(())
    }
}

/// Runs `work` detached from the caller. Errors and panics are logged under
/// `name` and never reach the caller.
///
/// Inside a tokio runtime the work goes to the blocking pool; otherwise a
/// short-lived thread is spawned.
pub fn spawn_best_effort<F>(name: &'static str, query_id: QueryId, work: F)
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let run = move || match catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(())) => debug!(query_id = %query_id, side_effect = name, "side_effect.done"),
        Ok(Err(err)) => {
            warn!(query_id = %query_id, side_effect = name, error = %err, "side_effect.failed")
        }
        Err(_) => error!(query_id = %query_id, side_effect = name, "side_effect.panicked"),
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(run);
        }
        Err(_) => {
            if let Err(err) = std::thread::Builder::new()
                .name(format!("cairn-{name}"))
                .spawn(run)
            {
                warn!(side_effect = name, error = %err, "side_effect.spawn_failed");
            }
        }
    }
}
