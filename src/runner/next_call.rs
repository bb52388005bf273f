use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::config::{ExpirationProperties, QueryProperties};
use crate::logic::QueryLogic;
use crate::metrics::Lifecycle;
use crate::results::{
    JsonSizeOf, ObjectSizeOf, PageStatus, ResultListener, ResultMessage, ResultQueueManager,
    ResultsPage,
};
use crate::status::QueryStatusStore;
use crate::types::{QueryId, Result};

/// Why a page stopped collecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The call's token was cancelled.
    Cancelled,
    /// The caller's page size was reached.
    UserPageSize,
    /// The query logic's page size was reached.
    LogicPageSize,
    /// The page byte trigger was reached or the next result would pass it.
    PageBytes,
    /// Results returned so far plus this page reached the result limit.
    MaxResults,
    /// Iterations plus seeks reached the work limit.
    MaxWork,
    /// Too little was collected for the time spent.
    ShortCircuit,
    /// The producer finished the stream.
    EndOfStream,
}

impl StopReason {
    fn page_status(self) -> PageStatus {
        match self {
            StopReason::PageBytes | StopReason::ShortCircuit => PageStatus::Partial,
            _ => PageStatus::Complete,
        }
    }

    fn lifecycle(self) -> Option<Lifecycle> {
        match self {
            StopReason::Cancelled => Some(Lifecycle::Cancelled),
            StopReason::MaxResults => Some(Lifecycle::MaxResults),
            StopReason::MaxWork => Some(Lifecycle::MaxWork),
            StopReason::ShortCircuit => Some(Lifecycle::NextTimeout),
            _ => None,
        }
    }
}

/// Work counters and outcome of one page request.
#[derive(Debug)]
pub struct NextCallMetric {
    next_count: AtomicU64,
    seek_count: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    stop_reason: Mutex<Option<StopReason>>,
}

impl Default for NextCallMetric {
    fn default() -> Self {
        Self {
            next_count: AtomicU64::new(0),
            seek_count: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle::Results),
            stop_reason: Mutex::new(None),
        }
    }
}

impl NextCallMetric {
    /// Adds `count` iterations.
    pub fn record_next(&self, count: u64) {
        self.next_count.fetch_add(count, Ordering::Relaxed);
    }

    /// Adds `count` seeks.
    pub fn record_seek(&self, count: u64) {
        self.seek_count.fetch_add(count, Ordering::Relaxed);
    }

    /// Iterations recorded so far.
    pub fn next_count(&self) -> u64 {
        self.next_count.load(Ordering::Relaxed)
    }

    /// Seeks recorded so far.
    pub fn seek_count(&self) -> u64 {
        self.seek_count.load(Ordering::Relaxed)
    }

    /// Iterations plus seeks.
    pub fn work(&self) -> u64 {
        self.next_count().saturating_add(self.seek_count())
    }

    /// Lifecycle the call ended in; `Results` unless a limit stopped it.
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    /// Set once the call returns.
    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.stop_reason.lock()
    }

    fn finish(&self, reason: StopReason) {
        if let Some(lifecycle) = reason.lifecycle() {
            *self.lifecycle.lock() = lifecycle;
        }
        *self.stop_reason.lock() = Some(reason);
    }
}

/// Cancels a running [`NextCall`] and exposes its metric.
#[derive(Clone, Debug)]
pub struct NextCallHandle {
    token: CancellationToken,
    metric: Arc<NextCallMetric>,
}

impl NextCallHandle {
    /// Requests cancellation; observed within one poll interval.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Guard that cancels the call when dropped.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Work counters shared with the running call.
    pub fn metric(&self) -> &NextCallMetric {
        &self.metric
    }
}

/// Assembles one page of results for a query.
///
/// Limits are captured once at construction. [`NextCall::call`] then waits
/// on the query's result queue in bounded polls and, before every receive,
/// checks the stop conditions in priority order: cancellation, caller page
/// size, logic page size, page bytes, max results, max work, and finally the
/// time short circuit.
pub struct NextCall {
    query_id: QueryId,
    status_store: Arc<dyn QueryStatusStore>,
    listener: ResultListener,
    size_of: Arc<dyn ObjectSizeOf>,
    poll: Duration,
    expiration: ExpirationProperties,
    user_page_size: usize,
    logic_page_size: usize,
    page_byte_trigger: u64,
    max_results: i64,
    max_work: i64,
    token: CancellationToken,
    metric: Arc<NextCallMetric>,
}

impl NextCall {
    /// Captures the page limits for `query_id` from its status and `logic`.
    pub fn new(
        properties: &QueryProperties,
        status_store: Arc<dyn QueryStatusStore>,
        results: &ResultQueueManager,
        query_id: &QueryId,
        logic: &dyn QueryLogic,
    ) -> Result<Self> {
        let status = status_store.get(query_id)?;
        let limits = logic.limits();
        let query = &status.query;

        let logic_max_results = logic.result_limit(&query.dn_list);
        if logic_max_results != limits.max_results {
            info!(
                query_id = %query_id,
                max_results = logic_max_results,
                default = limits.max_results,
                user = %query.user_dn,
                "runner.next.identity_max_results"
            );
        }
        let max_results = match query.max_results_override {
            Some(max_override) => {
                info!(
                    query_id = %query_id,
                    max_results = max_override,
                    logic_max_results,
                    user = %query.user_dn,
                    "runner.next.max_results_override"
                );
                max_override
            }
            None => logic_max_results,
        };

        Ok(Self {
            query_id: query_id.clone(),
            listener: results.create_listener(query_id),
            status_store,
            size_of: Arc::new(JsonSizeOf),
            poll: properties.result_poll_rate(),
            expiration: properties.expiration.clone(),
            user_page_size: query.page_size,
            logic_page_size: limits.max_page_size,
            page_byte_trigger: limits.page_byte_trigger,
            max_results,
            max_work: limits.max_work,
            token: CancellationToken::new(),
            metric: Arc::new(NextCallMetric::default()),
        })
    }

    /// Replaces the payload sizer used for the page byte trigger.
    pub fn with_size_of(mut self, size_of: Arc<dyn ObjectSizeOf>) -> Self {
        self.size_of = size_of;
        self
    }

    /// Cancellation handle sharing this call's token and metric.
    pub fn handle(&self) -> NextCallHandle {
        NextCallHandle {
            token: self.token.clone(),
            metric: self.metric.clone(),
        }
    }

    /// `min(caller page size, logic page size)`.
    pub fn max_page_size(&self) -> usize {
        self.user_page_size.min(self.logic_page_size)
    }

    /// Result limit in force; negative means unlimited.
    pub fn max_results(&self) -> i64 {
        self.max_results
    }

    /// Collects the page.
    pub async fn call(self) -> Result<ResultsPage> {
        let started = Instant::now();
        let mut results = Vec::new();
        let mut page_bytes = 0u64;

        let reason = loop {
            if let Some(reason) = self.check_finished(results.len(), page_bytes, started.elapsed())? {
                break reason;
            }
            let message = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                message = self.listener.receive(self.poll) => message,
            };
            match message {
                Some(ResultMessage::Payload(payload)) => {
                    if self.page_byte_trigger > 0 {
                        let size = self.size_of.size_of(&payload);
                        let total = page_bytes.saturating_add(size);
                        if !results.is_empty() && total > self.page_byte_trigger {
                            // held for the next page
                            self.listener.requeue(vec![ResultMessage::Payload(payload)]);
                            info!(
                                query_id = %self.query_id,
                                page_len = results.len(),
                                page_bytes,
                                held_bytes = size,
                                "runner.next.page_bytes"
                            );
                            break StopReason::PageBytes;
                        }
                        page_bytes = total;
                    }
                    results.push(payload);
                }
                Some(ResultMessage::EndOfStream) => break StopReason::EndOfStream,
                None => {}
            }
        };

        self.metric.finish(reason);
        let page = ResultsPage {
            status: reason.page_status(),
            results,
        };
        info!(
            query_id = %self.query_id,
            results = page.len(),
            bytes = page_bytes,
            ?reason,
            status = ?page.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "runner.next.completed"
        );
        Ok(page)
    }

    fn check_finished(
        &self,
        page_len: usize,
        page_bytes: u64,
        elapsed: Duration,
    ) -> Result<Option<StopReason>> {
        let id = &self.query_id;
        if self.token.is_cancelled() {
            info!(query_id = %id, "runner.next.cancelled");
            return Ok(Some(StopReason::Cancelled));
        }
        if page_len >= self.user_page_size {
            debug!(query_id = %id, page_len, "runner.next.user_page_size");
            return Ok(Some(StopReason::UserPageSize));
        }
        if page_len >= self.logic_page_size {
            debug!(query_id = %id, page_len, "runner.next.logic_page_size");
            return Ok(Some(StopReason::LogicPageSize));
        }
        if self.page_bytes_reached(page_bytes) {
            info!(query_id = %id, page_len, page_bytes, "runner.next.page_bytes");
            return Ok(Some(StopReason::PageBytes));
        }
        if self.max_results >= 0 {
            let returned = self.status_store.get(id)?.num_results_returned;
            let total = returned.saturating_add(page_len as u64);
            if total >= self.max_results as u64 {
                info!(query_id = %id, total, max_results = self.max_results, "runner.next.max_results");
                return Ok(Some(StopReason::MaxResults));
            }
        }
        if self.max_work >= 0 && self.metric.work() >= self.max_work as u64 {
            info!(query_id = %id, work = self.metric.work(), "runner.next.max_work");
            return Ok(Some(StopReason::MaxWork));
        }
        if self.short_circuit(page_len, elapsed) {
            info!(
                query_id = %id,
                page_len,
                max_page_size = self.max_page_size(),
                elapsed_ms = elapsed.as_millis() as u64,
                "runner.next.short_circuit"
            );
            return Ok(Some(StopReason::ShortCircuit));
        }
        Ok(None)
    }

    /// A zero trigger disables the check.
    fn page_bytes_reached(&self, page_bytes: u64) -> bool {
        self.page_byte_trigger > 0 && page_bytes >= self.page_byte_trigger
    }

    /// Only a non-empty page short circuits on time.
    fn short_circuit(&self, page_len: usize, elapsed: Duration) -> bool {
        if page_len == 0 {
            return false;
        }
        if elapsed >= self.expiration.short_circuit_timeout() {
            return true;
        }
        if elapsed >= self.expiration.short_circuit_check_time() {
            let time_fraction = elapsed.as_secs_f64() / self.expiration.call_timeout().as_secs_f64();
            let result_fraction = page_len as f64 / self.max_page_size() as f64;
            return result_fraction < time_fraction;
        }
        false
    }
}
