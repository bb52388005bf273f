#![forbid(unsafe_code)]

//! Page requests against running queries.
//!
//! [`QueryService`] is the client-facing side: it defines queries, serves
//! pages through [`NextCall`], and tears queries down. Every in-flight page
//! request is registered so another actor can cancel it.

mod next_call;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::DropGuard;
use tracing::{debug, info, warn};

pub use next_call::{NextCall, NextCallHandle, NextCallMetric, StopReason};

use crate::checkpoint::{QueryTask, QueryTaskStore, TaskAction};
use crate::config::QueryProperties;
use crate::logic::QueryLogic;
use crate::results::{
    JsonSizeOf, ObjectSizeOf, ResultListener, ResultMessage, ResultQueueManager, ResultsPage,
};
use crate::status::{QueryState, QueryStatus, QueryStatusStore};
use crate::types::{CairnError, QueryId, Result};

type CallRegistry = HashMap<QueryId, Vec<(u64, NextCallHandle)>>;

/// Client-facing query lifecycle operations.
pub struct QueryService {
    properties: QueryProperties,
    status_store: Arc<dyn QueryStatusStore>,
    task_store: Arc<dyn QueryTaskStore>,
    results: Arc<ResultQueueManager>,
    size_of: Arc<dyn ObjectSizeOf>,
    calls: Mutex<CallRegistry>,
    next_call_id: AtomicU64,
}

impl QueryService {
    /// Service with JSON payload sizing.
    pub fn new(
        properties: QueryProperties,
        status_store: Arc<dyn QueryStatusStore>,
        task_store: Arc<dyn QueryTaskStore>,
        results: Arc<ResultQueueManager>,
    ) -> Self {
        Self {
            properties,
            status_store,
            task_store,
            results,
            size_of: Arc::new(JsonSizeOf),
            calls: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(0),
        }
    }

    /// Replaces the payload sizer handed to every page request.
    pub fn with_size_of(mut self, size_of: Arc<dyn ObjectSizeOf>) -> Self {
        self.size_of = size_of;
        self
    }

    /// Persists a `Defined` query and stores its `Create` task for the
    /// scheduler.
    pub fn define(&self, status: QueryStatus) -> Result<QueryTask> {
        if status.state != QueryState::Defined {
            return Err(CairnError::InvalidTransition {
                from: status.state.name(),
                to: QueryState::Defined.name(),
            });
        }
        let query_key = status.query_key.clone();
        self.status_store.create(status)?;
        let task = self
            .task_store
            .create_task(&query_key, TaskAction::Create, None)?;
        info!(task = %task.task_key, "runner.query.defined");
        Ok(task)
    }

    /// Serves one page and adds its size to the results-returned counter.
    ///
    /// Dropping the returned future cancels the page request; results it had
    /// already collected are handed back to the queue for the next request.
    pub async fn next(&self, query_id: &QueryId, logic: &dyn QueryLogic) -> Result<ResultsPage> {
        let state = self.status_store.get(query_id)?.state;
        if state.is_terminal() {
            return Err(CairnError::InvariantViolation(format!(
                "page requested for {state} query {query_id}"
            )));
        }

        let call = NextCall::new(
            &self.properties,
            self.status_store.clone(),
            &self.results,
            query_id,
            logic,
        )?
        .with_size_of(self.size_of.clone());
        let handle = call.handle();
        let listener = self.results.create_listener(query_id);
        let (page_tx, page_rx) = oneshot::channel();
        let mut in_flight = InFlightPage {
            service: self,
            query_id: query_id.clone(),
            call_id: self.register(query_id, handle.clone()),
            handle: handle.clone(),
            listener: listener.clone(),
            page: page_rx,
            _cancel: handle.cancel_on_drop(),
        };
        tokio::spawn(async move {
            let page = call.call().await;
            // the requester went away; its page goes back on the queue
            if let Err(Ok(page)) = page_tx.send(page) {
                hand_back(&listener, &handle, page);
            }
        });

        let page = (&mut in_flight.page).await.map_err(|_| {
            CairnError::InvariantViolation(format!("next call for {query_id} aborted"))
        })??;
        drop(in_flight);
        self.status_store
            .add_results_returned(query_id, page.len() as u64)?;
        Ok(page)
    }

    /// Cancels every in-flight page request for the query and returns how
    /// many were signalled.
    pub fn cancel(&self, query_id: &QueryId) -> usize {
        let calls = self.calls.lock();
        let Some(handles) = calls.get(query_id) else {
            return 0;
        };
        for (_, handle) in handles {
            handle.cancel();
        }
        info!(query_id = %query_id, calls = handles.len(), "runner.query.cancel");
        handles.len()
    }

    /// Cancels outstanding pages, closes the query and drops its queue.
    pub fn close(&self, query_id: &QueryId) -> Result<()> {
        self.cancel(query_id);
        self.status_store.set_state(query_id, QueryState::Closed)?;
        self.results.delete_queue(query_id);
        info!(query_id = %query_id, "runner.query.closed");
        Ok(())
    }

    /// Cancels outstanding pages, records the failure and drops the queue.
    pub fn fail(&self, query_id: &QueryId, error: &CairnError) -> Result<()> {
        self.cancel(query_id);
        self.status_store.update_failed_status(query_id, error)?;
        self.results.delete_queue(query_id);
        warn!(query_id = %query_id, error = %error, "runner.query.failed");
        Ok(())
    }

    /// Number of page requests currently in flight for the query.
    pub fn in_flight(&self, query_id: &QueryId) -> usize {
        self.calls.lock().get(query_id).map_or(0, Vec::len)
    }

    fn register(&self, query_id: &QueryId, handle: NextCallHandle) -> u64 {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        self.calls
            .lock()
            .entry(query_id.clone())
            .or_default()
            .push((call_id, handle));
        debug!(query_id = %query_id, call_id, "runner.next.registered");
        call_id
    }

    fn unregister(&self, query_id: &QueryId, call_id: u64) {
        let mut calls = self.calls.lock();
        if let Some(handles) = calls.get_mut(query_id) {
            handles.retain(|(id, _)| *id != call_id);
            if handles.is_empty() {
                calls.remove(query_id);
            }
        }
    }
}

/// A registered page request. Dropping it before the page arrives cancels
/// the call and returns anything it collected to the result queue.
struct InFlightPage<'a> {
    service: &'a QueryService,
    query_id: QueryId,
    call_id: u64,
    handle: NextCallHandle,
    listener: ResultListener,
    page: oneshot::Receiver<Result<ResultsPage>>,
    _cancel: DropGuard,
}

impl Drop for InFlightPage<'_> {
    fn drop(&mut self) {
        self.page.close();
        if let Ok(Ok(page)) = self.page.try_recv() {
            hand_back(&self.listener, &self.handle, page);
        }
        self.service.unregister(&self.query_id, self.call_id);
    }
}

fn hand_back(listener: &ResultListener, handle: &NextCallHandle, page: ResultsPage) {
    let mut messages: Vec<ResultMessage> =
        page.results.into_iter().map(ResultMessage::Payload).collect();
    if handle.metric().stop_reason() == Some(StopReason::EndOfStream) {
        messages.push(ResultMessage::EndOfStream);
    }
    info!(
        query_id = %listener.query_id(),
        messages = messages.len(),
        "runner.next.abandoned"
    );
    listener.requeue(messages);
}
