#![forbid(unsafe_code)]

//! Per-query result conduit from task execution to page assembly.
//!
//! Producers are synchronous task workers; they publish through a
//! [`ResultPublisher`] without awaiting. The consumer side is a
//! [`ResultListener`] used by one page request at a time: the receiver sits
//! behind an async mutex, so concurrent listeners on the same query take
//! turns per poll and every message is delivered at most once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use crate::logic::Payload;
use crate::types::{CairnError, QueryId, Result};

/// Message carried on a result queue.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultMessage {
    /// One produced result.
    Payload(Payload),
    /// No further results will arrive for this execution.
    EndOfStream,
}

/// Completeness of a returned page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PageStatus {
    /// Stopped for a size, count, or end-of-stream reason.
    Complete,
    /// Stopped early for a byte or time bound.
    Partial,
}

/// A bounded batch of results.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultsPage {
    /// Results in the order they were received.
    pub results: Vec<Payload>,
    /// Why collection stopped, as seen by the client.
    pub status: PageStatus,
}

impl ResultsPage {
    /// Number of results on the page.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether the page carries no results.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Estimates the serialized size of a result.
pub trait ObjectSizeOf: Send + Sync {
    /// Size of `payload` in bytes.
    fn size_of(&self, payload: &Payload) -> u64;
}

/// Sizes a payload by its compact JSON encoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSizeOf;

impl ObjectSizeOf for JsonSizeOf {
    fn size_of(&self, payload: &Payload) -> u64 {
        serde_json::to_vec(payload)
            .map(|buf| buf.len() as u64)
            .unwrap_or(0)
    }
}

struct ResultQueue {
    query_id: QueryId,
    tx: UnboundedSender<ResultMessage>,
    rx: tokio::sync::Mutex<UnboundedReceiver<ResultMessage>>,
    // messages handed back by a consumer; drained before the channel
    held: Mutex<VecDeque<ResultMessage>>,
    finished: AtomicBool,
}

/// Registry of result queues, one per live query.
#[derive(Default)]
pub struct ResultQueueManager {
    queues: Mutex<HashMap<QueryId, Arc<ResultQueue>>>,
}

impl ResultQueueManager {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, query_id: &QueryId) -> Arc<ResultQueue> {
        let mut queues = self.queues.lock();
        queues
            .entry(query_id.clone())
            .or_insert_with(|| {
                debug!(query_id = %query_id, "results.queue.create");
                let (tx, rx) = mpsc::unbounded_channel();
                Arc::new(ResultQueue {
                    query_id: query_id.clone(),
                    tx,
                    rx: tokio::sync::Mutex::new(rx),
                    held: Mutex::new(VecDeque::new()),
                    finished: AtomicBool::new(false),
                })
            })
            .clone()
    }

    /// Producer handle; creates the queue on first use.
    pub fn publisher(&self, query_id: &QueryId) -> ResultPublisher {
        ResultPublisher {
            queue: self.queue(query_id),
        }
    }

    /// Consumer handle; creates the queue on first use.
    pub fn create_listener(&self, query_id: &QueryId) -> ResultListener {
        ResultListener {
            queue: self.queue(query_id),
        }
    }

    /// Drops the queue for a closed or failed query. Outstanding handles keep
    /// working against the detached queue until dropped.
    pub fn delete_queue(&self, query_id: &QueryId) -> bool {
        let removed = self.queues.lock().remove(query_id).is_some();
        if removed {
            debug!(query_id = %query_id, "results.queue.delete");
        }
        removed
    }

    /// Whether a queue is registered for the query.
    pub fn contains(&self, query_id: &QueryId) -> bool {
        self.queues.lock().contains_key(query_id)
    }
}

/// Publishes results for one query.
#[derive(Clone)]
pub struct ResultPublisher {
    queue: Arc<ResultQueue>,
}

impl ResultPublisher {
    /// Publishes one result. Fails once the end-of-stream marker was sent.
    pub fn publish(&self, payload: Payload) -> Result<()> {
        if self.queue.finished.load(Ordering::Acquire) {
            return Err(CairnError::InvariantViolation(format!(
                "result published after end of stream for query {}",
                self.queue.query_id
            )));
        }
        self.send(ResultMessage::Payload(payload))
    }

    /// Sends the end-of-stream marker. Only the first call sends; later
    /// calls return `false`.
    pub fn finish(&self) -> Result<bool> {
        if self.queue.finished.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.send(ResultMessage::EndOfStream)?;
        Ok(true)
    }

    /// Whether the end-of-stream marker was sent.
    pub fn is_finished(&self) -> bool {
        self.queue.finished.load(Ordering::Acquire)
    }

    fn send(&self, message: ResultMessage) -> Result<()> {
        // the receiver lives in the same queue, so a send only fails if the
        // queue is being torn down
        self.queue.tx.send(message).map_err(|_| {
            CairnError::Store(format!(
                "result queue for query {} is closed",
                self.queue.query_id
            ))
        })
    }
}

/// Receives results for one query.
#[derive(Clone)]
pub struct ResultListener {
    queue: Arc<ResultQueue>,
}

impl ResultListener {
    /// Waits up to `timeout` for the next message; `None` on timeout.
    /// Messages handed back through [`ResultListener::requeue`] come first.
    pub async fn receive(&self, timeout: Duration) -> Option<ResultMessage> {
        let recv = async {
            let mut rx = self.queue.rx.lock().await;
            if let Some(message) = self.queue.held.lock().pop_front() {
                return Some(message);
            }
            rx.recv().await
        };
        match tokio::time::timeout(timeout, recv).await {
            Ok(message) => message,
            Err(_) => {
                trace!(query_id = %self.queue.query_id, "results.receive.timeout");
                None
            }
        }
    }

    /// Hands received messages back to the queue, ahead of anything not yet
    /// received and in their original order.
    pub fn requeue(&self, messages: Vec<ResultMessage>) {
        if messages.is_empty() {
            return;
        }
        let count = messages.len();
        let mut held = self.queue.held.lock();
        for message in messages.into_iter().rev() {
            held.push_front(message);
        }
        debug!(query_id = %self.queue.query_id, count, "results.requeue");
    }

    /// Query this listener receives for.
    pub fn query_id(&self) -> &QueryId {
        &self.queue.query_id
    }
}
