//! Reference collaborators for exercising the core without a real data store.
//!
//! [`VecLogicFactory`] produces logics that replay a fixed list of results
//! and checkpoint by offset, and the recording sinks capture best-effort
//! side effects so tests can assert on them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::checkpoint::QueryCheckpoint;
use crate::logic::{
    CheckpointableQueryLogic, Connector, GenericQueryConfiguration, LogicLimits, Payload,
    QueryLogic, QueryLogicFactory,
};
use crate::metrics::{MetricSink, MetricUpdate, OriginNotifier};
use crate::status::Query;
use crate::types::{CairnError, QueryId, QueryKey, Result};

const OFFSET_PROPERTY: &str = "offset";

/// Connector that only carries a name.
#[derive(Clone, Debug)]
pub struct StaticConnector(pub String);

impl Default for StaticConnector {
    fn default() -> Self {
        StaticConnector("in-memory".into())
    }
}

impl Connector for StaticConnector {
    fn instance(&self) -> &str {
        &self.0
    }
}

/// Call counters shared by every logic a [`VecLogicFactory`] creates.
#[derive(Default, Debug)]
pub struct LogicProbe {
    /// Calls to `initialize`.
    pub initializations: AtomicUsize,
    /// Checkpoints produced, first and refreshed.
    pub checkpoints: AtomicUsize,
    /// Successful `setup_from_checkpoint` calls.
    pub resumes: AtomicUsize,
    /// Results returned by `try_next`.
    pub results_pulled: AtomicUsize,
}

impl LogicProbe {
    /// Checkpoints produced so far.
    pub fn checkpoints(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }

    /// Resumes so far.
    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    /// Initializations so far.
    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }

    /// Results pulled so far.
    pub fn results_pulled(&self) -> usize {
        self.results_pulled.load(Ordering::SeqCst)
    }
}

/// Builds [`VecQueryLogic`] instances for one logic name.
pub struct VecLogicFactory {
    name: String,
    results: Arc<Vec<Payload>>,
    checkpointable: bool,
    limits: LogicLimits,
    fail_initialize: bool,
    probe: Arc<LogicProbe>,
}

impl VecLogicFactory {
    /// Non-checkpointable factory replaying `results`.
    pub fn new(name: impl Into<String>, results: Vec<Payload>) -> Self {
        Self {
            name: name.into(),
            results: Arc::new(results),
            checkpointable: false,
            limits: LogicLimits {
                max_page_size: 100,
                ..LogicLimits::default()
            },
            fail_initialize: false,
            probe: Arc::new(LogicProbe::default()),
        }
    }

    /// Whether built logics support checkpoints.
    pub fn checkpointable(mut self, checkpointable: bool) -> Self {
        self.checkpointable = checkpointable;
        self
    }

    /// Limits reported by built logics.
    pub fn limits(mut self, limits: LogicLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Every built logic fails `initialize` with a logic error.
    pub fn fail_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Counters shared by every logic this factory builds.
    pub fn probe(&self) -> Arc<LogicProbe> {
        self.probe.clone()
    }

    /// A fresh logic positioned at the first result.
    pub fn build(&self) -> VecQueryLogic {
        VecQueryLogic {
            results: self.results.clone(),
            position: 0,
            checkpointable: self.checkpointable,
            limits: self.limits,
            fail_initialize: self.fail_initialize,
            probe: self.probe.clone(),
        }
    }
}

impl QueryLogicFactory for VecLogicFactory {
    fn query_logic(&self, name: &str) -> Result<Box<dyn QueryLogic>> {
        if name != self.name {
            return Err(CairnError::Logic(format!("unknown query logic '{name}'")));
        }
        Ok(Box::new(self.build()))
    }
}

/// Replays a fixed result list; checkpoints record the next offset.
pub struct VecQueryLogic {
    results: Arc<Vec<Payload>>,
    position: usize,
    checkpointable: bool,
    limits: LogicLimits,
    fail_initialize: bool,
    probe: Arc<LogicProbe>,
}

impl QueryLogic for VecQueryLogic {
    fn initialize(
        &mut self,
        connector: &dyn Connector,
        query: &Query,
        authorizations: &[String],
    ) -> Result<GenericQueryConfiguration> {
        if self.fail_initialize {
            return Err(CairnError::Logic(format!(
                "cannot plan '{}' against {}",
                query.query_string,
                connector.instance()
            )));
        }
        self.probe.initializations.fetch_add(1, Ordering::SeqCst);
        Ok(GenericQueryConfiguration {
            query_string: format!("plan({})", query.query_string),
            authorizations: authorizations.to_vec(),
        })
    }

    fn setup_query(&mut self, _config: &GenericQueryConfiguration) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn try_next(&mut self) -> Result<Option<Payload>> {
        let next = self.results.get(self.position).cloned();
        if next.is_some() {
            self.position += 1;
            self.probe.results_pulled.fetch_add(1, Ordering::SeqCst);
        }
        Ok(next)
    }

    fn limits(&self) -> LogicLimits {
        self.limits
    }

    fn as_checkpointable(&mut self) -> Option<&mut dyn CheckpointableQueryLogic> {
        Some(self)
    }
}

impl CheckpointableQueryLogic for VecQueryLogic {
    fn is_checkpointable(&self) -> bool {
        self.checkpointable
    }

    fn setup_from_checkpoint(
        &mut self,
        _connector: &dyn Connector,
        checkpoint: &QueryCheckpoint,
    ) -> Result<()> {
        let offset = checkpoint
            .property(OFFSET_PROPERTY)
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|offset| *offset <= self.results.len())
            .ok_or_else(|| {
                CairnError::CorruptCheckpoint(format!(
                    "checkpoint for {} has no usable offset",
                    checkpoint.query_key()
                ))
            })?;
        self.position = offset;
        self.probe.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn checkpoint(&mut self, query_key: &QueryKey) -> Result<QueryCheckpoint> {
        self.probe.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(QueryCheckpoint::new(query_key.clone())
            .with_property(OFFSET_PROPERTY, self.position.to_string()))
    }
}

/// Metric sink that keeps every update, optionally failing each submit.
#[derive(Default)]
pub struct RecordingMetricSink {
    updates: Mutex<Vec<MetricUpdate>>,
    fail: bool,
}

impl RecordingMetricSink {
    /// Records updates, then reports failure for each.
    pub fn failing() -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Updates received so far.
    pub fn updates(&self) -> Vec<MetricUpdate> {
        self.updates.lock().clone()
    }
}

impl MetricSink for RecordingMetricSink {
    fn submit(&self, update: MetricUpdate) -> Result<()> {
        self.updates.lock().push(update);
        if self.fail {
            return Err(CairnError::Unavailable("metric service unreachable".into()));
        }
        Ok(())
    }
}

/// Origin notifier that records `(origin, query)` pairs.
#[derive(Default)]
pub struct RecordingOriginNotifier {
    notifications: Mutex<Vec<(String, QueryId)>>,
}

impl RecordingOriginNotifier {
    /// `(origin, query)` pairs notified so far.
    pub fn notifications(&self) -> Vec<(String, QueryId)> {
        self.notifications.lock().clone()
    }
}

impl OriginNotifier for RecordingOriginNotifier {
    fn notify_created(&self, origin_service: &str, query_id: &QueryId) -> Result<()> {
        self.notifications
            .lock()
            .push((origin_service.to_owned(), query_id.clone()));
        Ok(())
    }
}
