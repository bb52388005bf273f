//! Runtime configuration for the executor and the page-assembly runner.
//!
//! Properties are plain serde structs so they can be embedded in a larger
//! service config or loaded standalone from TOML:
//!
//! ```toml
//! result_poll_rate_ms = 250
//!
//! [expiration]
//! call_timeout_ms = 60000
//! short_circuit_check_time_ms = 30000
//! short_circuit_timeout_ms = 58200
//!
//! [executor]
//! max_results_per_task = 500
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{CairnError, Result};

const DEFAULT_CALL_TIMEOUT_MS: u64 = 60 * 60 * 1_000;

/// Top-level properties consumed by `NextCall` and the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryProperties {
    /// Bounded wait for each receive from a result queue.
    pub result_poll_rate_ms: u64,
    /// Page timing and short-circuit thresholds.
    pub expiration: ExpirationProperties,
    /// Per-task work bounds for `Next`.
    pub executor: ExecutorProperties,
}

/// Timing thresholds for a single page request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationProperties {
    /// Overall time budget of one page request.
    pub call_timeout_ms: u64,
    /// Elapsed time after which the result-rate short circuit is considered.
    pub short_circuit_check_time_ms: u64,
    /// Elapsed time after which a non-empty page is always returned.
    pub short_circuit_timeout_ms: u64,
}

/// Bounds on the slice of work a single resumed task performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorProperties {
    /// Results pulled by one `Next` task before re-checkpointing.
    pub max_results_per_task: usize,
    /// Time budget for one `Next` task.
    pub max_task_time_ms: u64,
    /// Multiplier applied to `max_task_time_ms` to get the enforced guard.
    pub task_timeout_factor: f64,
}

impl Default for QueryProperties {
    fn default() -> Self {
        Self {
            result_poll_rate_ms: 500,
            expiration: ExpirationProperties::default(),
            executor: ExecutorProperties::default(),
        }
    }
}

impl Default for ExpirationProperties {
    fn default() -> Self {
        Self::for_call_timeout(DEFAULT_CALL_TIMEOUT_MS)
    }
}

impl Default for ExecutorProperties {
    fn default() -> Self {
        Self {
            max_results_per_task: 1_000,
            max_task_time_ms: 60_000,
            task_timeout_factor: 1.25,
        }
    }
}

impl ExpirationProperties {
    /// Derives the short-circuit thresholds from a call timeout: the rate
    /// check starts at half the budget and the hard stop sits at 97 % of it.
    pub fn for_call_timeout(call_timeout_ms: u64) -> Self {
        Self {
            call_timeout_ms,
            short_circuit_check_time_ms: call_timeout_ms / 2,
            short_circuit_timeout_ms: call_timeout_ms * 97 / 100,
        }
    }

    /// Client-facing deadline for one page request.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Elapsed time after which the result ratio is checked.
    pub fn short_circuit_check_time(&self) -> Duration {
        Duration::from_millis(self.short_circuit_check_time_ms)
    }

    /// Elapsed time after which a non-empty page is returned.
    pub fn short_circuit_timeout(&self) -> Duration {
        Duration::from_millis(self.short_circuit_timeout_ms)
    }
}

impl ExecutorProperties {
    /// Time after which a `Next` task stops pulling and re-checkpoints.
    pub fn task_deadline(&self) -> Duration {
        let millis = self.max_task_time_ms as f64 * self.task_timeout_factor;
        Duration::from_millis(millis.round() as u64)
    }
}

impl QueryProperties {
    /// Reads and validates properties from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            CairnError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&contents)
            .map_err(|err| CairnError::Config(format!("{}: {err}", path.display())))
    }

    /// Parses and validates properties from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let props: QueryProperties =
            toml::from_str(contents).map_err(|err| CairnError::Config(err.to_string()))?;
        props.validate()?;
        Ok(props)
    }

    /// Rejects combinations the runner cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.result_poll_rate_ms == 0 {
            return Err(CairnError::Config(
                "result_poll_rate_ms must be greater than zero".into(),
            ));
        }
        let exp = &self.expiration;
        if exp.call_timeout_ms == 0 {
            return Err(CairnError::Config(
                "expiration.call_timeout_ms must be greater than zero".into(),
            ));
        }
        if exp.short_circuit_check_time_ms > exp.short_circuit_timeout_ms {
            return Err(CairnError::Config(format!(
                "short circuit check time ({}ms) exceeds short circuit timeout ({}ms)",
                exp.short_circuit_check_time_ms, exp.short_circuit_timeout_ms
            )));
        }
        if self.executor.max_results_per_task == 0 {
            return Err(CairnError::Config(
                "executor.max_results_per_task must be greater than zero".into(),
            ));
        }
        if !(self.executor.task_timeout_factor.is_finite()
            && self.executor.task_timeout_factor >= 1.0)
        {
            return Err(CairnError::Config(
                "executor.task_timeout_factor must be a finite value >= 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Wait per receive attempt on the result queue.
    pub fn result_poll_rate(&self) -> Duration {
        Duration::from_millis(self.result_poll_rate_ms)
    }
}
