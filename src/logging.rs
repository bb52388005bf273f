//! Global `tracing` subscriber setup for hosts embedding the executor.

use crate::types::{CairnError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber with an explicit filter directive, e.g.
/// `"info,cairn::runner=debug"`.
pub fn init_logging(filter: &str) -> Result<()> {
    install(parse_filter(filter)?)
}

/// Installs the global subscriber from `RUST_LOG`, falling back to
/// `default_filter` when the variable is unset.
pub fn init_logging_from_env(default_filter: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(default_filter)?,
    };
    install(filter)
}

fn parse_filter(filter: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(filter)
        .map_err(|e| CairnError::Config(format!("invalid log filter '{filter}': {e}")))
}

fn install(filter: EnvFilter) -> Result<()> {
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| CairnError::Config("logging already initialized".into()))
}
