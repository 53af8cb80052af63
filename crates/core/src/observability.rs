//! Logging bootstrap and log-field helpers

use std::time::Duration;

use tideguard_common::CommonError;
use tracing::{debug, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{ConfigError, LoggingConfig};
use crate::error::ExecutionError;

/// Filter directive variable; overrides `LoggingConfig::level`
pub const LOG_FILTER_ENV: &str = "TIDEGUARD_LOG";

/// Install the global `tracing` subscriber
///
/// The filter comes from `TIDEGUARD_LOG` when set, otherwise from
/// `config.level`. Output is JSON lines when `config.json` is true.
///
/// # Errors
/// Fails on an unparsable filter or when a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = match EnvFilter::try_from_env(LOG_FILTER_ENV) {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|err| CommonError::config_field("logging.level", err.to_string()))?,
    };

    let (plain, json) = if config.json {
        (None, Some(fmt::layer().json().with_current_span(false)))
    } else {
        (Some(fmt::layer().with_target(true)), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init()
        .map_err(|err| CommonError::internal_with_context(err.to_string(), "logging"))?;

    Ok(())
}

/// Convert an `ExecutionError` into a stable label suitable for logging.
#[inline]
pub fn error_label(error: &ExecutionError) -> &'static str {
    match error {
        ExecutionError::Transient { .. } => "transient",
        ExecutionError::Permanent { .. } => "permanent",
        ExecutionError::CircuitOpen { .. } => "circuit_open",
        ExecutionError::DeadlineExceeded { .. } => "deadline_exceeded",
        ExecutionError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
        ExecutionError::Cancelled { .. } => "cancelled",
        ExecutionError::ShutDown => "shut_down",
    }
}

/// Log the outcome of one executor call with structured fields.
#[inline]
pub fn log_batch_execution(
    group_key: &str,
    sequence: u64,
    batch_size: usize,
    failed: usize,
    elapsed: Duration,
) {
    let duration_ms = elapsed.as_millis() as u64;

    if failed == 0 {
        debug!(group_key, sequence, batch_size, duration_ms, "batch_execution_success");
    } else {
        warn!(group_key, sequence, batch_size, failed, duration_ms, "batch_execution_failure");
    }
}
