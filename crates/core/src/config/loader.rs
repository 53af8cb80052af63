//! Configuration loader
//!
//! ## Loading Strategy
//! 1. If any `TIDEGUARD_*` tuning variable is set, build the config from the
//!    defaults plus those variables. A malformed value is an error; it does
//!    not fall through to the file.
//! 2. Otherwise load a config file: `TIDEGUARD_CONFIG` if set, else the first
//!    of `tideguard.toml` / `tideguard.json` found in the working directory or
//!    up to two parents.
//!
//! ## Environment Variables
//! - `TIDEGUARD_MAX_BATCH_SIZE`: members per batch
//! - `TIDEGUARD_MAX_BATCH_WINDOW_MS`: batch window in milliseconds
//! - `TIDEGUARD_FAILURE_THRESHOLD`: consecutive failures before opening
//! - `TIDEGUARD_RESET_TIMEOUT_MS`: open duration before a probe
//! - `TIDEGUARD_BASE_DELAY_MS` / `TIDEGUARD_MAX_DELAY_MS`: backoff bounds
//! - `TIDEGUARD_JITTER_FACTOR`: backoff jitter in `[0, 1]`
//! - `TIDEGUARD_MAX_RETRIES`: retries after the first attempt
//! - `TIDEGUARD_LOG_LEVEL`: default log filter
//! - `TIDEGUARD_LOG_JSON`: JSON log output (true/false)
//! - `TIDEGUARD_CONFIG`: explicit config file path
//!
//! Every loaded configuration is validated before it is returned.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tideguard_common::CommonError;

use super::{ConfigError, ExecutorConfig};

pub const ENV_MAX_BATCH_SIZE: &str = "TIDEGUARD_MAX_BATCH_SIZE";
pub const ENV_MAX_BATCH_WINDOW_MS: &str = "TIDEGUARD_MAX_BATCH_WINDOW_MS";
pub const ENV_FAILURE_THRESHOLD: &str = "TIDEGUARD_FAILURE_THRESHOLD";
pub const ENV_RESET_TIMEOUT_MS: &str = "TIDEGUARD_RESET_TIMEOUT_MS";
pub const ENV_BASE_DELAY_MS: &str = "TIDEGUARD_BASE_DELAY_MS";
pub const ENV_MAX_DELAY_MS: &str = "TIDEGUARD_MAX_DELAY_MS";
pub const ENV_JITTER_FACTOR: &str = "TIDEGUARD_JITTER_FACTOR";
pub const ENV_MAX_RETRIES: &str = "TIDEGUARD_MAX_RETRIES";
pub const ENV_LOG_LEVEL: &str = "TIDEGUARD_LOG_LEVEL";
pub const ENV_LOG_JSON: &str = "TIDEGUARD_LOG_JSON";
pub const ENV_CONFIG_PATH: &str = "TIDEGUARD_CONFIG";

const TUNING_VARS: [&str; 10] = [
    ENV_MAX_BATCH_SIZE,
    ENV_MAX_BATCH_WINDOW_MS,
    ENV_FAILURE_THRESHOLD,
    ENV_RESET_TIMEOUT_MS,
    ENV_BASE_DELAY_MS,
    ENV_MAX_DELAY_MS,
    ENV_JITTER_FACTOR,
    ENV_MAX_RETRIES,
    ENV_LOG_LEVEL,
    ENV_LOG_JSON,
];

const FILE_NAMES: [&str; 2] = ["tideguard.toml", "tideguard.json"];

/// Config file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    /// Detect the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            Some(other) => Err(ConfigError::UnsupportedFormat(other.to_string())),
            None => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Load configuration from the environment, falling back to a file
///
/// # Errors
/// - [`ConfigError::InvalidEnv`] if a variable is set but malformed
/// - [`ConfigError::NotFound`] if no variable is set and no file exists
/// - [`ConfigError::Common`] on parse or validation failures
pub fn load() -> Result<ExecutorConfig, ConfigError> {
    match load_from_env() {
        Ok(config) => {
            tracing::info!("configuration loaded from environment variables");
            Ok(config)
        }
        Err(ConfigError::EnvNotSet) => {
            tracing::debug!("no TIDEGUARD_* variables set, trying config file");
            load_from_file(None)
        }
        Err(err) => Err(err),
    }
}

/// Like [`load`], but an absent configuration yields the defaults
pub fn load_or_default() -> Result<ExecutorConfig, ConfigError> {
    match load() {
        Err(ConfigError::NotFound { searched }) => {
            tracing::debug!(searched = searched.len(), "no config file found, using defaults");
            Ok(ExecutorConfig::default())
        }
        other => other,
    }
}

/// Build configuration from the defaults plus `TIDEGUARD_*` variables
///
/// # Errors
/// [`ConfigError::EnvNotSet`] when none of the tuning variables is set.
pub fn load_from_env() -> Result<ExecutorConfig, ConfigError> {
    if !TUNING_VARS.iter().any(|var| std::env::var_os(var).is_some()) {
        return Err(ConfigError::EnvNotSet);
    }

    let mut config = ExecutorConfig::default();
    let defaults = &mut config.defaults;

    if let Some(size) = env_parse::<usize>(ENV_MAX_BATCH_SIZE)? {
        defaults.batch.max_batch_size = size;
    }
    if let Some(window) = env_millis(ENV_MAX_BATCH_WINDOW_MS)? {
        defaults.batch.max_batch_window = window;
    }
    if let Some(threshold) = env_parse::<u32>(ENV_FAILURE_THRESHOLD)? {
        defaults.circuit.failure_threshold = threshold;
    }
    if let Some(timeout) = env_millis(ENV_RESET_TIMEOUT_MS)? {
        defaults.circuit.reset_timeout = timeout;
    }
    if let Some(base) = env_millis(ENV_BASE_DELAY_MS)? {
        defaults.backoff.base_delay = base;
    }
    if let Some(max) = env_millis(ENV_MAX_DELAY_MS)? {
        defaults.backoff.max_delay = max;
    }
    if let Some(factor) = env_parse::<f64>(ENV_JITTER_FACTOR)? {
        defaults.backoff.jitter_factor = factor;
    }
    if let Some(retries) = env_parse::<u32>(ENV_MAX_RETRIES)? {
        defaults.retry.max_retries = retries;
    }
    if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
        config.logging.level = level;
    }
    if let Some(json) = env_bool(ENV_LOG_JSON)? {
        config.logging.json = json;
    }

    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// With `None`, `TIDEGUARD_CONFIG` is used if set, otherwise the standard
/// locations are probed.
pub fn load_from_file(path: Option<PathBuf>) -> Result<ExecutorConfig, ConfigError> {
    let config_path = match path.or_else(|| std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from)) {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::NotFound { searched: vec![path] });
            }
            path
        }
        None => {
            let candidates = candidate_paths();
            match candidates.iter().find(|path| path.exists()) {
                Some(path) => path.clone(),
                None => return Err(ConfigError::NotFound { searched: candidates }),
            }
        }
    };

    tracing::info!(path = %config_path.display(), "loading configuration from file");

    let format = Format::from_path(&config_path)?;
    let contents = std::fs::read_to_string(&config_path)?;
    load_from_str(&contents, format)
}

/// Parse and validate configuration text
pub fn load_from_str(contents: &str, format: Format) -> Result<ExecutorConfig, ConfigError> {
    let config: ExecutorConfig = match format {
        Format::Toml => toml::from_str(contents)?,
        Format::Json => serde_json::from_str(contents)?,
    };
    config.validate()?;
    Ok(config)
}

/// First existing config file in the standard locations
pub fn probe_config_paths() -> Option<PathBuf> {
    candidate_paths().into_iter().find(|path| path.exists())
}

fn candidate_paths() -> Vec<PathBuf> {
    let Ok(cwd) = std::env::current_dir() else {
        return Vec::new();
    };

    [cwd.clone(), cwd.join(".."), cwd.join("../..")]
        .iter()
        .flat_map(|dir| FILE_NAMES.iter().map(move |name| dir.join(name)))
        .collect()
}

fn env_parse<T>(var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) => value.trim().parse::<T>().map(Some).map_err(|err| ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
            reason: err.to_string(),
        }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::Common(
            CommonError::config_field(var, "value is not valid unicode"),
        )),
    }
}

fn env_millis(var: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(var)?.map(Duration::from_millis))
}

/// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn env_bool(var: &str) -> Result<Option<bool>, ConfigError> {
    let Ok(value) = std::env::var(var) else {
        return Ok(None);
    };

    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
            reason: "expected a boolean".to_string(),
        }),
    }
}
