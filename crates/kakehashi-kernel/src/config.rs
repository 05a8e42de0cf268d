//! Rhai-driven worker configuration.
//!
//! Evaluates a `worker.rhai` script and reads well-known top-level variables
//! from the resulting scope. Anything not set keeps its default.
//!
//! ```rhai
//! let skills_root = "~/.local/share/kakehashi/skills";
//! let cache_ttl_secs = 3600;
//! let max_retries = 3;
//! let retry_base_delay_ms = 100;
//! let callback_timeout_secs = 30;
//! let default_skill_timeout_secs = 30;
//! let max_operations = 0;        // 0 = unlimited
//! let shutdown_grace_ms = 5000;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use rhai::{Dynamic, Scope};
use thiserror::Error;

use crate::engine::EngineLimits;
use crate::gateway::DEFAULT_CALLBACK_TIMEOUT;
use crate::skills::{DEFAULT_CACHE_TTL, SkillSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker.rhai parse error: {0}")]
    Parse(String),

    #[error("worker.rhai eval error: {0}")]
    Eval(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Everything the worker needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub skills_root: PathBuf,
    pub cache_ttl: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub callback_timeout: Duration,
    pub default_skill_timeout: Duration,
    pub max_operations: u64,
    /// How long in-flight requests may finish after the read loop ends.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            skills_root: PathBuf::from("skills"),
            cache_ttl: DEFAULT_CACHE_TTL,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            default_skill_timeout: Duration::from_secs(30),
            max_operations: 0,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn engine_limits(&self) -> EngineLimits {
        EngineLimits {
            max_operations: self.max_operations,
        }
    }

    pub fn skill_settings(&self) -> SkillSettings {
        SkillSettings {
            root: self.skills_root.clone(),
            cache_ttl: self.cache_ttl,
            max_retries: self.max_retries,
            retry_base_delay: self.retry_base_delay,
            limits: self.engine_limits(),
        }
    }
}

/// Parse a `worker.rhai` script on top of the defaults.
pub fn load_worker_config(script: &str) -> Result<WorkerConfig, ConfigError> {
    let engine = rhai::Engine::new();
    let ast = engine
        .compile(script)
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut scope = Scope::new();
    engine
        .run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| ConfigError::Eval(e.to_string()))?;
    extract_config(&scope)
}

/// Read and parse a config file.
pub fn load_worker_config_file(path: &Path) -> Result<WorkerConfig, ConfigError> {
    let script = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_worker_config(&script)
}

/// Expand `~` and `$VARS` in a configured path.
pub fn expand_path(raw: &str) -> PathBuf {
    let expanded = shellexpand::full(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| shellexpand::tilde(raw).into_owned());
    let path = PathBuf::from(expanded);
    dunce::canonicalize(&path).unwrap_or(path)
}

fn extract_config(scope: &Scope) -> Result<WorkerConfig, ConfigError> {
    let mut config = WorkerConfig::default();

    if let Some(value) = scope.get_value::<Dynamic>("skills_root") {
        let raw = value
            .into_string()
            .map_err(|ty| ConfigError::InvalidValue {
                field: "skills_root",
                reason: format!("expected string, got {ty}"),
            })?;
        config.skills_root = expand_path(&raw);
    }
    if let Some(secs) = seconds(scope, "cache_ttl_secs")? {
        config.cache_ttl = secs;
    }
    if let Some(n) = count(scope, "max_retries")? {
        config.max_retries = u32::try_from(n).map_err(|_| ConfigError::InvalidValue {
            field: "max_retries",
            reason: format!("{n} is too large"),
        })?;
    }
    if let Some(ms) = count(scope, "retry_base_delay_ms")? {
        config.retry_base_delay = Duration::from_millis(ms);
    }
    if let Some(secs) = seconds(scope, "callback_timeout_secs")? {
        config.callback_timeout = secs;
    }
    if let Some(secs) = seconds(scope, "default_skill_timeout_secs")? {
        config.default_skill_timeout = secs;
    }
    if let Some(n) = count(scope, "max_operations")? {
        config.max_operations = n;
    }
    if let Some(ms) = count(scope, "shutdown_grace_ms")? {
        config.shutdown_grace = Duration::from_millis(ms);
    }

    Ok(config)
}

/// A non-negative integer variable.
fn count(scope: &Scope, field: &'static str) -> Result<Option<u64>, ConfigError> {
    let Some(value) = scope.get_value::<Dynamic>(field) else {
        return Ok(None);
    };
    let n = value.as_int().map_err(|ty| ConfigError::InvalidValue {
        field,
        reason: format!("expected integer, got {ty}"),
    })?;
    u64::try_from(n)
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            field,
            reason: format!("{n} is negative"),
        })
}

/// A non-negative number of seconds, integer or float.
fn seconds(scope: &Scope, field: &'static str) -> Result<Option<Duration>, ConfigError> {
    let Some(value) = scope.get_value::<Dynamic>(field) else {
        return Ok(None);
    };
    let secs = match (value.as_int(), value.as_float()) {
        (Ok(i), _) => i as f64,
        (_, Ok(f)) => f,
        _ => {
            return Err(ConfigError::InvalidValue {
                field,
                reason: format!("expected number, got {}", value.type_name()),
            });
        }
    };
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            field,
            reason: e.to_string(),
        })
}
