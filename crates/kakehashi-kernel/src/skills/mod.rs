//! Skill packages: resolve, load with retry, cache with TTL, run under a deadline.
//!
//! ```text
//! run_skill(name, params, timeout)
//!   ├─ purge expired cache entries
//!   ├─ resolve <root>/<name>/{index,main}.rhai      ── NotFound
//!   ├─ cache hit? else load, retrying with backoff   ── LoadError
//!   ├─ pick execute/main                             ── InvalidSkill
//!   └─ call on a blocking thread, bounded by timeout ── Timeout / RuntimeError
//! ```
//!
//! Every outcome, including early failures, is counted in [`ExecutionStats`]
//! before the [`SkillReport`] is returned.

mod cache;
mod error;
mod loader;
mod stats;

pub use cache::{DEFAULT_CACHE_TTL, SkillCache};
pub use error::SkillError;
pub use loader::{
    ENTRY_FILES, ENTRY_FUNCTIONS, EntryPoint, LoadedSkill, RhaiSkillLoader, SkillLoader,
    SkillPackage,
};
pub use stats::ExecutionStats;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kakehashi_types::{SkillReport, StatsSnapshot};
use parking_lot::Mutex;
use rhai::{Dynamic, Scope};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::engine::{EngineLimits, GuestFailure, OutputCapture, build_engine};
use crate::gateway::CallbackGateway;
use crate::host::{Deferred, HostBridge};
use crate::session::HOST_VAR;
use crate::value::{from_json, to_json};

/// Knobs for loading and running skills.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillSettings {
    pub root: PathBuf,
    pub cache_ttl: Duration,
    /// Load attempts before giving up (at least one is always made).
    pub max_retries: u32,
    /// Backoff before retry `n` is `retry_base_delay * 2^n`.
    pub retry_base_delay: Duration,
    pub limits: EngineLimits,
}

impl SkillSettings {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache_ttl: DEFAULT_CACHE_TTL,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            limits: EngineLimits::default(),
        }
    }
}

enum Invoked {
    Ready(Value),
    Deferred(Deferred),
}

/// Runs skills and keeps their cache and statistics.
pub struct SkillExecutor {
    settings: SkillSettings,
    loader: Arc<dyn SkillLoader>,
    cache: Mutex<SkillCache<Arc<LoadedSkill>>>,
    stats: Mutex<ExecutionStats>,
    gateway: Option<CallbackGateway>,
}

impl SkillExecutor {
    pub fn new(settings: SkillSettings) -> Self {
        let cache = SkillCache::new(settings.cache_ttl);
        Self {
            settings,
            loader: Arc::new(RhaiSkillLoader::new()),
            cache: Mutex::new(cache),
            stats: Mutex::new(ExecutionStats::default()),
            gateway: None,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn SkillLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Give skills a `host` handle and forward their output as logs.
    pub fn with_gateway(mut self, gateway: CallbackGateway) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn settings(&self) -> &SkillSettings {
        &self.settings
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.lock().snapshot()
    }

    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock();
        info!(entries = cache.len(), "clearing skill cache");
        cache.clear();
    }

    pub fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }

    /// Run one skill and report the outcome. Never fails; failures are reports.
    #[instrument(skip_all, name = "skill.run", fields(skill = %name, ?timeout))]
    pub async fn run_skill(
        &self,
        name: &str,
        params: Map<String, Value>,
        timeout: Duration,
    ) -> SkillReport {
        let started = Instant::now();
        let outcome = self.try_run(name, params, timeout).await;
        let elapsed = started.elapsed();
        self.stats.lock().record(outcome.is_ok(), elapsed);

        let seconds = elapsed.as_secs_f64();
        match outcome {
            Ok(value) => {
                debug!(seconds, "skill succeeded");
                SkillReport::success(name, value, seconds)
            }
            Err(err) => {
                warn!(error = %err, kind = %err.kind(), "skill failed");
                let report = SkillReport::failure(name, err.kind(), err.message(), seconds);
                match err.traceback() {
                    Some(trace) => report.with_traceback(trace),
                    None => report,
                }
            }
        }
    }

    async fn try_run(
        &self,
        name: &str,
        params: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, SkillError> {
        let skill = self.load_skill(name).await?;
        let entry = skill.entry_point().ok_or_else(|| SkillError::InvalidSkill {
            name: name.to_string(),
        })?;
        self.invoke(skill, entry, params, timeout).await
    }

    /// Resolve and load a skill, reusing a live cache entry.
    pub async fn load_skill(&self, name: &str) -> Result<Arc<LoadedSkill>, SkillError> {
        let now = Instant::now();
        let purged = self.cache.lock().purge_expired(now);
        if purged > 0 {
            debug!(purged, "expired skills purged");
        }

        let package = SkillPackage::resolve(&self.settings.root, name)?;

        if let Some(hit) = self.cache.lock().get(name, now) {
            debug!(skill = name, "skill cache hit");
            return Ok(hit);
        }

        let attempts = self.settings.max_retries.max(1);
        let mut attempt = 0;
        loop {
            match self.loader.load(&package) {
                Ok(skill) => {
                    let skill = Arc::new(skill);
                    self.cache
                        .lock()
                        .insert(name, Arc::clone(&skill), Instant::now());
                    info!(skill = name, attempt = attempt + 1, "skill loaded");
                    return Ok(skill);
                }
                Err(err) if attempt + 1 < attempts => {
                    let delay = self.settings.retry_base_delay * 2u32.saturating_pow(attempt);
                    warn!(skill = name, attempt = attempt + 1, ?delay, error = %err, "skill load failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(SkillError::Load {
                        name: name.to_string(),
                        attempts,
                        source: err,
                    });
                }
            }
        }
    }

    async fn invoke(
        &self,
        skill: Arc<LoadedSkill>,
        entry: EntryPoint,
        params: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, SkillError> {
        let name = skill.name.clone();
        let now = Instant::now();
        // Absurd timeouts saturate to a year rather than overflowing.
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 3600));
        let interrupted = Arc::new(AtomicBool::new(false));
        let capture = OutputCapture::default();
        let host = self
            .gateway
            .clone()
            .map(|gateway| HostBridge::new(gateway, Handle::current()));
        let limits = self.settings.limits.clone();

        let task = {
            let interrupted = Arc::clone(&interrupted);
            let capture = capture.clone();
            tokio::task::spawn_blocking(move || {
                call_entry(&skill, &entry, params, &limits, &capture, interrupted, host)
            })
        };

        let joined = tokio::time::timeout_at(deadline, task).await;
        self.forward_output(&capture);

        let invoked = match joined {
            Err(_) => {
                interrupted.store(true, Ordering::SeqCst);
                return Err(SkillError::Timeout {
                    name,
                    after: timeout,
                });
            }
            Ok(Err(join)) => {
                return Err(SkillError::Runtime {
                    name,
                    failure: GuestFailure {
                        message: join.to_string(),
                        trace: String::new(),
                    },
                });
            }
            Ok(Ok(result)) => result.map_err(|err| {
                if GuestFailure::is_interrupt(&err) {
                    SkillError::Timeout {
                        name: name.clone(),
                        after: timeout,
                    }
                } else {
                    SkillError::Runtime {
                        name: name.clone(),
                        failure: GuestFailure::from_eval(&err),
                    }
                }
            })?,
        };

        match invoked {
            Invoked::Ready(value) => Ok(value),
            Invoked::Deferred(deferred) => {
                match tokio::time::timeout_at(deadline, deferred.resolve()).await {
                    Err(_) => Err(SkillError::Timeout {
                        name,
                        after: timeout,
                    }),
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(SkillError::Runtime {
                        name,
                        failure: GuestFailure {
                            message: err.to_string(),
                            trace: String::new(),
                        },
                    }),
                }
            }
        }
    }

    fn forward_output(&self, capture: &OutputCapture) {
        let output = capture.take();
        if output.is_empty() {
            return;
        }
        match &self.gateway {
            Some(gateway) => {
                for line in output.log_lines() {
                    gateway.outbox().log(line);
                }
            }
            None => debug!(stdout = %output.stdout, stderr = %output.stderr, "skill output"),
        }
    }
}

fn call_entry(
    skill: &LoadedSkill,
    entry: &EntryPoint,
    params: Map<String, Value>,
    limits: &EngineLimits,
    capture: &OutputCapture,
    interrupted: Arc<AtomicBool>,
    host: Option<HostBridge>,
) -> Result<Invoked, Box<rhai::EvalAltResult>> {
    let engine = build_engine(limits, capture, interrupted);
    let mut scope = Scope::new();
    if let Some(host) = host {
        scope.push(HOST_VAR, host);
    }

    let value: Dynamic = if entry.takes_params {
        let params = from_json(&Value::Object(params))?;
        engine.call_fn(&mut scope, &skill.ast, entry.name, (params,))?
    } else {
        engine.call_fn(&mut scope, &skill.ast, entry.name, ())?
    };

    if value.is::<Deferred>() {
        Ok(Invoked::Deferred(value.cast::<Deferred>()))
    } else {
        Ok(Invoked::Ready(to_json(&value)))
    }
}
