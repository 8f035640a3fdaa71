//! Layered pipeline configuration.
//!
//! Values resolve in this order: runtime override, environment, default.
//! Callers resolve once per operation with [`ConfigResolver::resolve`] and
//! carry the resulting [`PipelineSettings`] through that operation.

use std::sync::RwLock;
use std::time::Duration;

use tracing::{debug, warn};

use crate::defaults;

/// `base * 2^(attempt-1)`, capped at `max`.
pub fn exponential_backoff(base: Duration, max: Duration, attempt: i32) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 16) as u32;
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

/// Fully resolved settings for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Items per job / AI request.
    pub batch_size: usize,
    /// Handler invocations allowed per `rate_limit_window`.
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    /// Concurrent handler invocations per queue worker.
    pub worker_concurrency: usize,
    /// Attempts before a job is failed (first run included).
    pub max_attempts: i32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Idle worker safety-net poll.
    pub poll_interval: Duration,
    pub watchdog_interval: Duration,
    /// Largest id list accepted by the immediate path.
    pub immediate_max: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            rate_limit_max: defaults::RATE_LIMIT_MAX,
            rate_limit_window: Duration::from_secs(defaults::RATE_LIMIT_WINDOW_SECS),
            worker_concurrency: defaults::WORKER_CONCURRENCY,
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(defaults::BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(defaults::BACKOFF_MAX_MS),
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            watchdog_interval: Duration::from_secs(defaults::WATCHDOG_INTERVAL_SECS),
            immediate_max: defaults::IMMEDIATE_MAX,
        }
    }
}

impl PipelineSettings {
    /// Number of jobs needed for `pending` items.
    pub fn jobs_for(&self, pending: usize) -> usize {
        pending.div_ceil(self.batch_size)
    }

    /// Retry delay after the given (1-based) attempt failed.
    pub fn backoff_for(&self, attempt: i32) -> Duration {
        exponential_backoff(self.backoff_base, self.backoff_max, attempt)
    }

    /// Clamp values into ranges the pipeline can honor.
    fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.clamp(1, defaults::MAX_BATCH_SIZE);
        self.rate_limit_max = self.rate_limit_max.max(1);
        if self.rate_limit_window.is_zero() {
            self.rate_limit_window = Duration::from_secs(defaults::RATE_LIMIT_WINDOW_SECS);
        }
        self.worker_concurrency = self.worker_concurrency.max(1);
        self.max_attempts = self.max_attempts.max(1);
        self.immediate_max = self.immediate_max.clamp(1, defaults::IMMEDIATE_MAX);
        self
    }
}

/// Partial settings; `None` defers to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverride {
    pub batch_size: Option<usize>,
    pub rate_limit_max: Option<u32>,
    pub rate_limit_window: Option<Duration>,
    pub worker_concurrency: Option<usize>,
    pub max_attempts: Option<i32>,
    pub backoff_base: Option<Duration>,
    pub backoff_max: Option<Duration>,
    pub poll_interval: Option<Duration>,
    pub watchdog_interval: Option<Duration>,
    pub immediate_max: Option<usize>,
}

impl SettingsOverride {
    /// Read settings from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `PIPELINE_BATCH_SIZE` | `10` |
    /// | `PIPELINE_RATE_LIMIT_MAX` | `10` |
    /// | `PIPELINE_RATE_LIMIT_WINDOW_SECS` | `60` |
    /// | `PIPELINE_WORKER_CONCURRENCY` | `1` |
    /// | `PIPELINE_MAX_ATTEMPTS` | `3` |
    /// | `PIPELINE_BACKOFF_BASE_MS` | `5000` |
    /// | `PIPELINE_BACKOFF_MAX_MS` | `300000` |
    /// | `PIPELINE_POLL_INTERVAL_MS` | `1000` |
    /// | `PIPELINE_WATCHDOG_INTERVAL_SECS` | `60` |
    /// | `PIPELINE_IMMEDIATE_MAX` | `20` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse::<T>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring unparseable configuration value");
                    None
                }
            }
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        Self {
            batch_size: parsed(lookup, "PIPELINE_BATCH_SIZE"),
            rate_limit_max: parsed(lookup, "PIPELINE_RATE_LIMIT_MAX"),
            rate_limit_window: parsed(lookup, "PIPELINE_RATE_LIMIT_WINDOW_SECS")
                .map(Duration::from_secs),
            worker_concurrency: parsed(lookup, "PIPELINE_WORKER_CONCURRENCY"),
            max_attempts: parsed(lookup, "PIPELINE_MAX_ATTEMPTS"),
            backoff_base: parsed(lookup, "PIPELINE_BACKOFF_BASE_MS").map(Duration::from_millis),
            backoff_max: parsed(lookup, "PIPELINE_BACKOFF_MAX_MS").map(Duration::from_millis),
            poll_interval: parsed(lookup, "PIPELINE_POLL_INTERVAL_MS").map(Duration::from_millis),
            watchdog_interval: parsed(lookup, "PIPELINE_WATCHDOG_INTERVAL_SECS")
                .map(Duration::from_secs),
            immediate_max: parsed(lookup, "PIPELINE_IMMEDIATE_MAX"),
        }
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Set the rate limit as `max` invocations per `window`.
    pub fn with_rate_limit(mut self, max: u32, window: Duration) -> Self {
        self.rate_limit_max = Some(max);
        self.rate_limit_window = Some(window);
        self
    }

    /// Set retry attempts and backoff bounds.
    pub fn with_retry(mut self, max_attempts: i32, base: Duration, max: Duration) -> Self {
        self.max_attempts = Some(max_attempts);
        self.backoff_base = Some(base);
        self.backoff_max = Some(max);
        self
    }

    /// Set worker concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = Some(concurrency);
        self
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set the watchdog interval.
    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = Some(interval);
        self
    }

    /// Fill every unset field from `base`.
    fn apply_to(&self, base: PipelineSettings) -> PipelineSettings {
        PipelineSettings {
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            rate_limit_max: self.rate_limit_max.unwrap_or(base.rate_limit_max),
            rate_limit_window: self.rate_limit_window.unwrap_or(base.rate_limit_window),
            worker_concurrency: self.worker_concurrency.unwrap_or(base.worker_concurrency),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            backoff_base: self.backoff_base.unwrap_or(base.backoff_base),
            backoff_max: self.backoff_max.unwrap_or(base.backoff_max),
            poll_interval: self.poll_interval.unwrap_or(base.poll_interval),
            watchdog_interval: self.watchdog_interval.unwrap_or(base.watchdog_interval),
            immediate_max: self.immediate_max.unwrap_or(base.immediate_max),
        }
    }
}

/// Resolves [`PipelineSettings`] from runtime override, environment, defaults.
#[derive(Debug, Default)]
pub struct ConfigResolver {
    environment: SettingsOverride,
    runtime: RwLock<SettingsOverride>,
}

impl ConfigResolver {
    /// Resolver whose environment layer is the given snapshot.
    pub fn new(environment: SettingsOverride) -> Self {
        Self {
            environment,
            runtime: RwLock::new(SettingsOverride::default()),
        }
    }

    /// Resolver whose environment layer is read from the process environment.
    pub fn from_env() -> Self {
        Self::new(SettingsOverride::from_env())
    }

    /// Replace the runtime override layer.
    pub fn set_override(&self, runtime: SettingsOverride) {
        debug!(?runtime, "Runtime configuration override set");
        match self.runtime.write() {
            Ok(mut guard) => *guard = runtime,
            Err(poisoned) => *poisoned.into_inner() = runtime,
        }
    }

    /// Drop the runtime override layer.
    pub fn clear_override(&self) {
        self.set_override(SettingsOverride::default());
    }

    /// Merge the layers into concrete settings.
    pub fn resolve(&self) -> PipelineSettings {
        let runtime = match self.runtime.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        runtime
            .apply_to(self.environment.apply_to(PipelineSettings::default()))
            .normalized()
    }
}
