use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Tunables for the computer scheduler.
///
/// Latency and minimum period are given for a single worker thread and are
/// scaled by [`SchedulerConfig::scale_factor`] for larger pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads. 0 = available parallelism.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Target latency between two tasks on one machine, in milliseconds.
    ///
    /// An average game tick takes 50ms, so a couple of events should be
    /// handled within that window.
    #[serde(default = "default_latency")]
    pub latency_ms: u64,
    /// The smallest slice a task can be given, in milliseconds. Almost all
    /// machines finish well under this.
    #[serde(default = "default_min_period")]
    pub min_period_ms: u64,
    /// How often the monitor wakes when the pool is not contended.
    #[serde(default = "default_monitor_wakeup")]
    pub monitor_wakeup_ms: u64,
    /// Time a task may run before it is soft aborted.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Grace period after a soft abort before the task is hard aborted.
    #[serde(default = "default_abort_timeout")]
    pub abort_timeout_ms: u64,
    /// Minimum gap between two timeout reports from the same worker.
    #[serde(default = "default_report_debounce")]
    pub report_debounce_ms: u64,
    /// Scaled periods added to a computer's first run so new machines do
    /// not leapfrog established ones. Tuned from observed workloads.
    #[serde(default = "default_new_executor_penalty")]
    pub new_executor_penalty_periods: u32,
    /// Sleepers are requeued `latency / divisor` below the minimum virtual
    /// runtime. Tuned from observed workloads.
    #[serde(default = "default_sleeper_bonus_divisor")]
    pub sleeper_bonus_divisor: u64,
}

fn default_worker_threads() -> usize { 1 }
fn default_latency() -> u64 { 50 }
fn default_min_period() -> u64 { 5 }
fn default_monitor_wakeup() -> u64 { 100 }
fn default_timeout() -> u64 { 7000 }
fn default_abort_timeout() -> u64 { 1500 }
fn default_report_debounce() -> u64 { 1000 }
fn default_new_executor_penalty() -> u32 { 1 }
fn default_sleeper_bonus_divisor() -> u64 { 2 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            latency_ms: default_latency(),
            min_period_ms: default_min_period(),
            monitor_wakeup_ms: default_monitor_wakeup(),
            timeout_ms: default_timeout(),
            abort_timeout_ms: default_abort_timeout(),
            report_debounce_ms: default_report_debounce(),
            new_executor_penalty_periods: default_new_executor_penalty(),
            sleeper_bonus_divisor: default_sleeper_bonus_divisor(),
        }
    }
}

impl SchedulerConfig {
    /// Config with defaults and the given pool size.
    pub fn with_threads(worker_threads: usize) -> Self {
        Self { worker_threads, ..Self::default() }
    }

    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `VMSCHED_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_opt("VMSCHED_PROFILE").unwrap_or_default().to_uppercase();
        Self::from_env_profiled(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn from_env_profiled(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            worker_threads: profiled_env_usize(p, "VMSCHED_WORKER_THREADS", default_worker_threads()),
            latency_ms: profiled_env_u64(p, "VMSCHED_LATENCY_MS", default_latency()),
            min_period_ms: profiled_env_u64(p, "VMSCHED_MIN_PERIOD_MS", default_min_period()),
            monitor_wakeup_ms: profiled_env_u64(p, "VMSCHED_MONITOR_WAKEUP_MS", default_monitor_wakeup()),
            timeout_ms: profiled_env_u64(p, "VMSCHED_TIMEOUT_MS", default_timeout()),
            abort_timeout_ms: profiled_env_u64(p, "VMSCHED_ABORT_TIMEOUT_MS", default_abort_timeout()),
            report_debounce_ms: profiled_env_u64(p, "VMSCHED_REPORT_DEBOUNCE_MS", default_report_debounce()),
            new_executor_penalty_periods: profiled_env_u32(
                p,
                "VMSCHED_NEW_EXECUTOR_PENALTY_PERIODS",
                default_new_executor_penalty(),
            ),
            sleeper_bonus_divisor: profiled_env_u64(
                p,
                "VMSCHED_SLEEPER_BONUS_DIVISOR",
                default_sleeper_bonus_divisor(),
            ),
        }
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.latency_ms == 0 {
            return Err(ConfigError::Invalid("latency_ms must be positive".into()));
        }
        if self.min_period_ms == 0 || self.min_period_ms > self.latency_ms {
            return Err(ConfigError::Invalid(format!(
                "min_period_ms must be in 1..={}, got {}",
                self.latency_ms, self.min_period_ms
            )));
        }
        if self.timeout_ms == 0 || self.abort_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if self.monitor_wakeup_ms == 0 {
            return Err(ConfigError::Invalid("monitor_wakeup_ms must be positive".into()));
        }
        if self.sleeper_bonus_divisor == 0 {
            return Err(ConfigError::Invalid("sleeper_bonus_divisor must be positive".into()));
        }
        Ok(())
    }

    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }

    /// `1 + floor(log2(threads))`. More threads can afford longer slices.
    pub fn scale_factor(&self) -> u32 {
        let threads = self.resolved_worker_threads().max(1);
        usize::BITS - threads.leading_zeros()
    }

    /// Scaled target latency.
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms) * self.scale_factor()
    }

    /// Scaled minimum period.
    pub fn min_period(&self) -> Duration {
        Duration::from_millis(self.min_period_ms) * self.scale_factor()
    }

    pub fn monitor_wakeup(&self) -> Duration {
        Duration::from_millis(self.monitor_wakeup_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    pub fn report_debounce(&self) -> Duration {
        Duration::from_millis(self.report_debounce_ms)
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Scheduler config:");
        tracing::info!(
            "  threads:  {} (scale factor {})",
            self.resolved_worker_threads(),
            self.scale_factor()
        );
        tracing::info!(
            "  latency:  {:?} (min period {:?})",
            self.latency(),
            self.min_period()
        );
        tracing::info!(
            "  timeouts: soft={:?}, abort grace={:?}, monitor={:?}",
            self.timeout(),
            self.abort_timeout(),
            self.monitor_wakeup()
        );
    }

    /// JSON view for status endpoints and the soak report.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "threads": self.resolved_worker_threads(),
            "scale_factor": self.scale_factor(),
            "latency_ms": self.latency().as_millis() as u64,
            "min_period_ms": self.min_period().as_millis() as u64,
            "timeout_ms": self.timeout_ms,
            "abort_timeout_ms": self.abort_timeout_ms,
        })
    }
}
