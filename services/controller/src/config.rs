//! Configuration for the controller.

use std::time::Duration;

use anyhow::Result;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval between periodic full reconciliation scans.
    pub reconcile_interval: Duration,

    /// Interval between runtime probe sweeps feeding the health monitor.
    pub health_poll_interval: Duration,

    /// Timeout applied to every runtime call.
    pub runtime_timeout: Duration,

    /// Retry budget per instance before escalating to an alert.
    pub max_retries: u32,

    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,

    /// Ceiling on the retry delay.
    pub backoff_cap: Duration,

    /// Consecutive missed liveness observations before Ready flips to
    /// Failed.
    pub liveness_miss_threshold: u32,

    /// How long a rollout may go without progress before it is reported
    /// as stalled.
    pub rollout_stall_budget: Duration,

    /// Revision history entries retained per workload.
    pub revision_retention: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
            health_poll_interval: Duration::from_secs(2),
            runtime_timeout: Duration::from_secs(10),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            liveness_miss_threshold: 3,
            rollout_stall_budget: Duration::from_secs(120),
            revision_retention: 10,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from `FLEET_*` environment variables, with
    /// defaults for everything not set.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            reconcile_interval: env_secs("FLEET_RECONCILE_INTERVAL", defaults.reconcile_interval),
            health_poll_interval: env_secs(
                "FLEET_HEALTH_POLL_INTERVAL",
                defaults.health_poll_interval,
            ),
            runtime_timeout: env_millis("FLEET_RUNTIME_TIMEOUT_MS", defaults.runtime_timeout),
            max_retries: env_parse("FLEET_MAX_RETRIES", defaults.max_retries),
            backoff_base: env_millis("FLEET_BACKOFF_BASE_MS", defaults.backoff_base),
            backoff_cap: env_millis("FLEET_BACKOFF_CAP_MS", defaults.backoff_cap),
            liveness_miss_threshold: env_parse(
                "FLEET_LIVENESS_MISS_THRESHOLD",
                defaults.liveness_miss_threshold,
            ),
            rollout_stall_budget: env_secs(
                "FLEET_ROLLOUT_STALL_BUDGET",
                defaults.rollout_stall_budget,
            ),
            revision_retention: env_parse("FLEET_REVISION_RETENTION", defaults.revision_retention),
            log_level: std::env::var("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
