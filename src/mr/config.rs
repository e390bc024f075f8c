use std::{env, time::Duration};

/// Timing knobs of the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How long a worker may hold a task before it goes back to pending
    pub dispatch_timeout: Duration,
    /// Period of the liveness probe loop
    pub probe_interval: Duration,
    /// Upper bound on a single ping
    pub probe_timeout: Duration,
    /// Period of the fallback scheduling pass, passes are otherwise driven by task events
    pub schedule_interval: Duration,
    /// A task dispatched more often than this is reported as stuck
    pub retry_warning_threshold: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            schedule_interval: Duration::from_millis(200),
            retry_warning_threshold: 3,
        }
    }
}

impl CoordinatorConfig {
    /// Defaults, overridden by the `MR_*` environment variables that are set and parse
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |name: &str, fallback: Duration| {
            lookup(name)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            dispatch_timeout: millis("MR_DISPATCH_TIMEOUT_MS", defaults.dispatch_timeout),
            probe_interval: millis("MR_PROBE_INTERVAL_MS", defaults.probe_interval),
            probe_timeout: millis("MR_PROBE_TIMEOUT_MS", defaults.probe_timeout),
            schedule_interval: millis("MR_SCHEDULE_INTERVAL_MS", defaults.schedule_interval),
            retry_warning_threshold: lookup("MR_RETRY_WARNING")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retry_warning_threshold),
        }
    }
}
