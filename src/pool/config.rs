//! Pool configuration

use std::time::Duration;

/// Default number of workers the pool returns to when quiescent
pub const DEFAULT_BASELINE: usize = 10;

/// Default per-call deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Interval between scale-down ticks
pub const BACKOFF_PERIOD: Duration = Duration::from_millis(2500);

/// Worker pool configuration options
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Broker host the workers open their channels on
    pub host: String,

    /// Baseline worker count; the pool trims back to this when quiescent
    pub baseline: usize,

    /// Per-call deadline applied when the caller passes none
    pub default_timeout: Duration,

    /// Interval between trim ticks
    pub trim_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            baseline: DEFAULT_BASELINE,
            default_timeout: DEFAULT_TIMEOUT,
            trim_interval: BACKOFF_PERIOD,
        }
    }
}

impl PoolConfig {
    /// Config with a custom broker host
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Set the baseline worker count
    pub fn baseline(mut self, baseline: usize) -> Self {
        self.baseline = baseline;
        self
    }

    /// Set the default per-call deadline
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the trim-tick interval
    pub fn trim_interval(mut self, interval: Duration) -> Self {
        self.trim_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();

        assert_eq!(config.baseline, DEFAULT_BASELINE);
        assert_eq!(config.default_timeout, Duration::from_millis(5000));
        assert_eq!(config.trim_interval, Duration::from_millis(2500));
    }

    #[test]
    fn test_builder_chaining() {
        let config = PoolConfig::with_host("rabbit-1")
            .baseline(25)
            .default_timeout(Duration::from_secs(1))
            .trim_interval(Duration::from_millis(500));

        assert_eq!(config.host, "rabbit-1");
        assert_eq!(config.baseline, 25);
        assert_eq!(config.default_timeout, Duration::from_secs(1));
        assert_eq!(config.trim_interval, Duration::from_millis(500));
    }
}
