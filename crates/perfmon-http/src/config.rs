//! HTTP client configuration

use std::time::Duration;

/// Configuration for the collector client
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Default total request timeout (individual requests may override it)
    pub timeout: Duration,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Maximum idle connections per host
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout
    pub pool_idle_timeout: Duration,

    /// User-Agent header value
    pub user_agent: String,

    /// Enable gzip decompression of responses
    pub gzip: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            pool_max_idle_per_host: 4,
            pool_idle_timeout: Duration::from_secs(90),
            user_agent: format!("performance-monitor-sdk/{}", env!("CARGO_PKG_VERSION")),
            gzip: true,
        }
    }
}

impl HttpClientConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default total timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set timeout from seconds
    pub fn timeout_secs(mut self, secs: f64) -> Self {
        self.timeout = Duration::from_secs_f64(secs);
        self
    }

    /// Set max idle connections per host
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool_max_idle_per_host = max;
        self
    }

    /// Set the User-Agent header
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Capped exponential retry policy for deliveries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Number of retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry; doubles for each later retry
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// Total number of attempts, including the first one
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait before retry number `retry` (1-based).
    ///
    /// Retry 0 is the initial attempt and never waits.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(retry - 1));
        std::cmp::min(delay, self.max_delay)
    }

    /// Sum of every backoff delay the policy can sleep through
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_retries)
            .map(|retry| self.delay_for_retry(retry))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.user_agent.starts_with("performance-monitor-sdk/"));
    }

    #[test]
    fn test_builder_pattern() {
        let config = HttpClientConfig::new()
            .timeout_secs(2.5)
            .pool_max_idle_per_host(8)
            .user_agent("custom/1.0");

        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.pool_max_idle_per_host, 8);
        assert_eq!(config.user_agent, "custom/1.0");
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let retry = RetryConfig::exponential(10, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(retry.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for_retry(10), Duration::from_secs(10));
        assert_eq!(retry.delay_for_retry(40), Duration::from_secs(10));
    }

    #[test]
    fn test_retry_delays() {
        let retry = RetryConfig::exponential(3, Duration::from_secs(1), Duration::from_secs(3));

        assert_eq!(retry.total_attempts(), 4);
        assert_eq!(retry.delay_for_retry(0), Duration::ZERO);
        assert_eq!(retry.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for_retry(3), Duration::from_secs(3));
        assert_eq!(retry.total_backoff(), Duration::from_secs(6));
    }

    #[test]
    fn test_zero_retries_never_back_off() {
        let retry = RetryConfig::exponential(0, Duration::from_secs(1), Duration::from_secs(3));
        assert_eq!(retry.total_attempts(), 1);
        assert_eq!(retry.total_backoff(), Duration::ZERO);
    }
}
