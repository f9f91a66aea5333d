//! Configuration for the platform-side sync machinery.

use edgesync_protocol::{SortDirection, SortOrder};
use rand::Rng;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive failures after which an edge is reported degraded.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with immediate retries, useful in tests.
    pub fn immediate() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% on top
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Configuration for one edge's downlink sender.
#[derive(Debug, Clone)]
pub struct DownlinkConfig {
    /// Maximum events per batch.
    pub batch_size: usize,
    /// How long an idle sender waits for an append before polling again.
    pub poll_interval: Duration,
    /// How long to wait for a batch acknowledgment.
    pub ack_timeout: Duration,
    /// Retry configuration; `max_attempts` is the degraded threshold.
    pub retry: RetryConfig,
}

impl DownlinkConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the batch size. Clamped to at least 1.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the ack timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Consecutive failures after which the edge is degraded.
    pub fn degraded_threshold(&self) -> u32 {
        self.retry.max_attempts.max(1)
    }
}

impl Default for DownlinkConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for bulk fetches.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Entities requested per page.
    pub page_size: u32,
    /// Sort order sent with every page request.
    pub sort_order: SortOrder,
}

impl FetchConfig {
    /// Creates a configuration sorted by ascending id.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
            sort_order: SortOrder::new("id", SortDirection::Asc),
        }
    }

    /// Sets the sort order.
    pub fn with_sort_order(mut self, sort_order: SortOrder) -> Self {
        self.sort_order = sort_order;
        self
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Scope at which ownership is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnershipGranularity {
    /// All edges of a tenant are owned by the same node.
    Tenant,
    /// Each edge is placed independently.
    #[default]
    Edge,
}

/// Configuration for the partition router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Number of virtual partitions keys are hashed into.
    pub partitions: u32,
    /// Ownership scope.
    pub granularity: OwnershipGranularity,
}

impl RouterConfig {
    /// Creates a configuration with the given partition count.
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            granularity: OwnershipGranularity::default(),
        }
    }

    /// Sets the ownership granularity.
    pub fn with_granularity(mut self, granularity: OwnershipGranularity) -> Self {
        self.granularity = granularity;
        self
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Configuration for the gateway dashboard resource sync.
#[derive(Debug, Clone)]
pub struct ResourceSyncConfig {
    /// Whether the job runs at all.
    pub enabled: bool,
    /// Repository to pull from.
    pub repository_url: String,
    /// Branch to pull.
    pub branch: String,
    /// Interval between runs.
    pub fetch_frequency: Duration,
}

impl ResourceSyncConfig {
    /// Creates an enabled configuration for a repository.
    pub fn new(repository_url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            repository_url: repository_url.into(),
            branch: "main".into(),
            fetch_frequency: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// A configuration that registers nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new("")
        }
    }

    /// Sets the branch.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Sets the fetch frequency.
    pub fn with_fetch_frequency(mut self, frequency: Duration) -> Self {
        self.fetch_frequency = frequency;
        self
    }
}

impl Default for ResourceSyncConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downlink_config_builder() {
        let config = DownlinkConfig::new()
            .with_batch_size(0)
            .with_ack_timeout(Duration::from_secs(2))
            .with_retry(RetryConfig::new(7));

        assert_eq!(config.batch_size, 1);
        assert_eq!(config.ack_timeout, Duration::from_secs(2));
        assert_eq!(config.degraded_threshold(), 7);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn resource_sync_defaults() {
        let config = ResourceSyncConfig::new("https://github.com/thingsboard/gateway-dashboard.git");
        assert!(config.enabled);
        assert_eq!(config.branch, "main");
        assert_eq!(config.fetch_frequency, Duration::from_secs(86_400));
        assert!(!ResourceSyncConfig::default().enabled);
    }

    #[test]
    fn router_defaults_to_edge_granularity() {
        let config = RouterConfig::new(0);
        assert_eq!(config.partitions, 1);
        assert_eq!(config.granularity, OwnershipGranularity::Edge);
    }
}
