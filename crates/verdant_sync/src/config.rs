//! Configuration for the sync layer.

use rand::Rng;
use std::time::Duration;
use verdant_core::QueueConfig;
use verdant_protocol::UserId;

/// Configuration for the sync layer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// The signed-in user; push events from this user are ignored.
    pub local_user_id: UserId,
    /// Maximum number of concurrent write requests.
    pub worker_count: usize,
    /// Timeout for a single write request.
    pub request_timeout: Duration,
    /// Retry policy for writes and reconnects.
    pub retry: RetryConfig,
    /// Push channel settings.
    pub push: PushConfig,
    /// Queue settings.
    pub queue: QueueConfig,
}

impl SyncConfig {
    /// Creates a configuration for the given user.
    pub fn new(local_user_id: impl Into<UserId>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            worker_count: 4,
            request_timeout: Duration::from_secs(15),
            retry: RetryConfig::default(),
            push: PushConfig::default(),
            queue: QueueConfig::default(),
        }
    }

    /// Sets the worker count.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the push configuration.
    pub fn with_push(mut self, push: PushConfig) -> Self {
        self.push = push;
        self
    }

    /// Sets the queue configuration.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt before a write is parked.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Relative jitter applied to each delay (0.2 = ±20%).
    pub jitter: f64,
}

impl RetryConfig {
    /// Creates a configuration with the given retry budget.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Retries without waiting. For tests.
    pub fn immediate() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
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

    /// Sets the relative jitter, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Returns true once `failures` failed attempts used up the budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures > self.max_retries
    }

    /// Calculates the delay before retry number `attempt` (1-indexed).
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`,
    /// then spread by up to ±`jitter`. The spread result never exceeds
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        let capped = base.min(max);

        let factor = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).clamp(0.0, max))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Configuration for the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConfig {
    /// Events buffered between the channel and the reconciler. When full,
    /// the oldest buffered event is dropped.
    pub backlog_capacity: usize,
    /// Consecutive failed reconnects before the offline indicator is raised.
    pub offline_after_failures: u32,
}

impl PushConfig {
    /// Sets the backlog capacity.
    pub fn with_backlog_capacity(mut self, capacity: usize) -> Self {
        self.backlog_capacity = capacity.max(1);
        self
    }

    /// Sets the offline threshold.
    pub fn with_offline_after_failures(mut self, failures: u32) -> Self {
        self.offline_after_failures = failures.max(1);
        self
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: 256,
            offline_after_failures: 3,
        }
    }
}
