//! Configuration for replication runs.

use crate::error::{ReplicationError, ReplicationResult};
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Which way documents flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
}

impl Direction {
    /// Returns a stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning knobs for a replication strategy.
#[derive(Debug, Clone)]
pub struct StrategySettings {
    /// Maximum rows requested per changes-feed page (one page is one batch).
    pub changes_limit_per_batch: u32,
    /// Maximum batches processed by a single run.
    pub batch_limit_per_run: usize,
    /// Revisions fetched per bulk-get request.
    pub insert_batch_size: usize,
    /// Bulk-get requests in flight at once within a batch.
    pub worker_threads: usize,
    /// Retry behavior for failed fetches inside a batch.
    pub retry: RetryConfig,
}

impl StrategySettings {
    /// Creates the default settings.
    pub fn new() -> Self {
        Self {
            changes_limit_per_batch: 500,
            batch_limit_per_run: 100,
            insert_batch_size: 50,
            worker_threads: 4,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the changes-feed page size.
    pub fn with_changes_limit_per_batch(mut self, limit: u32) -> Self {
        self.changes_limit_per_batch = limit;
        self
    }

    /// Sets the maximum number of batches per run.
    pub fn with_batch_limit_per_run(mut self, limit: usize) -> Self {
        self.batch_limit_per_run = limit;
        self
    }

    /// Sets the bulk-get chunk size.
    pub fn with_insert_batch_size(mut self, size: usize) -> Self {
        self.insert_batch_size = size;
        self
    }

    /// Sets the fetch concurrency.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Rejects zero-sized limits.
    pub fn validate(&self) -> ReplicationResult<()> {
        let zero = [
            ("changes_limit_per_batch", self.changes_limit_per_batch == 0),
            ("batch_limit_per_run", self.batch_limit_per_run == 0),
            ("insert_batch_size", self.insert_batch_size == 0),
            ("worker_threads", self.worker_threads == 0),
            ("retry.max_attempts", self.retry.max_attempts == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((name, _)) => Err(ReplicationError::Configuration(format!(
                "{} must be greater than zero",
                name
            ))),
            None => Ok(()),
        }
    }
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
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
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
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

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
