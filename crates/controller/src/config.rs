use std::time::Duration;

use polrep_core::CompositeKey;
use polrep_queue::ExponentialFailureRateLimiter;

pub const DEFAULT_QUEUE_NAME: &str = "report-request-controller";
pub const DEFAULT_RETRY_LIMIT: u32 = 10;

/// Runtime knobs for the report request controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub queue_name: String,
    /// Worker loops started by the binary; `Controller::run` takes its own count.
    pub workers: usize,
    /// Requeues allowed before an item is abandoned.
    pub retry_limit: u32,
    pub backoff_coefficient: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub store_shards: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            workers: 2,
            retry_limit: DEFAULT_RETRY_LIMIT,
            backoff_coefficient: 2,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_secs(1000),
            store_shards: polrep_store::DEFAULT_SHARDS,
        }
    }
}

impl ControllerConfig {
    pub fn rate_limiter(&self) -> ExponentialFailureRateLimiter<CompositeKey> {
        ExponentialFailureRateLimiter::new(self.backoff_coefficient, self.initial_backoff, self.max_backoff)
    }
}
