//! Per-item failure rate limiting.

use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;

/// Decides how long a failed item waits before it is handed out again.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `item`; records one more failure.
    fn when(&self, item: &K) -> Duration;
    /// Clear failure bookkeeping for `item`.
    fn forget(&self, item: &K);
    /// Failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &K) -> u32;
}

/// `initial_interval * backoff_coefficient^failures`, capped at `maximum_interval`.
#[derive(Debug)]
pub struct ExponentialFailureRateLimiter<K> {
    backoff_coefficient: u32,
    initial_interval: Duration,
    maximum_interval: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K: Eq + Hash> ExponentialFailureRateLimiter<K> {
    pub fn new(backoff_coefficient: u32, initial_interval: Duration, maximum_interval: Duration) -> Self {
        Self {
            backoff_coefficient: backoff_coefficient.max(1),
            initial_interval,
            maximum_interval,
            failures: Mutex::new(FxHashMap::default()),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = (self.backoff_coefficient as f64).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_interval.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.maximum_interval.as_secs_f64() {
            self.maximum_interval
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl<K: Eq + Hash> Default for ExponentialFailureRateLimiter<K> {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<K: Eq + Hash + Clone + Send + Sync> RateLimiter<K> for ExponentialFailureRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let count = failures.entry(item.clone()).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        self.backoff(attempt)
    }

    fn forget(&self, item: &K) {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).get(item).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_then_caps() {
        let rl = ExponentialFailureRateLimiter::new(2, Duration::from_millis(5), Duration::from_millis(30));
        let k = "a".to_string();
        assert_eq!(rl.when(&k), Duration::from_millis(5));
        assert_eq!(rl.when(&k), Duration::from_millis(10));
        assert_eq!(rl.when(&k), Duration::from_millis(20));
        assert_eq!(rl.when(&k), Duration::from_millis(30));
        assert_eq!(rl.num_requeues(&k), 4);
    }

    #[test]
    fn forget_resets_to_initial_delay() {
        let rl = ExponentialFailureRateLimiter::<String>::default();
        let k = "a".to_string();
        rl.when(&k);
        rl.when(&k);
        rl.forget(&k);
        assert_eq!(rl.num_requeues(&k), 0);
        assert_eq!(rl.when(&k), Duration::from_millis(5));
    }

    #[test]
    fn items_are_tracked_independently() {
        let rl = ExponentialFailureRateLimiter::<String>::default();
        rl.when(&"a".to_string());
        assert_eq!(rl.num_requeues(&"b".to_string()), 0);
        assert_eq!(rl.when(&"b".to_string()), Duration::from_millis(5));
    }

    #[test]
    fn huge_attempt_counts_saturate_at_maximum() {
        let rl = ExponentialFailureRateLimiter::<String>::default();
        assert_eq!(rl.backoff(10_000), Duration::from_secs(1000));
    }
}
