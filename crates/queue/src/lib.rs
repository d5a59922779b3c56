//! Rate-limited, deduplicating work queue.
//!
//! An item is pending at most once: adding an item that is already queued is
//! a no-op, and an item added while a worker holds it is parked until that
//! worker calls [`RateLimitingQueue::done`]. This gives at-most-one in-flight
//! processing per item without any per-item locking on the caller side.

#![forbid(unsafe_code)]

pub mod limiter;

pub use limiter::{ExponentialFailureRateLimiter, RateLimiter};

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Queue capabilities the report controller depends on.
#[async_trait]
pub trait RateLimitingQueue<K: Send + 'static>: Send + Sync {
    /// Enqueue unless already pending.
    fn add(&self, item: K);
    /// Wait for the next item. `None` once the queue is shutting down.
    async fn get(&self) -> Option<K>;
    /// Mark an item returned by `get` as no longer in flight.
    fn done(&self, item: &K);
    fn add_after(&self, item: K, delay: Duration);
    /// Re-enqueue after the rate limiter's delay for this item.
    fn add_rate_limited(&self, item: K);
    /// Reset the rate limiter's bookkeeping for this item.
    fn forget(&self, item: &K);
    fn num_requeues(&self, item: &K) -> u32;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool { self.len() == 0 }
    fn shut_down(&self);
    fn is_shutting_down(&self) -> bool;
}

struct State<K> {
    queue: VecDeque<K>,
    /// Items that need processing (queued, or re-added while in flight).
    dirty: FxHashSet<K>,
    /// Items currently held by a worker.
    processing: FxHashSet<K>,
    shutting_down: bool,
}

struct Inner<K, R> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: R,
    delayed: CancellationToken,
}

/// Default [`RateLimitingQueue`] implementation. Cheap to clone.
pub struct WorkQueue<K, R = ExponentialFailureRateLimiter<K>> {
    inner: Arc<Inner<K, R>>,
}

impl<K, R> Clone for WorkQueue<K, R> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K> WorkQueue<K, ExponentialFailureRateLimiter<K>>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, ExponentialFailureRateLimiter::default())
    }
}

impl<K, R> WorkQueue<K, R>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    R: RateLimiter<K> + 'static,
{
    pub fn with_rate_limiter(name: impl Into<String>, limiter: R) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter,
                delayed: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str { &self.inner.name }

    pub fn limiter(&self) -> &R { &self.inner.limiter }

    /// Items currently held by workers.
    pub fn in_flight(&self) -> usize { self.lock().processing.len() }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn report_depth(&self, depth: usize) {
        gauge!("report_queue_depth", "queue" => self.inner.name.clone()).set(depth as f64);
    }
}

#[async_trait]
impl<K, R> RateLimitingQueue<K> for WorkQueue<K, R>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    R: RateLimiter<K> + 'static,
{
    fn add(&self, item: K) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        counter!("report_queue_adds_total", "queue" => self.inner.name.clone()).increment(1);
        if !st.dirty.insert(item.clone()) {
            trace!(queue = %self.inner.name, "item already pending");
            return;
        }
        if st.processing.contains(&item) {
            // handed out again once the current holder calls done()
            return;
        }
        st.queue.push_back(item);
        let depth = st.queue.len();
        drop(st);
        self.report_depth(depth);
        self.inner.notify.notify_one();
    }

    async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let popped = {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                st.queue.pop_front().map(|item| {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    (item, st.queue.len())
                })
            };
            if let Some((item, depth)) = popped {
                self.report_depth(depth);
                return Some(item);
            }
            notified.await;
        }
    }

    fn done(&self, item: &K) {
        let mut st = self.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) && !st.shutting_down {
            st.queue.push_back(item.clone());
            let depth = st.queue.len();
            drop(st);
            self.report_depth(depth);
            self.inner.notify.notify_one();
        }
    }

    fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        let cancelled = self.inner.delayed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(item),
                _ = cancelled.cancelled() => {}
            }
        });
    }

    fn add_rate_limited(&self, item: K) {
        let delay = self.inner.limiter.when(&item);
        counter!("report_queue_retries_total", "queue" => self.inner.name.clone()).increment(1);
        self.add_after(item, delay);
    }

    fn forget(&self, item: &K) {
        self.inner.limiter.forget(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.inner.limiter.num_requeues(item)
    }

    fn len(&self) -> usize { self.lock().queue.len() }

    fn shut_down(&self) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
        }
        debug!(queue = %self.inner.name, "work queue shutting down");
        self.inner.delayed.cancel();
        self.inner.notify.notify_waiters();
    }

    fn is_shutting_down(&self) -> bool { self.lock().shutting_down }
}
