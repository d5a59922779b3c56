//! Report request controller.
//!
//! Producers hand in [`ResultBatch`]es through [`Controller::add`]. Each batch
//! is stored under its [`CompositeKey`] (latest write wins) and the key alone
//! is queued, so repeated submissions collapse into one processing pass over
//! whatever batch is current when a worker picks the key up. Workers build a
//! report record through the [`Builder`] and hand it to the [`Creator`].

#![forbid(unsafe_code)]

pub mod builder;
pub mod config;
pub mod error;

pub use builder::{CatalogBuilder, StaticCatalog};
pub use config::ControllerConfig;
pub use error::SyncError;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use polrep_core::{Builder, CompositeKey, Creator, ResultBatch};
use polrep_queue::{RateLimitingQueue, WorkQueue};
use polrep_store::{DedupStore, Generation};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub type KeyQueue = dyn RateLimitingQueue<CompositeKey>;

/// What happened to a popped queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Retrying,
    Abandoned,
    /// Malformed item or no pending batch for the key.
    Discarded,
}

impl ItemOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Succeeded => "succeeded",
            ItemOutcome::Retrying => "retrying",
            ItemOutcome::Abandoned => "abandoned",
            ItemOutcome::Discarded => "discarded",
        }
    }
}

/// Marks the key done on the queue when dropped, including on panic.
struct InFlight<'a> {
    queue: &'a KeyQueue,
    key: CompositeKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}

pub struct Controller {
    config: ControllerConfig,
    queue: Arc<KeyQueue>,
    store: DedupStore,
    builder: Arc<dyn Builder>,
    creator: Arc<dyn Creator>,
}

impl Controller {
    pub fn new(config: ControllerConfig, builder: Arc<dyn Builder>, creator: Arc<dyn Creator>) -> Self {
        let queue = WorkQueue::with_rate_limiter(config.queue_name.clone(), config.rate_limiter());
        Self::with_queue(config, Arc::new(queue), builder, creator)
    }

    /// Use a caller-supplied queue (custom rate limiting, instrumentation).
    pub fn with_queue(
        config: ControllerConfig,
        queue: Arc<KeyQueue>,
        builder: Arc<dyn Builder>,
        creator: Arc<dyn Creator>,
    ) -> Self {
        let store = DedupStore::with_shards(config.store_shards);
        Self { config, queue, store, builder, creator }
    }

    pub fn config(&self) -> &ControllerConfig { &self.config }
    pub fn store(&self) -> &DedupStore { &self.store }
    pub fn queue(&self) -> &Arc<KeyQueue> { &self.queue }

    /// Record each batch as the latest for its key and queue the key.
    /// Never blocks beyond the store and queue critical sections.
    pub fn add<I>(&self, batches: I)
    where
        I: IntoIterator<Item = ResultBatch>,
    {
        for batch in batches {
            self.enqueue(batch);
        }
    }

    fn enqueue(&self, batch: ResultBatch) {
        let key = batch.key();
        if self.queue.is_shutting_down() {
            debug!(key = %key, "queue shut down; dropping report request");
            return;
        }
        let generation = self.store.put(key.clone(), batch);
        trace!(key = %key, generation, "queued report request");
        self.queue.add(key.clone());
        // Shutdown raced the put: the queue dropped the key, so nothing
        // would ever drain the entry.
        if self.queue.is_shutting_down() {
            self.store.delete_if(&key, generation);
        }
    }

    /// Start `workers` worker loops and the creator's delivery loop, then
    /// block until `stop` fires. Items already taken by a worker finish
    /// before this returns; queued items are left unprocessed.
    ///
    /// `workers == 0` starts no worker: keys are stored and queued but only
    /// drained by explicit [`Controller::process_next_work_item`] calls.
    ///
    /// The creator is stopped only after every worker has returned, so a
    /// record produced by an in-flight item still reaches it.
    pub async fn run(self: Arc<Self>, workers: usize, stop: CancellationToken) {
        info!(workers, queue = %self.config.queue_name, "start");
        if workers == 0 {
            warn!("no workers requested; queued report requests will not be processed");
        }

        let creator_stop = CancellationToken::new();
        let creator = {
            let creator = Arc::clone(&self.creator);
            let stop = creator_stop.clone();
            tokio::spawn(async move { creator.run(stop).await })
        };
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let me = Arc::clone(&self);
                tokio::spawn(async move { me.run_worker(id).await })
            })
            .collect();

        stop.cancelled().await;
        info!("shutting down");
        self.queue.shut_down();

        for res in futures::future::join_all(handles).await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        creator_stop.cancel();
        if let Err(e) = creator.await {
            error!(error = %e, "creator task failed");
        }
    }

    /// Drain the queue until shutdown. Handler panics are caught per item;
    /// anything escaping that is logged and the loop restarted after a second.
    async fn run_worker(self: Arc<Self>, id: usize) {
        debug!(worker = id, "worker started");
        loop {
            let me = Arc::clone(&self);
            let drained = AssertUnwindSafe(async move { while me.process_next_work_item().await {} })
                .catch_unwind()
                .await;
            match drained {
                Ok(()) => break,
                Err(_) if self.queue.is_shutting_down() => break,
                Err(_) => {
                    error!(worker = id, "worker panicked; restarting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!(worker = id, "worker stopped");
    }

    /// Pop and process one key. Returns `false` once the queue shuts down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let _in_flight = InFlight { queue: self.queue.as_ref(), key: key.clone() };
        let outcome = self.process_item(&key).await;
        counter!("report_requests_processed_total", "outcome" => outcome.as_str()).increment(1);
        true
    }

    async fn process_item(&self, key: &CompositeKey) -> ItemOutcome {
        if key.is_empty() {
            self.queue.forget(key);
            debug!("discarding malformed queue item");
            return ItemOutcome::Discarded;
        }
        // Absent when a racing pass already resolved the key.
        let Some((batch, generation)) = self.store.get(key) else {
            self.queue.forget(key);
            debug!(key = %key, "no pending report request for key");
            return ItemOutcome::Discarded;
        };

        let started = Instant::now();
        let result = match AssertUnwindSafe(self.sync_handler(&batch)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(SyncError::Panicked(panic_message(panic.as_ref()))),
        };
        histogram!("report_sync_duration_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        self.handle_err(result, key, generation)
    }

    /// Build the record for `batch` and hand it to the creator.
    pub async fn sync_handler(&self, batch: &ResultBatch) -> Result<(), SyncError> {
        match self.builder.build(batch).await? {
            Some(record) => {
                debug!(policy = %batch.policy_name, name = %record.name, results = record.results.len(), "submitting report request");
                self.creator.add(record);
            }
            None => trace!(policy = %batch.policy_name, ns = %batch.namespace, "nothing to report"),
        }
        Ok(())
    }

    fn handle_err(&self, result: Result<(), SyncError>, key: &CompositeKey, generation: Generation) -> ItemOutcome {
        let err = match result {
            Ok(()) => {
                self.queue.forget(key);
                self.clear(key, generation);
                return ItemOutcome::Succeeded;
            }
            Err(e) => e,
        };

        if self.queue.num_requeues(key) < self.config.retry_limit {
            debug!(key = %key, error = %err, "retrying report request");
            self.queue.add_rate_limited(key.clone());
            return ItemOutcome::Retrying;
        }

        error!(key = %key, error = %err, retries = self.config.retry_limit, "failed to process report request");
        counter!("report_requests_abandoned_total").increment(1);
        self.queue.forget(key);
        self.clear(key, generation);
        ItemOutcome::Abandoned
    }

    /// Drop the store entry unless a newer batch replaced it while in flight;
    /// the newer batch stays queued for its own pass.
    fn clear(&self, key: &CompositeKey, generation: Generation) {
        if !self.store.delete_if(key, generation) {
            debug!(key = %key, "report request updated while in flight; keeping newer batch");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
