//! Coalescing delivery of built report records.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;
use polrep_core::{results_changed, Creator, ReportRecord, ReportResult};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);
/// Record names whose last delivered results are remembered for change
/// detection. Beyond this the oldest name is forgotten and its next record
/// is sent again even if unchanged.
pub const DEFAULT_DELIVERED_CAP: usize = 4096;

/// Destination for report records.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn apply(&self, record: &ReportRecord) -> Result<()>;
}

/// Writes each record as one JSON line on stdout (dry runs).
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

#[async_trait]
impl ReportSink for StdoutSink {
    async fn apply(&self, record: &ReportRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("serializing report record")?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", line).context("writing report record")?;
        Ok(())
    }
}

/// Buffers records by name (latest wins) and flushes them to a sink on a
/// fixed interval. Failed deliveries stay pending for the next flush unless
/// a newer record with the same name arrived meanwhile. Records whose
/// results match the last delivered version are not sent again.
pub struct RequestCreator<S> {
    sink: S,
    flush_interval: Duration,
    delivered_cap: usize,
    tx: mpsc::UnboundedSender<ReportRecord>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ReportRecord>>>,
}

struct Delivery {
    pending: FxHashMap<String, ReportRecord>,
    delivered: FxHashMap<String, Vec<ReportResult>>,
    /// Insertion order of `delivered` keys, oldest first.
    order: VecDeque<String>,
    cap: usize,
}

impl Delivery {
    fn new(cap: usize) -> Self {
        Self {
            pending: FxHashMap::default(),
            delivered: FxHashMap::default(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    fn remember(&mut self, name: String, results: Vec<ReportResult>) {
        if self.delivered.insert(name.clone(), results).is_some() {
            return;
        }
        self.order.push_back(name);
        while self.delivered.len() > self.cap {
            let Some(oldest) = self.order.pop_front() else { break };
            self.delivered.remove(&oldest);
        }
    }
}

impl<S: ReportSink> RequestCreator<S> {
    pub fn new(sink: S, flush_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { sink, flush_interval, delivered_cap: DEFAULT_DELIVERED_CAP, tx, rx: Mutex::new(Some(rx)) }
    }

    pub fn with_delivered_cap(mut self, cap: usize) -> Self {
        self.delivered_cap = cap;
        self
    }

    async fn flush(&self, state: &mut Delivery) {
        if state.pending.is_empty() {
            return;
        }
        let batch: Vec<ReportRecord> = state.pending.drain().map(|(_, r)| r).collect();
        for record in batch {
            if let Some(prev) = state.delivered.get(&record.name) {
                if !results_changed(prev, &record.results) {
                    trace!(name = %record.name, "report request unchanged; skipping");
                    counter!("report_requests_unchanged_total").increment(1);
                    continue;
                }
            }
            match self.sink.apply(&record).await {
                Ok(()) => {
                    counter!("report_requests_submitted_total").increment(1);
                    state.remember(record.name, record.results);
                }
                Err(e) => {
                    warn!(name = %record.name, error = %e, "failed to submit report request; will retry");
                    counter!("report_requests_submit_failures_total").increment(1);
                    state.pending.entry(record.name.clone()).or_insert(record);
                }
            }
        }
    }
}

#[async_trait]
impl<S: ReportSink> Creator for RequestCreator<S> {
    fn add(&self, record: ReportRecord) {
        // fails only once run() has shut the channel
        if self.tx.send(record).is_err() {
            warn!("request creator stopped; dropping report request");
        }
    }

    async fn run(&self, shutdown: CancellationToken) {
        let taken = self.rx.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(mut rx) = taken else {
            warn!("request creator already running");
            return;
        };
        let mut state = Delivery::new(self.delivered_cap);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.flush_interval.as_millis() as u64, "request creator started");
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(record) => { state.pending.insert(record.name.clone(), record); }
                    None => break,
                },
                _ = ticker.tick() => self.flush(&mut state).await,
                _ = shutdown.cancelled() => break,
            }
        }
        rx.close();
        while let Ok(record) = rx.try_recv() {
            state.pending.insert(record.name.clone(), record);
        }
        self.flush(&mut state).await;
        if !state.pending.is_empty() {
            warn!(dropped = state.pending.len(), "request creator stopped with undelivered report requests");
        }
        info!("request creator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polrep_core::{ReportScope, RuleStatus, Summary};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct MemorySink {
        applied: Mutex<Vec<ReportRecord>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl ReportSink for Arc<MemorySink> {
        async fn apply(&self, record: &ReportRecord) -> Result<()> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("apiserver unavailable");
            }
            self.applied.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn record(name: &str, status: RuleStatus) -> ReportRecord {
        ReportRecord {
            name: name.into(),
            namespace: Some("ns1".into()),
            scope: ReportScope::Namespaced,
            policy: "p1".into(),
            results: vec![ReportResult {
                policy: "p1".into(),
                rule: "check".into(),
                message: String::new(),
                result: status,
                category: None,
                severity: None,
                resources: Vec::new(),
                scored: true,
            }],
            summary: Summary::default(),
            generated_at: 0,
        }
    }

    #[tokio::test]
    async fn flush_coalesces_by_name_and_skips_unchanged() {
        let sink = Arc::new(MemorySink::default());
        let creator = RequestCreator::new(Arc::clone(&sink), DEFAULT_FLUSH_INTERVAL);
        let mut state = Delivery::new(DEFAULT_DELIVERED_CAP);

        state.pending.insert("a".into(), record("a", RuleStatus::Pass));
        state.pending.insert("a".into(), record("a", RuleStatus::Fail));
        state.pending.insert("b".into(), record("b", RuleStatus::Pass));
        creator.flush(&mut state).await;
        assert_eq!(sink.applied.lock().unwrap().len(), 2);

        state.pending.insert("a".into(), record("a", RuleStatus::Fail));
        creator.flush(&mut state).await;
        assert_eq!(sink.applied.lock().unwrap().len(), 2, "unchanged record resent");

        state.pending.insert("a".into(), record("a", RuleStatus::Pass));
        creator.flush(&mut state).await;
        assert_eq!(sink.applied.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_delivery_stays_pending() {
        let sink = Arc::new(MemorySink { fail_first: AtomicUsize::new(1), ..Default::default() });
        let creator = RequestCreator::new(Arc::clone(&sink), DEFAULT_FLUSH_INTERVAL);
        let mut state = Delivery::new(DEFAULT_DELIVERED_CAP);
        state.pending.insert("a".into(), record("a", RuleStatus::Fail));

        creator.flush(&mut state).await;
        assert!(sink.applied.lock().unwrap().is_empty());
        assert!(state.pending.contains_key("a"));

        creator.flush(&mut state).await;
        assert_eq!(sink.applied.lock().unwrap().len(), 1);
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn delivered_memory_forgets_oldest_name_past_cap() {
        let sink = Arc::new(MemorySink::default());
        let creator = RequestCreator::new(Arc::clone(&sink), DEFAULT_FLUSH_INTERVAL);
        let mut state = Delivery::new(2);

        for name in ["a", "b", "c"] {
            state.pending.insert(name.into(), record(name, RuleStatus::Fail));
            creator.flush(&mut state).await;
        }
        assert_eq!(state.delivered.len(), 2);
        assert!(!state.delivered.contains_key("a"));
        assert_eq!(state.order, ["b", "c"]);

        // "c" is still remembered, "a" was evicted and goes out again
        state.pending.insert("c".into(), record("c", RuleStatus::Fail));
        state.pending.insert("a".into(), record("a", RuleStatus::Fail));
        creator.flush(&mut state).await;
        let names: Vec<String> = sink.applied.lock().unwrap().iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, ["a", "b", "c", "a"]);
        assert_eq!(state.order, ["c", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_delivers_on_tick_and_flushes_on_shutdown() {
        let sink = Arc::new(MemorySink::default());
        let creator = Arc::new(RequestCreator::new(Arc::clone(&sink), Duration::from_secs(3)));
        let stop = CancellationToken::new();
        let task = tokio::spawn({
            let creator = Arc::clone(&creator);
            let stop = stop.clone();
            async move { creator.run(stop).await }
        });

        creator.add(record("a", RuleStatus::Fail));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(sink.applied.lock().unwrap().len(), 1);

        creator.add(record("b", RuleStatus::Fail));
        stop.cancel();
        task.await.unwrap();
        assert_eq!(sink.applied.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn second_run_returns_immediately() {
        let creator = RequestCreator::new(Arc::new(MemorySink::default()), DEFAULT_FLUSH_INTERVAL);
        let stop = CancellationToken::new();
        stop.cancel();
        creator.run(stop.clone()).await;
        creator.run(stop).await;
    }
}
