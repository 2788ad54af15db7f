//! Usage bucket aggregation
//!
//! Time-windowed counters for tool calls and instruction hits. The container
//! keeps the current window plus a ring of the most recent past windows;
//! windows evicted from the ring are folded into a `retired` aggregate so the
//! grand total never loses an event.
//!
//! Rotation is lazy: it happens when an event for a newer window arrives or
//! when [`UsageBucketContainer::poll`] is called.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::UsageConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Clock
// ─────────────────────────────────────────────────────────────────────────────

/// Millisecond wall clock, injectable for rotation tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            ms: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta: i64) {
        self.ms.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.ms.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Buckets
// ─────────────────────────────────────────────────────────────────────────────

/// One completed tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEvent {
    pub operation: String,
    pub instruction_id: Option<String>,
    pub success: bool,
    pub latency_ms: u64,
    pub ts_ms: i64,
}

impl UsageEvent {
    pub fn new(operation: impl Into<String>, ts_ms: i64) -> Self {
        Self {
            operation: operation.into(),
            instruction_id: None,
            success: true,
            latency_ms: 0,
            ts_ms,
        }
    }

    pub fn with_instruction(mut self, id: impl Into<String>) -> Self {
        self.instruction_id = Some(id.into());
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBucket {
    /// Start of the window in epoch milliseconds
    pub window_start: i64,
    pub operation_counts: BTreeMap<String, u64>,
    pub instruction_hits: BTreeMap<String, u64>,
    /// Sum of `instructionHits`; the only hit figure kept once a bucket retires
    pub instruction_hit_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_entries: u64,
    pub total_latency_ms: u64,
    pub max_latency_ms: u64,
}

impl UsageBucket {
    fn starting_at(window_start: i64) -> Self {
        Self {
            window_start,
            ..Self::default()
        }
    }

    fn add(&mut self, event: &UsageEvent) {
        *self.operation_counts.entry(event.operation.clone()).or_default() += 1;
        if let Some(id) = &event.instruction_id {
            *self.instruction_hits.entry(id.clone()).or_default() += 1;
            self.instruction_hit_count += 1;
        }
        if event.success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.total_entries += 1;
        self.total_latency_ms = self.total_latency_ms.saturating_add(event.latency_ms);
        self.max_latency_ms = self.max_latency_ms.max(event.latency_ms);
    }

    /// Fold the totals of `other` into `self`. Per-id hits are dropped so the
    /// retired aggregate stays bounded by the operation vocabulary;
    /// `windowStart` is left untouched.
    fn absorb(&mut self, other: &UsageBucket) {
        for (op, n) in &other.operation_counts {
            *self.operation_counts.entry(op.clone()).or_default() += n;
        }
        self.instruction_hit_count += other.instruction_hit_count;
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.total_entries += other.total_entries;
        self.total_latency_ms = self.total_latency_ms.saturating_add(other.total_latency_ms);
        self.max_latency_ms = self.max_latency_ms.max(other.max_latency_ms);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HotEntry {
    pub id: String,
    pub hits: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    pub rotation_count: u64,
    pub total_entries: u64,
    pub retired_entries: u64,
}

/// Serializable view returned by `metrics/snapshot`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub bucket_size_minutes: u32,
    pub bucket_count: usize,
    pub metrics: UsageMetrics,
    pub current: UsageBucket,
    /// Oldest first
    pub buckets: Vec<UsageBucket>,
    pub retired: UsageBucket,
}

#[derive(Debug)]
pub struct UsageBucketContainer {
    bucket_size_minutes: u32,
    bucket_ms: i64,
    capacity: usize,
    current: UsageBucket,
    ring: VecDeque<UsageBucket>,
    retired: UsageBucket,
    rotation_count: u64,
}

impl UsageBucketContainer {
    pub fn new(cfg: &UsageConfig, now_ms: i64) -> Self {
        let bucket_ms = i64::from(cfg.bucket_size_minutes.max(1)) * 60_000;
        let capacity = cfg.bucket_count.max(1);
        Self {
            bucket_size_minutes: cfg.bucket_size_minutes.max(1),
            bucket_ms,
            capacity,
            current: UsageBucket::starting_at(now_ms.div_euclid(bucket_ms) * bucket_ms),
            ring: VecDeque::with_capacity(capacity),
            retired: UsageBucket::default(),
            rotation_count: 0,
        }
    }

    fn window_start(&self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.bucket_ms) * self.bucket_ms
    }

    /// Start a new current bucket if `ts_ms` falls in a later window.
    ///
    /// Timestamps from earlier windows (clock skew, late delivery) never
    /// rotate backwards; they are counted in the current bucket.
    fn rotate_to(&mut self, ts_ms: i64) {
        let window = self.window_start(ts_ms);
        if window <= self.current.window_start {
            return;
        }
        let finished = std::mem::replace(&mut self.current, UsageBucket::starting_at(window));
        if self.ring.len() == self.capacity
            && let Some(evicted) = self.ring.pop_front()
        {
            self.retired.absorb(&evicted);
        }
        self.ring.push_back(finished);
        self.rotation_count += 1;
        tracing::trace!(window_start = window, rotations = self.rotation_count, "Rotated usage bucket");
    }

    pub fn record(&mut self, event: &UsageEvent) {
        self.rotate_to(event.ts_ms);
        self.current.add(event);
    }

    /// Rotate without recording.
    pub fn poll(&mut self, now_ms: i64) {
        self.rotate_to(now_ms);
    }

    pub fn rotation_count(&self) -> u64 {
        self.rotation_count
    }

    /// Every event ever recorded: retired + ring + current.
    pub fn total_entries(&self) -> u64 {
        self.retired.total_entries
            + self.ring.iter().map(|b| b.total_entries).sum::<u64>()
            + self.current.total_entries
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    /// Most-hit instruction ids across the live windows (ring + current).
    pub fn hotset(&self, limit: usize) -> Vec<HotEntry> {
        let mut hits: BTreeMap<&str, u64> = BTreeMap::new();
        for bucket in self.ring.iter().chain(std::iter::once(&self.current)) {
            for (id, n) in &bucket.instruction_hits {
                *hits.entry(id.as_str()).or_default() += n;
            }
        }
        let mut items: Vec<HotEntry> = hits
            .into_iter()
            .map(|(id, hits)| HotEntry {
                id: id.to_string(),
                hits,
            })
            .collect();
        // Stable sort: ties keep the id order from the BTreeMap.
        items.sort_by_key(|h| std::cmp::Reverse(h.hits));
        items.truncate(limit);
        items
    }

    pub fn summary(&self) -> UsageSummary {
        UsageSummary {
            bucket_size_minutes: self.bucket_size_minutes,
            bucket_count: self.capacity,
            metrics: UsageMetrics {
                rotation_count: self.rotation_count,
                total_entries: self.total_entries(),
                retired_entries: self.retired.total_entries,
            },
            current: self.current.clone(),
            buckets: self.ring.iter().cloned().collect(),
            retired: self.retired.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregator
// ─────────────────────────────────────────────────────────────────────────────

enum UsageMsg {
    Record(UsageEvent),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle passed to whoever needs to record or read usage.
///
/// Recording never waits: events go over an unbounded channel to a
/// background task that owns the write side of the container.
#[derive(Clone)]
pub struct UsageAggregator {
    tx: mpsc::UnboundedSender<UsageMsg>,
    container: Arc<Mutex<UsageBucketContainer>>,
    clock: Arc<dyn Clock>,
}

impl UsageAggregator {
    /// Start the drain task on the current tokio runtime.
    pub fn spawn(cfg: &UsageConfig, clock: Arc<dyn Clock>) -> Self {
        let container = Arc::new(Mutex::new(UsageBucketContainer::new(cfg, clock.now_ms())));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sink = Arc::clone(&container);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    UsageMsg::Record(event) => {
                        sink.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .record(&event);
                    }
                    UsageMsg::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            tracing::debug!("Usage aggregator drained");
        });

        Self {
            tx,
            container,
            clock,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Fire-and-forget; timestamps the event with the aggregator's clock.
    pub fn record(
        &self,
        operation: &str,
        instruction_id: Option<&str>,
        success: bool,
        latency_ms: u64,
    ) {
        let event = UsageEvent {
            operation: operation.to_string(),
            instruction_id: instruction_id.map(str::to_string),
            success,
            latency_ms,
            ts_ms: self.clock.now_ms(),
        };
        self.record_event(event);
    }

    pub fn record_event(&self, event: UsageEvent) {
        if self.tx.send(UsageMsg::Record(event)).is_err() {
            tracing::debug!("Usage aggregator closed, dropping event");
        }
    }

    /// Wait until every event sent before this call has been applied.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(UsageMsg::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Rotate to the clock's current window and summarize.
    pub fn snapshot(&self) -> UsageSummary {
        let mut container = self.container.lock().unwrap_or_else(PoisonError::into_inner);
        container.poll(self.clock.now_ms());
        container.summary()
    }

    pub fn hotset(&self, limit: usize) -> Vec<HotEntry> {
        let mut container = self.container.lock().unwrap_or_else(PoisonError::into_inner);
        container.poll(self.clock.now_ms());
        container.hotset(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINUTE: i64 = 60_000;

    fn cfg(size_minutes: u32, count: usize) -> UsageConfig {
        UsageConfig {
            bucket_size_minutes: size_minutes,
            bucket_count: count,
        }
    }

    #[test]
    fn test_same_window_does_not_rotate() {
        let mut c = UsageBucketContainer::new(&cfg(60, 4), 0);
        c.record(&UsageEvent::new("instructions/dispatch", 10));
        c.record(&UsageEvent::new("instructions/dispatch", 59 * MINUTE));
        assert_eq!(c.rotation_count(), 0);
        assert_eq!(c.total_entries(), 2);
    }

    #[test]
    fn test_rotation_on_new_window() {
        let mut c = UsageBucketContainer::new(&cfg(1, 4), 0);
        c.record(&UsageEvent::new("a", 0).with_instruction("x1"));
        c.record(&UsageEvent::new("a", MINUTE + 1).with_instruction("x1"));
        c.record(&UsageEvent::new("a", 2 * MINUTE).failed().with_latency_ms(40));

        assert_eq!(c.rotation_count(), 2);
        assert_eq!(c.ring_len(), 2);
        let summary = c.summary();
        assert_eq!(summary.current.window_start, 2 * MINUTE);
        assert_eq!(summary.current.failure_count, 1);
        assert_eq!(summary.current.max_latency_ms, 40);
        assert_eq!(summary.buckets[0].instruction_hits.get("x1"), Some(&1));
    }

    #[test]
    fn test_conservation_without_eviction() {
        let mut c = UsageBucketContainer::new(&cfg(1, 10), 0);
        for i in 0..30 {
            c.record(&UsageEvent::new("op", i * 20_000));
        }
        let summary = c.summary();
        let ring: u64 = summary.buckets.iter().map(|b| b.total_entries).sum();
        assert_eq!(summary.retired.total_entries, 0);
        assert_eq!(ring + summary.current.total_entries, 30);
    }

    #[test]
    fn test_conservation_with_eviction() {
        let mut c = UsageBucketContainer::new(&cfg(1, 3), 0);
        for i in 0..50 {
            c.record(&UsageEvent::new("op", i * 30_000).with_instruction("id"));
        }
        let summary = c.summary();
        let ring: u64 = summary.buckets.iter().map(|b| b.total_entries).sum();
        assert_eq!(summary.buckets.len(), 3);
        assert!(summary.retired.total_entries > 0);
        assert_eq!(
            summary.retired.total_entries + ring + summary.current.total_entries,
            50
        );
        assert_eq!(summary.metrics.total_entries, 50);
        assert!(summary.retired.instruction_hits.is_empty());
        assert_eq!(summary.retired.instruction_hit_count, summary.retired.total_entries);
    }

    #[test]
    fn test_poll_rotates_without_recording() {
        let mut c = UsageBucketContainer::new(&cfg(1, 3), 0);
        c.record(&UsageEvent::new("op", 0));
        c.poll(5 * MINUTE);
        assert_eq!(c.rotation_count(), 1);
        assert_eq!(c.total_entries(), 1);
        assert_eq!(c.summary().current.total_entries, 0);
    }

    #[test]
    fn test_late_events_stay_in_current() {
        let mut c = UsageBucketContainer::new(&cfg(1, 3), 10 * MINUTE);
        c.record(&UsageEvent::new("op", 2 * MINUTE));
        assert_eq!(c.rotation_count(), 0);
        assert_eq!(c.summary().current.window_start, 10 * MINUTE);
        assert_eq!(c.summary().current.total_entries, 1);
    }

    #[test]
    fn test_hotset_orders_by_hits_then_id() {
        let mut c = UsageBucketContainer::new(&cfg(1, 3), 0);
        for (id, n) in [("b", 2), ("a", 2), ("c", 5), ("d", 1)] {
            for _ in 0..n {
                c.record(&UsageEvent::new("usage/track", 0).with_instruction(id));
            }
        }
        let ids: Vec<String> = c.hotset(3).into_iter().map(|h| h.id).collect();
        assert_eq!(ids, vec!["c".to_string(), "a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_aggregator_uses_injected_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let agg = UsageAggregator::spawn(&cfg(1, 2), clock.clone());

        agg.record("instructions/dispatch", Some("x1"), true, 3);
        clock.advance_ms(MINUTE);
        agg.record("instructions/dispatch", Some("x1"), true, 7);
        agg.flush().await;

        let summary = agg.snapshot();
        assert_eq!(summary.metrics.rotation_count, 1);
        assert_eq!(summary.metrics.total_entries, 2);
        assert_eq!(agg.hotset(10), vec![HotEntry { id: "x1".to_string(), hits: 2 }]);
    }
}
