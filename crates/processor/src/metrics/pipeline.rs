//! Counters and gauges updated by the coordinator loop

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use super::labels::{ReasonLabels, ResultLabel, ResultLabels};
use crate::watermark::Watermark;

/// Metric prefix for everything registered by [`PipelineMetrics::register`]
pub const PREFIX: &str = "retail_pipeline";

/// Pipeline metrics.
///
/// Clones share the underlying atomics, so the coordinator can own one copy
/// while the registry encodes another.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    events_consumed: Counter,
    events_rejected: Family<ReasonLabels, Counter>,
    late_events: Counter,
    duplicate_events: Counter,
    windows_sealed: Family<ReasonLabels, Counter>,
    durable_writes: Family<ResultLabels, Counter>,
    counter_writes: Family<ResultLabels, Counter>,
    commits: Counter,
    idle_polls: Counter,
    batch_failures: Counter,
    open_windows: Gauge,
    watermark: Gauge,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every metric under the `retail_pipeline` prefix
    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix(PREFIX);
        registry.register(
            "events_consumed",
            "Records taken from the broker",
            self.events_consumed.clone(),
        );
        registry.register(
            "events_rejected",
            "Events dropped before aggregation, by reason",
            self.events_rejected.clone(),
        );
        registry.register(
            "late_events",
            "Events folded into late aggregates",
            self.late_events.clone(),
        );
        registry.register(
            "duplicate_events",
            "Re-read events skipped because their window already holds them",
            self.duplicate_events.clone(),
        );
        registry.register(
            "windows_sealed",
            "Windows sealed, by close reason",
            self.windows_sealed.clone(),
        );
        registry.register(
            "durable_writes",
            "Durable store upserts, by result",
            self.durable_writes.clone(),
        );
        registry.register(
            "counter_writes",
            "Counter store applies, by result",
            self.counter_writes.clone(),
        );
        registry.register("commits", "Offset commits", self.commits.clone());
        registry.register("idle_polls", "Polls that returned no records", self.idle_polls.clone());
        registry.register(
            "batch_failures",
            "Flush cycles that withheld their commit",
            self.batch_failures.clone(),
        );
        registry.register("open_windows", "Windows currently open", self.open_windows.clone());
        registry.register(
            "watermark_millis",
            "Current event-time watermark in milliseconds since the epoch",
            self.watermark.clone(),
        );
    }

    pub fn events_consumed(&self, count: usize) {
        self.events_consumed.inc_by(count as u64);
    }

    pub fn event_rejected(&self, reason: &str) {
        self.events_rejected.get_or_create(&ReasonLabels::new(reason)).inc();
    }

    pub fn late_event(&self) {
        self.late_events.inc();
    }

    pub fn duplicate_event(&self) {
        self.duplicate_events.inc();
    }

    pub fn window_sealed(&self, reason: &str) {
        self.windows_sealed.get_or_create(&ReasonLabels::new(reason)).inc();
    }

    pub fn durable_write(&self, result: ResultLabel) {
        self.durable_writes.get_or_create(&result.into()).inc();
    }

    pub fn counter_write(&self, result: ResultLabel) {
        self.counter_writes.get_or_create(&result.into()).inc();
    }

    pub fn commit(&self) {
        self.commits.inc();
    }

    pub fn idle_poll(&self) {
        self.idle_polls.inc();
    }

    pub fn batch_failure(&self) {
        self.batch_failures.inc();
    }

    pub fn set_open_windows(&self, open: usize) {
        self.open_windows.set(open as i64);
    }

    pub fn set_watermark(&self, watermark: Watermark) {
        if !watermark.is_min() {
            self.watermark.set(watermark.timestamp);
        }
    }

    pub fn rejected(&self, reason: &str) -> u64 {
        self.events_rejected.get_or_create(&ReasonLabels::new(reason)).get()
    }

    pub fn durable_writes(&self, result: ResultLabel) -> u64 {
        self.durable_writes.get_or_create(&result.into()).get()
    }

    pub fn counter_writes(&self, result: ResultLabel) -> u64 {
        self.counter_writes.get_or_create(&result.into()).get()
    }
}
