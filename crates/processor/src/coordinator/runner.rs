//! The poll, aggregate, flush, commit loop

use chrono::Utc;
use retail_analytics_types::SealedAggregate;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::offsets::{merge_min, OffsetTracker};
use super::state::{CoordinatorState, CoordinatorStats};
use crate::aggregation::{FoldOutcome, RejectReason, WindowAggregator};
use crate::broker::{BrokerClient, BrokerRecord, TopicPartition};
use crate::config::{CoordinatorConfig, WindowingConfig};
use crate::error::{ProcessorError, Result};
use crate::metrics::{PipelineMetrics, ResultLabel};
use crate::store::{AggregateStore, ApplyOutcome, CounterStore, UpsertOutcome};
use crate::watermark::{Watermark, WatermarkTracker};
use crate::window::{ClosedWindow, OpenWindows, Routed};

/// A sealed aggregate whose durable write has not succeeded yet
#[derive(Debug)]
struct PendingWrite {
    aggregate: SealedAggregate,
    held_offsets: BTreeMap<TopicPartition, i64>,
}

/// Drives one consumer's share of the topic through the windowing pipeline.
///
/// The coordinator is the only owner of open windows. Offsets are committed
/// only up to the lowest position still needed by an open window, a late
/// accumulator or an aggregate whose durable write has not succeeded.
pub struct PipelineCoordinator {
    config: CoordinatorConfig,
    windowing: WindowingConfig,
    broker: Arc<dyn BrokerClient>,
    durable: Arc<dyn AggregateStore>,
    counters: Option<Arc<dyn CounterStore>>,
    aggregator: WindowAggregator,
    watermarks: WatermarkTracker,
    windows: OpenWindows,
    pending: Vec<PendingWrite>,
    offsets: OffsetTracker,
    metrics: PipelineMetrics,
    state: CoordinatorState,
    stats: CoordinatorStats,
    status: watch::Sender<CoordinatorStats>,
    consecutive_failures: u32,
}

impl PipelineCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        windowing: WindowingConfig,
        broker: Arc<dyn BrokerClient>,
        durable: Arc<dyn AggregateStore>,
    ) -> Result<Self> {
        config.validate()?;
        windowing.validate()?;

        let aggregator = WindowAggregator::new(windowing.partition_key, windowing.assigner()?);
        let watermarks = WatermarkTracker::new(windowing.lateness()?);
        let (status, _) = watch::channel(CoordinatorStats::default());

        Ok(Self {
            config,
            windowing,
            broker,
            durable,
            counters: None,
            aggregator,
            watermarks,
            windows: OpenWindows::new(),
            pending: Vec::new(),
            offsets: OffsetTracker::default(),
            metrics: PipelineMetrics::default(),
            state: CoordinatorState::Idle,
            stats: CoordinatorStats::default(),
            status,
            consecutive_failures: 0,
        })
    }

    /// Mirror sealed aggregates into a counter store
    pub fn with_counter_store(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Report into registered metrics instead of a private set
    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn watermark(&self) -> Watermark {
        self.watermarks.current()
    }

    pub fn windows(&self) -> &OpenWindows {
        &self.windows
    }

    pub fn aggregator(&self) -> &WindowAggregator {
        &self.aggregator
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Offset the group resumes from on a partition, as far as this
    /// coordinator knows
    pub fn resume_position(&self, tp: &TopicPartition) -> Option<i64> {
        self.offsets.resume_at(tp)
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            state: self.state,
            events_rejected: self.aggregator.rejected_count(),
            open_windows: self.windows.open_len(),
            pending_writes: self.pending.len(),
            watermark: self.watermarks.current().to_datetime(),
            ..self.stats.clone()
        }
    }

    /// Stats snapshots published on every state change and flush cycle
    pub fn status(&self) -> watch::Receiver<CoordinatorStats> {
        self.status.subscribe()
    }

    fn transition(&mut self, next: CoordinatorState) {
        if self.state == next {
            return;
        }
        if next.is_lifecycle() || self.state.is_lifecycle() {
            info!(from = %self.state, to = %next, "coordinator state changed");
        } else {
            trace!(from = %self.state, to = %next, "coordinator state changed");
        }
        self.state = next;
        self.status.send_replace(self.stats());
    }

    /// Join the consumer group
    pub async fn start(&mut self) -> Result<()> {
        info!(
            topics = ?self.config.topics,
            group_id = %self.config.group_id,
            broker = self.broker.name(),
            durable_store = self.durable.name(),
            counter_store = self.counters.as_ref().map(|c| c.name()),
            partition_key = %self.windowing.partition_key,
            "starting coordinator"
        );
        self.transition(CoordinatorState::Idle);
        self.broker
            .subscribe(&self.config.topics, &self.config.group_id)
            .await
    }

    /// Run until `shutdown` is cancelled, then drain.
    ///
    /// Cancellation is checked between iterations, so an in-flight store
    /// write always finishes before the drain starts. Returns the first
    /// fatal error.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<CoordinatorStats> {
        self.start().await?;

        while !shutdown.is_cancelled() {
            if let Err(err) = self.step().await {
                error!(error = %err, state = %self.state, "coordinator stopping on fatal error");
                self.transition(CoordinatorState::Stopped);
                return Err(err);
            }
        }

        info!("shutdown requested");
        self.drain().await
    }

    /// One pass through poll, aggregate, flush and commit.
    ///
    /// Returns the number of records polled. A durable write failure is not
    /// an error here until it repeats more often than
    /// `max_consecutive_batch_failures`; the aggregates stay pending and are
    /// retried on the next pass.
    pub async fn step(&mut self) -> Result<usize> {
        self.transition(CoordinatorState::Polling);
        let batch = self
            .broker
            .poll(self.config.max_batch_size, self.config.poll_timeout)
            .await?;
        let polled = batch.len();
        self.forget_revoked();

        if batch.is_empty() {
            self.stats.idle_polls += 1;
            self.metrics.idle_poll();
            debug!(idle_polls = self.stats.idle_polls, "empty poll");
            tokio::time::sleep(self.config.idle_sleep).await;
        } else {
            self.transition(CoordinatorState::Aggregating);
            self.aggregate_batch(batch);
        }

        self.transition(CoordinatorState::Flushing);
        let watermark = self.watermarks.current();
        let closed = self
            .windows
            .drain_closed(watermark, Instant::now(), self.windowing.flush_interval);
        self.windows.prune_sealed(watermark);
        self.seal(closed);
        let late = self.windows.drain_late();
        self.seal(late);

        match self.write_pending().await {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.transition(CoordinatorState::Committing);
                self.commit_safe().await?;
            }
            Err(err) => self.batch_failed(err)?,
        }

        self.update_gauges();
        Ok(polled)
    }

    /// Flush every open window regardless of closing policy, write and
    /// commit, then stop.
    ///
    /// Bounded by `shutdown_timeout`; whatever is not written in time is
    /// abandoned and re-aggregated from the last committed offset on restart.
    pub async fn drain(&mut self) -> Result<CoordinatorStats> {
        self.transition(CoordinatorState::Draining);
        let timeout = self.config.shutdown_timeout;

        let outcome = tokio::time::timeout(timeout, self.flush_all()).await;
        let result = match outcome {
            Ok(Ok(())) => {
                info!(windows_sealed = self.stats.windows_sealed, "drain complete");
                Ok(())
            }
            Ok(Err(err)) if err.is_fatal() => Err(err),
            Ok(Err(err)) => {
                warn!(
                    error = %err,
                    pending = self.pending.len(),
                    "drain left aggregates unwritten, they will be rebuilt on restart"
                );
                Ok(())
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    pending = self.pending.len(),
                    "drain timed out, abandoning unwritten aggregates"
                );
                Ok(())
            }
        };

        self.update_gauges();
        self.transition(CoordinatorState::Stopped);
        result.map(|()| self.stats())
    }

    async fn flush_all(&mut self) -> Result<()> {
        let closed = self.windows.drain_all();
        self.seal(closed);

        if let Err(err) = self.write_pending().await {
            self.stats.batch_failures += 1;
            self.metrics.batch_failure();
            return Err(err);
        }
        self.commit_safe().await
    }

    /// Stop tracking partitions the group took away. Windows keep the events
    /// already read from them; re-reads after reassignment fold as duplicates.
    fn forget_revoked(&mut self) {
        for tp in self.broker.take_revoked() {
            info!(%tp, resume_at = ?self.offsets.resume_at(&tp), "partition revoked, forgetting offsets");
            self.offsets.forget(&tp);
        }
    }

    fn aggregate_batch(&mut self, batch: Vec<BrokerRecord>) {
        let ingested_at = Utc::now();
        self.stats.events_consumed += batch.len() as u64;
        self.metrics.events_consumed(batch.len());

        for record in batch {
            let tp = record.topic_partition();
            self.offsets.observe(&tp, record.offset);

            let event = match record.decode(ingested_at) {
                Ok(event) => event,
                Err(err) => {
                    warn!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %err,
                        "rejected undecodable record"
                    );
                    let reason = RejectReason::Codec(err.reason());
                    self.aggregator.reject_undecodable(reason);
                    self.metrics.event_rejected(reason.as_str());
                    continue;
                }
            };

            if let Err(reason) = self.aggregator.validate(&event) {
                self.aggregator.reject(&event, reason);
                self.metrics.event_rejected(reason.as_str());
                continue;
            }

            if !event.event_time_inferred {
                self.watermarks.observe(event.event_time);
            }
            let key = self.aggregator.window_key(&event);
            let bounds = self.aggregator.assigner().assign(event.event_time);

            let aggregator = &self.aggregator;
            let routed = self.windows.fold(
                key,
                bounds.end,
                self.watermarks.current(),
                (&tp, record.offset),
                Instant::now(),
                |current| {
                    aggregator.fold(current, &event, record.partition, record.offset) == FoldOutcome::Added
                },
            );

            match routed {
                Routed::OnTime => self.stats.events_folded += 1,
                Routed::Late => {
                    self.stats.events_folded += 1;
                    self.stats.events_late += 1;
                    self.metrics.late_event();
                    debug!(
                        invoice_no = %event.invoice_no,
                        event_time = %event.event_time,
                        window = %bounds,
                        "late event routed to late aggregate"
                    );
                }
                Routed::Duplicate => {
                    self.stats.events_duplicate += 1;
                    self.metrics.duplicate_event();
                    debug!(
                        invoice_no = %event.invoice_no,
                        partition = record.partition,
                        offset = record.offset,
                        window = %bounds,
                        "event already folded, skipping"
                    );
                }
            }
        }
    }

    fn seal(&mut self, closed: Vec<ClosedWindow>) {
        let sealed_at = Utc::now();
        for window in closed {
            let aggregate =
                window
                    .aggregate
                    .seal(&window.key, window.window_end, window.is_late(), sealed_at);
            debug!(
                window = %window.key,
                reason = window.reason.as_str(),
                order_count = aggregate.order_count,
                revenue_total = %aggregate.revenue_total,
                "window sealed"
            );
            self.stats.windows_sealed += 1;
            self.metrics.window_sealed(window.reason.as_str());
            self.pending.push(PendingWrite {
                aggregate,
                held_offsets: window.held_offsets,
            });
        }
    }

    /// Write pending aggregates in seal order, stopping at the first
    /// durable failure. Counter failures never stop the flush.
    async fn write_pending(&mut self) -> Result<()> {
        let mut queue = std::mem::take(&mut self.pending).into_iter();

        while let Some(write) = queue.next() {
            match self.upsert_durable(&write.aggregate).await {
                Ok(UpsertOutcome::Written) => {
                    self.stats.durable_written += 1;
                    self.metrics.durable_write(ResultLabel::Written);
                    self.apply_counters(&write.aggregate).await;
                }
                Ok(UpsertOutcome::Skipped) => {
                    self.stats.durable_skipped += 1;
                    self.metrics.durable_write(ResultLabel::Skipped);
                    debug!(window = %write.aggregate.key(), "durable row already up to date");
                    self.apply_counters(&write.aggregate).await;
                }
                Ok(UpsertOutcome::Diverted(late)) => {
                    self.stats.durable_diverted += 1;
                    self.metrics.durable_write(ResultLabel::Diverted);
                    warn!(
                        window = %write.aggregate.key(),
                        order_count = late.order_count,
                        origin = ?late.late_origin,
                        "stored row lacks events of this aggregate, wrote them as a late row"
                    );
                    self.apply_counters(&late).await;
                }
                Err(err) => {
                    self.stats.durable_failures += 1;
                    self.metrics.durable_write(ResultLabel::Failure);
                    self.pending.push(write);
                    self.pending.extend(queue);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn upsert_durable(&self, aggregate: &SealedAggregate) -> Result<UpsertOutcome> {
        let store: &dyn AggregateStore = self.durable.as_ref();
        let timeout = self.config.write_timeout;

        self.config
            .store_retry
            .run("durable.upsert", || async move {
                match tokio::time::timeout(timeout, store.upsert(aggregate)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProcessorError::transient(store.name(), "upsert timed out")),
                }
            })
            .await
    }

    async fn apply_counters(&mut self, aggregate: &SealedAggregate) {
        let Some(counters) = self.counters.clone() else {
            return;
        };
        let store: &dyn CounterStore = counters.as_ref();
        let timeout = self.config.write_timeout;

        let result = self
            .config
            .store_retry
            .run("counter.apply", || async move {
                match tokio::time::timeout(timeout, store.apply(aggregate)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProcessorError::transient(store.name(), "apply timed out")),
                }
            })
            .await;

        match result {
            Ok(ApplyOutcome::Applied) => {
                self.stats.counter_applied += 1;
                self.metrics.counter_write(ResultLabel::Applied);
            }
            Ok(ApplyOutcome::Duplicate) => {
                self.stats.counter_duplicates += 1;
                self.metrics.counter_write(ResultLabel::Duplicate);
            }
            Err(err) => {
                self.stats.counter_failures += 1;
                self.metrics.counter_write(ResultLabel::Failure);
                warn!(
                    window = %aggregate.key(),
                    error = %err,
                    "counter store update failed, continuing"
                );
            }
        }
    }

    fn batch_failed(&mut self, err: ProcessorError) -> Result<()> {
        self.consecutive_failures += 1;
        self.stats.batch_failures += 1;
        self.metrics.batch_failure();
        error!(
            error = %err,
            pending = self.pending.len(),
            consecutive_failures = self.consecutive_failures,
            "durable write failed, withholding commit"
        );

        if err.is_fatal() {
            return Err(err);
        }
        if self.consecutive_failures > self.config.max_consecutive_batch_failures {
            return Err(ProcessorError::Connectivity {
                component: self.durable.name(),
                attempts: self.consecutive_failures,
                message: err.to_string(),
            });
        }
        Ok(())
    }

    async fn commit_safe(&mut self) -> Result<()> {
        let mut held = self.windows.held_offsets();
        for write in &self.pending {
            merge_min(&mut held, &write.held_offsets);
        }

        for (tp, offset) in self.offsets.safe_commits(&held) {
            self.broker.commit(&tp, offset).await?;
            self.offsets.mark_committed(&tp, offset);
            self.stats.commits += 1;
            self.metrics.commit();
            debug!(%tp, offset, "offset committed");
        }
        Ok(())
    }

    fn update_gauges(&self) {
        self.metrics.set_open_windows(self.windows.open_len());
        self.metrics.set_watermark(self.watermarks.current());
        self.status.send_replace(self.stats());
    }
}
