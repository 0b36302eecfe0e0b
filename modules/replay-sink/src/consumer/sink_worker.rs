//! Sink worker
//!
//! One cooperative fetch → process → settle loop over the durable consumer.
//!
//! Per message:
//! 1. Decode and validate the [`BatchEnvelope`]. Failure is terminal for the
//!    message: it is dead-lettered (if configured) and acked, never redelivered.
//! 2. Insert exactly one row into the event store.
//! 3. Ack once the insert has completed; nak if it failed, leaving retry to
//!    the stream's redelivery.
//!
//! Sibling messages in a fetched batch are independent; one failed insert never
//! stops the loop.

use replay_bus::{BatchEnvelope, Delivery, StreamConsumer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::Instrument;

use crate::config::Config;
use crate::dlq::DeadLetter;
use crate::metrics::Metrics;
use crate::store::{EventStore, NewRow};

/// How a single delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Row inserted, delivery acked
    Stored,
    /// Insert failed, delivery nak'd for redelivery
    Requeued,
    /// Poison message published to the dead-letter subject and acked
    DeadLettered,
    /// Poison message acked without being retained anywhere
    Dropped,
}

impl SinkOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkOutcome::Stored => "stored",
            SinkOutcome::Requeued => "requeued",
            SinkOutcome::DeadLettered => "dead_lettered",
            SinkOutcome::Dropped => "dropped",
        }
    }
}

/// Fetch loop tuning
#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub fetch_batch: usize,
    /// Upper bound on a single fetch wait
    pub fetch_timeout: Duration,
    /// Pause after an empty or failed fetch
    pub idle_backoff: Duration,
    /// Redelivery delay requested on nak; `None` uses the provider default
    pub nak_delay: Option<Duration>,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            fetch_batch: 100,
            fetch_timeout: Duration::from_secs(1),
            idle_backoff: Duration::from_millis(250),
            nak_delay: Some(Duration::from_secs(1)),
        }
    }
}

impl SinkSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fetch_batch: config.fetch_batch,
            fetch_timeout: config.fetch_timeout,
            idle_backoff: config.idle_backoff,
            nak_delay: (!config.nak_delay.is_zero()).then_some(config.nak_delay),
        }
    }
}

/// Running outcome counters, shared between a worker and whoever observes it
#[derive(Debug, Default)]
pub struct SinkStats {
    stored: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
}

impl SinkStats {
    pub fn record(&self, outcome: SinkOutcome) {
        let counter = match outcome {
            SinkOutcome::Stored => &self.stored,
            SinkOutcome::Requeued => &self.requeued,
            SinkOutcome::DeadLettered => &self.dead_lettered,
            SinkOutcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, outcome: SinkOutcome) -> u64 {
        let counter = match outcome {
            SinkOutcome::Stored => &self.stored,
            SinkOutcome::Requeued => &self.requeued,
            SinkOutcome::DeadLettered => &self.dead_lettered,
            SinkOutcome::Dropped => &self.dropped,
        };
        counter.load(Ordering::Relaxed)
    }

    /// Deliveries settled so far, across all outcomes
    pub fn total(&self) -> u64 {
        self.count(SinkOutcome::Stored)
            + self.count(SinkOutcome::Requeued)
            + self.count(SinkOutcome::DeadLettered)
            + self.count(SinkOutcome::Dropped)
    }
}

pub struct SinkWorker {
    id: usize,
    consumer: Arc<dyn StreamConsumer>,
    store: Arc<dyn EventStore>,
    dead_letter: DeadLetter,
    settings: SinkSettings,
    metrics: Option<Metrics>,
    stats: Arc<SinkStats>,
}

impl SinkWorker {
    pub fn new(
        id: usize,
        consumer: Arc<dyn StreamConsumer>,
        store: Arc<dyn EventStore>,
        dead_letter: DeadLetter,
        settings: SinkSettings,
    ) -> Self {
        Self {
            id,
            consumer,
            store,
            dead_letter,
            settings,
            metrics: None,
            stats: Arc::new(SinkStats::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_stats(mut self, stats: Arc<SinkStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }

    /// Process and settle one delivery
    pub async fn process(&self, delivery: Delivery) -> SinkOutcome {
        let span = tracing::info_span!(
            "sink_message",
            worker = self.id,
            subject = %delivery.subject,
            delivered = delivery.delivered,
            project_id = tracing::field::Empty,
            session_id = tracing::field::Empty,
            seq = tracing::field::Empty,
        );

        let outcome = self.settle(delivery).instrument(span).await;

        self.stats.record(outcome);
        if let Some(metrics) = &self.metrics {
            metrics
                .sink_messages_total
                .with_label_values(&[outcome.as_str()])
                .inc();
        }
        outcome
    }

    async fn settle(&self, delivery: Delivery) -> SinkOutcome {
        let row = match BatchEnvelope::from_slice(&delivery.payload)
            .and_then(|envelope| NewRow::from_envelope(&envelope))
        {
            Ok(row) => row,
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(error = %reason, "Rejecting undecodable replay batch");
                let outcome = self.dead_letter.route(&delivery, &reason).await;
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(error = %e, "Failed to ack poison message");
                }
                return outcome;
            }
        };

        let span = tracing::Span::current();
        span.record("project_id", row.project_id);
        span.record("session_id", tracing::field::display(row.session_id));
        span.record("seq", row.seq);

        let started = Instant::now();
        let inserted = self.store.insert(&row).await;
        if let Some(metrics) = &self.metrics {
            metrics
                .sink_insert_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }

        match inserted {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    // The row is already stored; redelivery will add a duplicate.
                    tracing::warn!(error = %e, "Failed to ack stored replay batch");
                }
                tracing::debug!("Stored replay batch");
                SinkOutcome::Stored
            }
            Err(e) => {
                tracing::warn!(error = %e, "Insert failed, requesting redelivery");
                if let Err(e) = delivery.nak(self.settings.nak_delay).await {
                    tracing::warn!(error = %e, "Failed to nak replay batch");
                }
                SinkOutcome::Requeued
            }
        }
    }

    /// Run the fetch loop until `shutdown` flips to true (or its sender drops).
    ///
    /// A pending fetch wait is abandoned on shutdown. A message already being
    /// processed is settled first; the rest of its batch is nak'd without
    /// delay so another worker can pick it up.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = self.id, "Sink worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                fetched = self.consumer.fetch(self.settings.fetch_batch, self.settings.fetch_timeout) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::debug!(worker = self.id, error = %e, "Fetch failed");
                    Vec::new()
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.settings.idle_backoff) => {}
                }
                continue;
            }

            let mut batch = batch.into_iter();
            while let Some(delivery) = batch.next() {
                if *shutdown.borrow() {
                    release(delivery).await;
                    for delivery in batch.by_ref() {
                        release(delivery).await;
                    }
                    break;
                }
                self.process(delivery).await;
            }
        }

        tracing::info!(
            worker = self.id,
            stored = self.stats.count(SinkOutcome::Stored),
            requeued = self.stats.count(SinkOutcome::Requeued),
            dead_lettered = self.stats.count(SinkOutcome::DeadLettered),
            dropped = self.stats.count(SinkOutcome::Dropped),
            "Sink worker stopped"
        );
    }
}

/// Hand an unprocessed delivery back to the stream
async fn release(delivery: Delivery) {
    if let Err(e) = delivery.nak(None).await {
        tracing::warn!(error = %e, "Failed to release delivery on shutdown");
    }
}
