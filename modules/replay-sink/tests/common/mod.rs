//! Common test utilities for replay-sink integration tests
//!
//! Builds an in-process pipeline (InMemoryStream → SinkPool → InMemoryStore)
//! provisioned exactly the way the daemon provisions itself, so tests exercise
//! the real startup path without NATS or ClickHouse.

#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use replay_bus::{BatchEnvelope, BatchPublisher, DurableStream, InMemoryStream, StreamConsumer};
use replay_sink::config::Config;
use replay_sink::dlq::DeadLetter;
use replay_sink::jetstream_setup::provision;
use replay_sink::metrics::Metrics;
use replay_sink::store::InMemoryStore;
use replay_sink::{SinkPool, SinkPoolHandle, SinkSettings};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const STREAM: &str = "EVENTS";
pub const SUBJECT: &str = "events.rrweb";
pub const DURABLE: &str = "rrhog-workers";
pub const DLQ_STREAM: &str = "EVENTS_DLQ";
pub const PROJECT_ID: u64 = 7;

/// Configuration with fast fetch timings; `overrides` replace individual variables
pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("BUS_TYPE", "inmemory"),
        ("STORE_TYPE", "inmemory"),
        ("FETCH_TIMEOUT_MS", "50"),
        ("IDLE_BACKOFF_MS", "10"),
        ("NAK_DELAY_MS", "0"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }

    Config::from_lookup(|key| vars.get(key).cloned()).expect("valid test config")
}

/// A provisioned in-memory pipeline, workers not yet started
pub struct Pipeline {
    pub bus: InMemoryStream,
    pub store: InMemoryStore,
    pub consumer: Arc<dyn StreamConsumer>,
    pub config: Config,
    pub metrics: Metrics,
}

impl Pipeline {
    pub async fn new(overrides: &[(&str, &str)]) -> Self {
        let config = test_config(overrides);
        let bus = InMemoryStream::new();
        let store = InMemoryStore::new();
        let consumer = provision(&bus, &store, &config)
            .await
            .expect("provisioning succeeds");

        Self {
            bus,
            store,
            consumer,
            config,
            metrics: Metrics::new().expect("metrics registry"),
        }
    }

    pub fn publisher(&self) -> BatchPublisher {
        BatchPublisher::new(Arc::new(self.bus.clone()), &self.config.subject)
    }

    /// Start `workers` sink workers on the shared durable consumer
    pub fn start(&self, workers: usize) -> SinkPoolHandle {
        SinkPool::spawn(
            workers,
            Arc::clone(&self.consumer),
            Arc::new(self.store.clone()),
            DeadLetter::new(Arc::new(self.bus.clone()), self.config.dlq_subject.clone()),
            SinkSettings::from_config(&self.config),
            Some(self.metrics.clone()),
        )
    }

    pub async fn publish_raw(&self, payload: &[u8]) {
        self.bus
            .publish(&self.config.subject, payload.to_vec())
            .await
            .expect("publish raw payload");
    }

    /// Wait until the store holds at least `count` rows
    pub async fn wait_for_rows(&self, count: usize) -> bool {
        wait_until(Duration::from_secs(5), || self.store.rows().len() >= count).await
    }

    /// Wait until every message on the main stream has been acknowledged
    pub async fn wait_for_drain(&self) -> bool {
        wait_until(Duration::from_secs(5), || {
            self.bus.outstanding(STREAM, DURABLE) == 0
        })
        .await
    }
}

/// Fixed base timestamp for deterministic ordering
pub fn base_ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
}

pub fn batch(session_id: uuid::Uuid, seq: u64, offset_ms: i64, events: Vec<Value>) -> BatchEnvelope {
    BatchEnvelope::new(
        PROJECT_ID,
        session_id,
        seq,
        base_ts() + ChronoDuration::milliseconds(offset_ms),
        events,
    )
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
