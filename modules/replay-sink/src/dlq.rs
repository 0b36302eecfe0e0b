//! Dead-letter routing for poison messages
//!
//! A message whose payload can never be stored (undecodable JSON, invalid
//! envelope) would otherwise redeliver forever. Such messages are republished
//! to a dedicated dead-letter subject, wrapped with the failure reason, and
//! then acknowledged on the main stream by the caller.

use chrono::{DateTime, Utc};
use replay_bus::{Delivery, DurableStream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::consumer::sink_worker::SinkOutcome;

/// What lands on the dead-letter subject
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterRecord {
    /// Subject the message was originally consumed from
    pub subject: String,
    pub reason: String,
    /// Delivery attempt on which the message was rejected
    pub delivered: u64,
    pub failed_at: DateTime<Utc>,
    /// Original payload, lossily decoded as UTF-8
    pub payload: String,
}

impl DeadLetterRecord {
    pub fn new(delivery: &Delivery, reason: &str) -> Self {
        Self {
            subject: delivery.subject.clone(),
            reason: reason.to_string(),
            delivered: delivery.delivered,
            failed_at: Utc::now(),
            payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
        }
    }
}

/// Routes poison messages to the dead-letter subject, if one is configured
#[derive(Clone)]
pub struct DeadLetter {
    bus: Arc<dyn DurableStream>,
    subject: Option<String>,
}

impl DeadLetter {
    pub fn new(bus: Arc<dyn DurableStream>, subject: Option<String>) -> Self {
        Self { bus, subject }
    }

    /// Dead-lettering switched off; poison messages are dropped
    pub fn disabled(bus: Arc<dyn DurableStream>) -> Self {
        Self::new(bus, None)
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Publish the poison message to the dead-letter subject.
    ///
    /// Returns [`SinkOutcome::DeadLettered`] once the dead-letter stream has
    /// accepted it, otherwise [`SinkOutcome::Dropped`]. Either way the caller
    /// acknowledges the original delivery.
    pub async fn route(&self, delivery: &Delivery, reason: &str) -> SinkOutcome {
        let Some(subject) = &self.subject else {
            tracing::warn!(
                subject = %delivery.subject,
                delivered = delivery.delivered,
                reason = %reason,
                "Dropping poison message: dead-lettering disabled"
            );
            return SinkOutcome::Dropped;
        };

        let record = DeadLetterRecord::new(delivery, reason);
        let payload = match serde_json::to_vec(&record) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize dead-letter record");
                return SinkOutcome::Dropped;
            }
        };

        match self.bus.publish(subject, payload).await {
            Ok(()) => {
                tracing::warn!(
                    subject = %delivery.subject,
                    dlq_subject = %subject,
                    delivered = delivery.delivered,
                    reason = %reason,
                    "Poison message dead-lettered"
                );
                SinkOutcome::DeadLettered
            }
            Err(e) => {
                tracing::error!(
                    subject = %delivery.subject,
                    dlq_subject = %subject,
                    reason = %reason,
                    error = %e,
                    "Failed to dead-letter poison message, dropping it"
                );
                SinkOutcome::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use replay_bus::{Acker, BusResult, InMemoryStream, StreamConfig};
    use std::time::Duration;

    struct NoopAcker;

    #[async_trait]
    impl Acker for NoopAcker {
        async fn ack(self: Box<Self>) -> BusResult<()> {
            Ok(())
        }

        async fn nak(self: Box<Self>, _delay: Option<Duration>) -> BusResult<()> {
            Ok(())
        }
    }

    fn poison() -> Delivery {
        Delivery::new(
            "events.rrweb".to_string(),
            b"{not json".to_vec(),
            1,
            Box::new(NoopAcker),
        )
    }

    #[tokio::test]
    async fn test_route_publishes_record() {
        let bus = InMemoryStream::new();
        bus.ensure_stream(&StreamConfig::new("EVENTS_DLQ", "events.rrweb.dlq"))
            .await
            .unwrap();
        let dlq = DeadLetter::new(Arc::new(bus.clone()), Some("events.rrweb.dlq".to_string()));

        let outcome = dlq.route(&poison(), "malformed envelope").await;

        assert_eq!(outcome, SinkOutcome::DeadLettered);
        let payloads = bus.payloads("EVENTS_DLQ");
        assert_eq!(payloads.len(), 1);
        let record: DeadLetterRecord = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(record.subject, "events.rrweb");
        assert_eq!(record.reason, "malformed envelope");
        assert_eq!(record.payload, "{not json");
        assert_eq!(record.delivered, 1);
    }

    #[tokio::test]
    async fn test_route_without_subject_drops() {
        let dlq = DeadLetter::disabled(Arc::new(InMemoryStream::new()));
        assert_eq!(dlq.route(&poison(), "bad").await, SinkOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_route_drops_when_publish_fails() {
        // No stream bound to the dead-letter subject, so publish is rejected
        let dlq = DeadLetter::new(
            Arc::new(InMemoryStream::new()),
            Some("events.rrweb.dlq".to_string()),
        );
        assert_eq!(dlq.route(&poison(), "bad").await, SinkOutcome::Dropped);
    }
}
