//! NATS JetStream implementation of the DurableStream trait

use crate::{
    Acker, BusError, BusResult, ConsumerConfig, Delivery, DurableStream, StreamConfig,
    StreamConsumer,
};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream, AckKind,
};
use async_nats::Client;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// DurableStream implementation using NATS JetStream
///
/// Streams are file-backed; consumers are durable pull consumers with an
/// explicit ack policy, so a crashed worker's unacknowledged messages are
/// redelivered to whichever worker pulls next.
///
/// # Example
/// ```rust,no_run
/// use replay_bus::{DurableStream, JetStreamBus, StreamConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = JetStreamBus::new(client);
///
/// bus.ensure_stream(&StreamConfig::new("EVENTS", "events.rrweb")).await?;
/// bus.publish("events.rrweb", b"{}".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct JetStreamBus {
    client: Client,
    context: jetstream::Context,
}

impl JetStreamBus {
    /// Create a new JetStreamBus from an existing NATS client
    pub fn new(client: Client) -> Self {
        let context = jetstream::new(client.clone());
        Self { client, context }
    }

    /// Connect to a NATS server and wrap the client
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::ConnectionError(format!("{}: {}", url, e)))?;
        Ok(Self::new(client))
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl DurableStream for JetStreamBus {
    async fn ensure_stream(&self, config: &StreamConfig) -> BusResult<()> {
        let stream_config = stream::Config {
            name: config.name.clone(),
            subjects: config.subjects.clone(),
            storage: stream::StorageType::File,
            max_age: config.max_age,
            ..Default::default()
        };

        match self.context.get_or_create_stream(stream_config).await {
            Ok(_) => {
                tracing::debug!(stream = %config.name, "Stream ready");
                Ok(())
            }
            Err(create_err) => {
                // Lost a creation race with another instance: the stream exists now.
                match self.context.get_stream(&config.name).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(BusError::ProvisionError(format!(
                        "stream {}: {}",
                        config.name, create_err
                    ))),
                }
            }
        }
    }

    async fn ensure_consumer(
        &self,
        stream_name: &str,
        config: &ConsumerConfig,
    ) -> BusResult<Arc<dyn StreamConsumer>> {
        let stream = self.context.get_stream(stream_name).await.map_err(|e| {
            BusError::ProvisionError(format!("consumer on missing stream {}: {}", stream_name, e))
        })?;

        let consumer_config = pull::Config {
            durable_name: Some(config.durable_name.clone()),
            ack_policy: AckPolicy::Explicit,
            ack_wait: config.ack_wait,
            max_ack_pending: config.max_ack_pending,
            filter_subject: config.filter_subject.clone().unwrap_or_default(),
            ..Default::default()
        };

        let consumer: PullConsumer = match stream
            .get_or_create_consumer(&config.durable_name, consumer_config)
            .await
        {
            Ok(consumer) => consumer,
            Err(create_err) => stream
                .get_consumer::<pull::Config>(&config.durable_name)
                .await
                .map_err(|_| {
                    BusError::ProvisionError(format!(
                        "consumer {} on {}: {}",
                        config.durable_name, stream_name, create_err
                    ))
                })?,
        };

        tracing::debug!(
            stream = %stream_name,
            durable = %config.durable_name,
            "Durable consumer ready"
        );

        Ok(Arc::new(JetStreamConsumer { consumer }))
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        let ack = self
            .context
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        ack.await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }
}

/// Pull consumer handle; clones of the same durable share delivery state on the server
struct JetStreamConsumer {
    consumer: PullConsumer,
}

#[async_trait]
impl StreamConsumer for JetStreamConsumer {
    async fn fetch(&self, max_batch: usize, timeout: Duration) -> BusResult<Vec<Delivery>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max_batch)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| BusError::FetchError(e.to_string()))?;

        let mut deliveries = Vec::new();
        while let Some(message) = batch.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) if deliveries.is_empty() => {
                    return Err(BusError::FetchError(e.to_string()));
                }
                Err(e) => {
                    // Keep what already arrived; the rest is redelivered after ack_wait.
                    tracing::debug!(error = %e, "Fetch batch ended early");
                    break;
                }
            };

            let delivered = message
                .info()
                .map(|info| info.delivered.max(1) as u64)
                .unwrap_or(1);
            let subject = message.subject.to_string();
            let payload = message.payload.to_vec();

            deliveries.push(Delivery::new(
                subject,
                payload,
                delivered,
                Box::new(JetStreamAcker { message }),
            ));
        }

        Ok(deliveries)
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(self: Box<Self>) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn nak(self: Box<Self>, delay: Option<Duration>) -> BusResult<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running NATS server with JetStream enabled:
    // docker run -p 4222:4222 nats:2.10-alpine -js

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_jetstream_provisioning_is_idempotent() {
        let bus = JetStreamBus::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let stream = StreamConfig::new("REPLAY_BUS_TEST", "replay-bus-test.events");
        let consumer = ConsumerConfig::new("replay-bus-test-workers");

        for _ in 0..2 {
            bus.ensure_stream(&stream).await.unwrap();
            bus.ensure_consumer(&stream.name, &consumer).await.unwrap();
        }
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_jetstream_nak_redelivers() {
        let bus = JetStreamBus::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let stream = StreamConfig::new("REPLAY_BUS_NAK", "replay-bus-nak.events");
        bus.ensure_stream(&stream).await.unwrap();
        let consumer = bus
            .ensure_consumer(&stream.name, &ConsumerConfig::new("replay-bus-nak-workers"))
            .await
            .unwrap();

        // Drain leftovers from earlier runs
        for delivery in consumer.fetch(100, Duration::from_millis(200)).await.unwrap() {
            delivery.ack().await.unwrap();
        }

        bus.publish("replay-bus-nak.events", b"payload".to_vec())
            .await
            .unwrap();

        let first = consumer.fetch(1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delivered, 1);
        first.into_iter().next().unwrap().nak(None).await.unwrap();

        let second = consumer.fetch(1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload, b"payload");
        assert_eq!(second[0].delivered, 2);
        second.into_iter().next().unwrap().ack().await.unwrap();
    }
}
