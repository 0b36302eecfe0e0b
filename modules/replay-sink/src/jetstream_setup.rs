use replay_bus::{ConsumerConfig, DurableStream, StreamConfig, StreamConsumer};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::SinkError;
use crate::store::EventStore;

const DLQ_MAX_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// Provision everything the sink needs before it starts fetching.
///
/// Every step is create-if-absent and safe to race against other instances.
/// Any failure here is fatal for the process.
pub async fn provision(
    bus: &dyn DurableStream,
    store: &dyn EventStore,
    config: &Config,
) -> Result<Arc<dyn StreamConsumer>, SinkError> {
    // Main stream
    bus.ensure_stream(
        &StreamConfig::new(&config.stream_name, &config.subject).with_max_age(config.stream_max_age),
    )
    .await?;

    // Dead-letter stream
    if let Some(dlq_subject) = &config.dlq_subject {
        bus.ensure_stream(&StreamConfig::new(&config.dlq_stream, dlq_subject).with_max_age(DLQ_MAX_AGE))
            .await?;
    }

    let consumer = bus
        .ensure_consumer(
            &config.stream_name,
            &ConsumerConfig::new(&config.durable_name)
                .with_filter_subject(&config.subject)
                .with_max_ack_pending(config.max_ack_pending)
                .with_ack_wait(config.ack_wait),
        )
        .await?;

    store.ensure_schema().await?;

    tracing::info!(
        stream = %config.stream_name,
        subject = %config.subject,
        durable = %config.durable_name,
        dlq_subject = %config.dlq_subject.as_deref().unwrap_or("disabled"),
        "Stream, consumer and store schema provisioned"
    );

    Ok(consumer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use replay_bus::InMemoryStream;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let bus = InMemoryStream::new();
        let store = InMemoryStore::new();
        let config = config(&[]);

        provision(&bus, &store, &config).await.unwrap();
        provision(&bus, &store, &config).await.unwrap();

        bus.publish("events.rrweb", b"{}".to_vec()).await.unwrap();
        bus.publish("events.rrweb.dlq", b"{}".to_vec()).await.unwrap();
        assert_eq!(bus.message_count("EVENTS"), 1);
        assert_eq!(bus.message_count("EVENTS_DLQ"), 1);
    }

    #[tokio::test]
    async fn test_provision_without_dlq() {
        let bus = InMemoryStream::new();
        let store = InMemoryStore::new();

        provision(&bus, &store, &config(&[("NATS_DLQ_SUBJECT", "")]))
            .await
            .unwrap();

        assert!(bus.publish("events.rrweb.dlq", b"{}".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_provision_fails_when_store_unreachable() {
        let bus = InMemoryStream::new();
        let store = InMemoryStore::new();
        store.set_available(false);

        let result = provision(&bus, &store, &config(&[])).await;
        assert!(matches!(result, Err(SinkError::Store(_))));
    }
}
