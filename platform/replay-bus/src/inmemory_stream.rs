//! In-memory implementation of the DurableStream trait for testing and development

use crate::{
    subject, Acker, BusError, BusResult, ConsumerConfig, Delivery, DurableStream, StreamConfig,
    StreamConsumer,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// DurableStream implementation backed by process memory
///
/// Mirrors the JetStream semantics the sink relies on:
/// - durable consumers keep their position and ack state across handles, so
///   several workers sharing one durable name split the messages between them
/// - `max_ack_pending` bounds delivered-but-unacknowledged messages
/// - nak'd messages and messages not settled within `ack_wait` are redelivered
///   with an incremented delivery count
///
/// Time is measured with `tokio::time`, so tests can drive ack-wait expiry
/// with a paused clock.
///
/// # Example
/// ```rust
/// use replay_bus::{ConsumerConfig, DurableStream, InMemoryStream, StreamConfig};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryStream::new();
/// bus.ensure_stream(&StreamConfig::new("EVENTS", "events.rrweb")).await?;
/// let consumer = bus.ensure_consumer("EVENTS", &ConsumerConfig::new("workers")).await?;
///
/// bus.publish("events.rrweb", b"hello".to_vec()).await?;
///
/// let mut deliveries = consumer.fetch(10, Duration::from_millis(100)).await?;
/// let delivery = deliveries.pop().unwrap();
/// assert_eq!(delivery.payload, b"hello");
/// delivery.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStream {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

type ConsumerKey = (String, String);

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamState>,
    consumers: HashMap<ConsumerKey, ConsumerState>,
    next_token: u64,
}

struct StreamState {
    config: StreamConfig,
    messages: Vec<StoredMessage>,
}

struct StoredMessage {
    subject: String,
    payload: Vec<u8>,
}

struct ConsumerState {
    config: ConsumerConfig,
    /// Index of the next message never handed out
    cursor: usize,
    in_flight: HashMap<usize, InFlight>,
    redeliver: BTreeMap<usize, Redelivery>,
    attempts: HashMap<usize, u64>,
}

struct InFlight {
    token: u64,
    deadline: Instant,
}

struct Redelivery {
    not_before: Instant,
    last_token: u64,
}

impl ConsumerState {
    fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            cursor: 0,
            in_flight: HashMap::new(),
            redeliver: BTreeMap::new(),
            attempts: HashMap::new(),
        }
    }

    fn accepts(&self, message_subject: &str) -> bool {
        self.config
            .filter_subject
            .as_deref()
            .map_or(true, |filter| subject::matches(message_subject, filter))
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.deadline <= now)
            .map(|(index, _)| *index)
            .collect();

        for index in expired {
            if let Some(flight) = self.in_flight.remove(&index) {
                self.redeliver.insert(
                    index,
                    Redelivery {
                        not_before: now,
                        last_token: flight.token,
                    },
                );
            }
        }
    }

    /// Earliest future instant at which a fetch could find new work
    fn next_wake(&self, now: Instant) -> Option<Instant> {
        self.in_flight
            .values()
            .map(|flight| flight.deadline)
            .chain(self.redeliver.values().map(|r| r.not_before))
            .filter(|at| *at > now)
            .min()
    }
}

impl State {
    fn take_ready(
        &mut self,
        key: &ConsumerKey,
        max_batch: usize,
        shared: &Arc<Shared>,
    ) -> BusResult<(Vec<Delivery>, Option<Instant>)> {
        let now = Instant::now();
        let State {
            streams,
            consumers,
            next_token,
        } = self;

        let stream = streams
            .get(&key.0)
            .ok_or_else(|| BusError::FetchError(format!("stream {} not found", key.0)))?;
        let consumer = consumers.get_mut(key).ok_or_else(|| {
            BusError::FetchError(format!("consumer {} not found on {}", key.1, key.0))
        })?;

        consumer.expire(now);

        let budget = usize::try_from(consumer.config.max_ack_pending.max(1))
            .unwrap_or(usize::MAX)
            .saturating_sub(consumer.in_flight.len())
            .min(max_batch);

        // Redeliveries go out first, in stream order
        let mut picked: Vec<usize> = consumer
            .redeliver
            .iter()
            .filter(|(_, r)| r.not_before <= now)
            .map(|(index, _)| *index)
            .take(budget)
            .collect();
        for index in &picked {
            consumer.redeliver.remove(index);
        }

        while picked.len() < budget && consumer.cursor < stream.messages.len() {
            let index = consumer.cursor;
            consumer.cursor += 1;
            if consumer.accepts(&stream.messages[index].subject) {
                picked.push(index);
            }
        }

        let mut deliveries = Vec::with_capacity(picked.len());
        for index in picked {
            *next_token += 1;
            let token = *next_token;

            let attempts = consumer.attempts.entry(index).or_insert(0);
            *attempts += 1;

            consumer.in_flight.insert(
                index,
                InFlight {
                    token,
                    deadline: now + consumer.config.ack_wait,
                },
            );

            let message = &stream.messages[index];
            deliveries.push(Delivery::new(
                message.subject.clone(),
                message.payload.clone(),
                *attempts,
                Box::new(InMemoryAcker {
                    shared: Arc::clone(shared),
                    key: key.clone(),
                    index,
                    token,
                }),
            ));
        }

        Ok((deliveries, consumer.next_wake(now)))
    }
}

impl InMemoryStream {
    /// Create a new, empty in-memory stream provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages ever appended to `stream`
    pub fn message_count(&self, stream: &str) -> usize {
        self.shared
            .lock()
            .streams
            .get(stream)
            .map_or(0, |s| s.messages.len())
    }

    /// Raw payloads appended to `stream`, in append order
    pub fn payloads(&self, stream: &str) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .streams
            .get(stream)
            .map(|s| s.messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Delivered-but-unacknowledged messages of a durable consumer
    pub fn ack_pending(&self, stream: &str, durable_name: &str) -> usize {
        self.shared
            .lock()
            .consumers
            .get(&(stream.to_string(), durable_name.to_string()))
            .map_or(0, |c| c.in_flight.len())
    }

    /// Messages a durable consumer has not yet acknowledged: in flight,
    /// awaiting redelivery, or never delivered
    pub fn outstanding(&self, stream: &str, durable_name: &str) -> usize {
        let state = self.shared.lock();
        let key = (stream.to_string(), durable_name.to_string());
        let (Some(stream_state), Some(consumer)) = (state.streams.get(stream), state.consumers.get(&key))
        else {
            return 0;
        };

        let undelivered = stream_state.messages[consumer.cursor..]
            .iter()
            .filter(|m| consumer.accepts(&m.subject))
            .count();

        consumer.in_flight.len() + consumer.redeliver.len() + undelivered
    }
}

#[async_trait]
impl DurableStream for InMemoryStream {
    async fn ensure_stream(&self, config: &StreamConfig) -> BusResult<()> {
        let mut state = self.shared.lock();
        state
            .streams
            .entry(config.name.clone())
            .or_insert_with(|| StreamState {
                config: config.clone(),
                messages: Vec::new(),
            });
        Ok(())
    }

    async fn ensure_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
    ) -> BusResult<Arc<dyn StreamConsumer>> {
        let key = (stream.to_string(), config.durable_name.clone());
        {
            let mut state = self.shared.lock();
            if !state.streams.contains_key(stream) {
                return Err(BusError::ProvisionError(format!(
                    "consumer {} on missing stream {}",
                    config.durable_name, stream
                )));
            }
            state
                .consumers
                .entry(key.clone())
                .or_insert_with(|| ConsumerState::new(config.clone()));
        }

        Ok(Arc::new(InMemoryConsumer {
            shared: Arc::clone(&self.shared),
            key,
        }))
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        {
            let mut state = self.shared.lock();
            let stream = state
                .streams
                .values_mut()
                .find(|s| s.config.subjects.iter().any(|p| subject::matches(subject, p)))
                .ok_or_else(|| {
                    BusError::PublishError(format!("no stream bound to subject {}", subject))
                })?;

            stream.messages.push(StoredMessage {
                subject: subject.to_string(),
                payload,
            });
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct InMemoryConsumer {
    shared: Arc<Shared>,
    key: ConsumerKey,
}

#[async_trait]
impl StreamConsumer for InMemoryConsumer {
    async fn fetch(&self, max_batch: usize, timeout: Duration) -> BusResult<Vec<Delivery>> {
        let deadline = Instant::now() + timeout;

        // Every fetch is a scheduling point, as a network round trip would be,
        // so an immediate-redelivery loop cannot starve other tasks.
        tokio::task::yield_now().await;

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.shared.lock();
                let (deliveries, next_wake) =
                    state.take_ready(&self.key, max_batch, &self.shared)?;
                if !deliveries.is_empty() {
                    return Ok(deliveries);
                }
                next_wake
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_wake.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    key: ConsumerKey,
    index: usize,
    token: u64,
}

impl InMemoryAcker {
    /// Settle this delivery; `redeliver_at` of `None` means acknowledged.
    ///
    /// Settling a delivery that was already superseded by a redelivery is a no-op.
    fn settle(&self, redeliver_at: Option<Instant>) {
        {
            let mut state = self.shared.lock();
            let Some(consumer) = state.consumers.get_mut(&self.key) else {
                return;
            };

            let in_flight = consumer
                .in_flight
                .get(&self.index)
                .is_some_and(|flight| flight.token == self.token);
            let awaiting_redelivery = consumer
                .redeliver
                .get(&self.index)
                .is_some_and(|r| r.last_token == self.token);

            if !in_flight && !awaiting_redelivery {
                tracing::debug!(
                    stream = %self.key.0,
                    durable = %self.key.1,
                    "Ignoring settlement of superseded delivery"
                );
                return;
            }

            consumer.in_flight.remove(&self.index);
            match redeliver_at {
                Some(not_before) => {
                    consumer.redeliver.insert(
                        self.index,
                        Redelivery {
                            not_before,
                            last_token: self.token,
                        },
                    );
                }
                None => {
                    consumer.redeliver.remove(&self.index);
                    consumer.attempts.remove(&self.index);
                }
            }
        }

        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(self: Box<Self>) -> BusResult<()> {
        self.settle(None);
        Ok(())
    }

    async fn nak(self: Box<Self>, delay: Option<Duration>) -> BusResult<()> {
        self.settle(Some(Instant::now() + delay.unwrap_or_default()));
        Ok(())
    }
}
