//! # Replay Bus
//!
//! Durable stream contract for session-replay batches.
//!
//! The intake boundary publishes one [`BatchEnvelope`] per accepted client
//! request; sink workers drain the stream through a durable pull consumer
//! with explicit acknowledgment. This crate owns the *usage contract* of the
//! stream (idempotent provisioning, fetch, ack/nak), not its replication.
//!
//! ## Implementations
//!
//! - **JetStreamBus**: production implementation backed by NATS JetStream
//! - **InMemoryStream**: process-local implementation for tests and local runs
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replay_bus::{ConsumerConfig, DurableStream, JetStreamBus, StreamConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = JetStreamBus::connect("nats://localhost:4222").await?;
//!
//! bus.ensure_stream(&StreamConfig::new("EVENTS", "events.rrweb")).await?;
//! let consumer = bus
//!     .ensure_consumer("EVENTS", &ConsumerConfig::new("rrhog-workers"))
//!     .await?;
//!
//! for delivery in consumer.fetch(100, Duration::from_secs(1)).await? {
//!     println!("{} bytes on {}", delivery.payload.len(), delivery.subject);
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod envelope;
mod inmemory_stream;
mod jetstream_bus;
mod publisher;
pub mod subject;

pub use envelope::{BatchEnvelope, EnvelopeError, UserInfo};
pub use inmemory_stream::InMemoryStream;
pub use jetstream_bus::JetStreamBus;
pub use publisher::BatchPublisher;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Errors that can occur when using the durable stream
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to fetch messages: {0}")]
    FetchError(String),

    #[error("failed to acknowledge message: {0}")]
    AckError(String),

    #[error("failed to provision {0}")]
    ProvisionError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Result type for durable stream operations
pub type BusResult<T> = Result<T, BusError>;

/// Definition of a durable, disk-backed stream bound to one or more subjects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    /// How long the stream keeps messages regardless of acknowledgment
    pub max_age: Duration,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subjects: vec![subject.into()],
            max_age: Duration::from_secs(60 * 60 * 24 * 14),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}

/// Definition of a durable pull consumer with explicit acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub durable_name: String,
    /// Restrict delivery to one subject of the stream
    pub filter_subject: Option<String>,
    /// Upper bound on delivered-but-unacknowledged messages across all workers
    pub max_ack_pending: i64,
    /// Deadline after which an unacknowledged delivery is redelivered
    pub ack_wait: Duration,
}

impl ConsumerConfig {
    pub fn new(durable_name: impl Into<String>) -> Self {
        Self {
            durable_name: durable_name.into(),
            filter_subject: None,
            max_ack_pending: 1000,
            ack_wait: Duration::from_secs(30),
        }
    }

    pub fn with_filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }

    pub fn with_max_ack_pending(mut self, max_ack_pending: i64) -> Self {
        self.max_ack_pending = max_ack_pending;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }
}

/// Settles a single delivery with the stream provider
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(self: Box<Self>) -> BusResult<()>;

    async fn nak(self: Box<Self>, delay: Option<Duration>) -> BusResult<()>;
}

/// One message handed to a consumer, awaiting acknowledgment
///
/// A delivery is settled exactly once: [`Delivery::ack`] and
/// [`Delivery::nak`] consume it. Dropping it unsettled leaves redelivery to
/// the provider's ack-wait deadline.
pub struct Delivery {
    /// The subject the message was published to
    pub subject: String,
    /// The raw message payload
    pub payload: Vec<u8>,
    /// Delivery attempt number, starting at 1
    pub delivered: u64,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(subject: String, payload: Vec<u8>, delivered: u64, acker: Box<dyn Acker>) -> Self {
        Self {
            subject,
            payload,
            delivered,
            acker,
        }
    }

    /// Acknowledge successful processing; the message will not redeliver
    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }

    /// Signal failed processing; the message becomes eligible for redelivery
    /// after `delay` (or the provider's default backoff)
    pub async fn nak(self, delay: Option<Duration>) -> BusResult<()> {
        self.acker.nak(delay).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("delivered", &self.delivered)
            .finish()
    }
}

/// A durable pull consumer handle
///
/// Handles for the same durable name share acknowledgment state, so several
/// workers pulling through one name never hold the same unacknowledged
/// message at the same time.
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    /// Pull up to `max_batch` pending messages, waiting at most `timeout`.
    ///
    /// An empty result is the normal idle condition, not an error.
    async fn fetch(&self, max_batch: usize, timeout: Duration) -> BusResult<Vec<Delivery>>;
}

/// Durable stream abstraction
///
/// Both provisioning operations are idempotent and tolerate concurrent
/// creators: an instance that loses the creation race treats the existing
/// stream or consumer as success.
#[async_trait]
pub trait DurableStream: Send + Sync {
    /// Create the stream if absent; no-op if present
    async fn ensure_stream(&self, config: &StreamConfig) -> BusResult<()>;

    /// Create the durable consumer on `stream` if absent and return a handle
    async fn ensure_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
    ) -> BusResult<Arc<dyn StreamConsumer>>;

    /// Publish a payload, resolving once the stream has accepted the write
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Whether the connection to the provider is currently usable
    fn is_connected(&self) -> bool {
        true
    }
}

impl fmt::Debug for dyn DurableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DurableStream")
    }
}
