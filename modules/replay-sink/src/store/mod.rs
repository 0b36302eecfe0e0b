//! Columnar event store
//!
//! Append-only persistence of replay batches. Each successfully sunk batch
//! becomes one immutable [`StoredRow`]; rows are never updated, only expired
//! by the store's retention TTL.
//!
//! ## Implementations
//!
//! - **ClickHouseStore**: MergeTree table partitioned by month, ordered by
//!   (project_id, session_id, ts, seq), ZSTD-compressed payloads
//! - **InMemoryStore**: process-local store for tests and local runs

mod clickhouse;
mod inmemory;

pub use self::clickhouse::ClickHouseStore;
pub use self::inmemory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use replay_bus::{BatchEnvelope, EnvelopeError};
use uuid::Uuid;

/// Errors returned by event store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] ::clickhouse::error::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A row about to be appended; `event_id` and `ingest_ts` are assigned by the store
#[derive(Debug, Clone, PartialEq)]
pub struct NewRow {
    pub project_id: u64,
    pub session_id: Uuid,
    pub seq: u64,
    /// Millisecond precision, as the store keeps it
    pub ts: DateTime<Utc>,
    /// Serialized inner events array
    pub payload: String,
}

impl NewRow {
    /// Flatten a batch envelope into its persisted form
    pub fn from_envelope(envelope: &BatchEnvelope) -> Result<Self, EnvelopeError> {
        Ok(Self {
            project_id: envelope.project_id,
            session_id: envelope.session_id,
            seq: envelope.seq,
            ts: envelope.ts.trunc_subsecs(3),
            payload: envelope.events_json()?,
        })
    }
}

/// A persisted, immutable replay batch
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub project_id: u64,
    pub session_id: Uuid,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub payload: String,
    pub event_id: Uuid,
    pub ingest_ts: DateTime<Utc>,
}

/// Append-only storage of replay batches, queryable per session
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Create the database and table if absent; safe to run from many
    /// instances at once
    async fn ensure_schema(&self) -> StoreResult<()>;

    /// Append one row. The session does not need to exist beforehand.
    async fn insert(&self, row: &NewRow) -> StoreResult<()>;

    /// All rows of a session ordered by (ts ascending, seq ascending)
    async fn query_session(&self, project_id: u64, session_id: Uuid) -> StoreResult<Vec<StoredRow>>;

    /// Cheap reachability probe
    async fn ping(&self) -> StoreResult<()>;
}
