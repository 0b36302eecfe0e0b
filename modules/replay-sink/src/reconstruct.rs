//! Replay reconstruction
//!
//! Turns the stored rows of one session back into the flat event sequence a
//! player consumes. Rows arrive in (ts, seq) order from the store; their
//! payloads are concatenated in that order and never re-sorted internally.
//!
//! A row whose payload cannot be used is skipped and reported, never raised:
//! one bad batch must not make the rest of a session unplayable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::store::{EventStore, StoreError, StoredRow};

/// Why a stored row contributed no events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Payload is not valid JSON
    InvalidJson(String),
    /// Payload is JSON but neither an array nor an object with an `events` array
    UnexpectedShape,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidJson(e) => write!(f, "invalid JSON: {}", e),
            SkipReason::UnexpectedShape => write!(f, "payload is not an events array"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    pub event_id: Uuid,
    pub seq: u64,
    pub reason: SkipReason,
}

/// A reconstructed session
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    pub session_id: Uuid,
    pub events: Vec<Value>,
    pub rows_read: usize,
    pub skipped: Vec<SkippedRow>,
}

impl Replay {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_response(self) -> ReplayResponse {
        ReplayResponse {
            session_id: self.session_id,
            events: self.events,
        }
    }
}

/// Body returned to replay readers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayResponse {
    pub session_id: Uuid,
    pub events: Vec<Value>,
}

/// Events carried by one stored payload.
///
/// Accepts a bare array, or an object holding the array under `events`.
pub fn extract_events(payload: &str) -> Result<Vec<Value>, SkipReason> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| SkipReason::InvalidJson(e.to_string()))?;

    match value {
        Value::Array(events) => Ok(events),
        Value::Object(mut map) => match map.remove("events") {
            Some(Value::Array(events)) => Ok(events),
            _ => Err(SkipReason::UnexpectedShape),
        },
        _ => Err(SkipReason::UnexpectedShape),
    }
}

/// Concatenate the events of already-ordered rows
pub fn merge_rows(session_id: Uuid, rows: &[StoredRow]) -> Replay {
    let mut events = Vec::new();
    let mut skipped = Vec::new();

    for row in rows {
        match extract_events(&row.payload) {
            Ok(mut batch) => events.append(&mut batch),
            Err(reason) => skipped.push(SkippedRow {
                event_id: row.event_id,
                seq: row.seq,
                reason,
            }),
        }
    }

    Replay {
        session_id,
        events,
        rows_read: rows.len(),
        skipped,
    }
}

/// Reads a session from the event store and rebuilds its event sequence
#[derive(Clone)]
pub struct Reconstructor {
    store: Arc<dyn EventStore>,
    metrics: Option<Metrics>,
}

impl Reconstructor {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Rebuild one session. An unknown session yields an empty replay.
    pub async fn reconstruct(&self, project_id: u64, session_id: Uuid) -> Result<Replay, StoreError> {
        let rows = self.store.query_session(project_id, session_id).await?;
        let replay = merge_rows(session_id, &rows);

        for skipped in &replay.skipped {
            tracing::warn!(
                project_id,
                session_id = %session_id,
                seq = skipped.seq,
                event_id = %skipped.event_id,
                reason = %skipped.reason,
                "Skipping malformed replay row"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .replay_rows_skipped_total
                .inc_by(replay.skipped.len() as u64);
        }

        tracing::debug!(
            project_id,
            session_id = %session_id,
            rows = replay.rows_read,
            events = replay.events.len(),
            skipped = replay.skipped.len(),
            "Reconstructed session"
        );

        Ok(replay)
    }
}
