//! # Batch Envelope
//!
//! The unit of transfer between the intake boundary and the sink: one chunk
//! of replay events for a (project, session), stamped with the client's
//! sequence number and the intake timestamp.
//!
//! ## Wire Format
//!
//! JSON object:
//!
//! - `project_id`: positive integer tenant identifier
//! - `session_id`: UUID of the playback session
//! - `seq`: client sequence number (defaults to 0)
//! - `ts`: RFC 3339 timestamp; any offset is normalised to UTC
//! - `events`: ordered array of opaque replay events (defaults to empty)
//! - `url`, `user`: optional intake context, carried but not stored
//!
//! The stream may redeliver an envelope but never mutates it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Errors produced while decoding or validating an envelope
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid project_id: must be a positive integer")]
    InvalidProjectId,
}

/// End-user identity attached by the intake boundary
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_anonymous")]
    pub anonymous: bool,
}

fn default_anonymous() -> bool {
    true
}

/// One published chunk of replay events for a session
///
/// # Examples
///
/// ```rust
/// use replay_bus::BatchEnvelope;
/// use chrono::Utc;
/// use serde_json::json;
/// use uuid::Uuid;
///
/// let envelope = BatchEnvelope::new(7, Uuid::new_v4(), 0, Utc::now(), vec![json!({"type": 4})])
///     .with_url(Some("https://example.com/".to_string()));
///
/// let bytes = envelope.to_vec().unwrap();
/// assert_eq!(BatchEnvelope::from_slice(&bytes).unwrap(), envelope);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEnvelope {
    /// Tenant identifier, immutable once assigned
    pub project_id: u64,

    /// Playback session this chunk belongs to
    pub session_id: Uuid,

    /// Client-assigned sequence number, increasing per session
    #[serde(default)]
    pub seq: u64,

    /// Batch creation time, the primary ordering key
    pub ts: DateTime<Utc>,

    /// Inner replay events, order preserved verbatim
    #[serde(default)]
    pub events: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

impl BatchEnvelope {
    pub fn new(
        project_id: u64,
        session_id: Uuid,
        seq: u64,
        ts: DateTime<Utc>,
        events: Vec<Value>,
    ) -> Self {
        Self {
            project_id,
            session_id,
            seq,
            ts,
            events,
            url: None,
            user: None,
        }
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }

    pub fn with_user(mut self, user: Option<UserInfo>) -> Self {
        self.user = user;
        self
    }

    /// Decode and validate an envelope from a message payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(payload)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Encode the envelope for publishing
    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.project_id == 0 {
            return Err(EnvelopeError::InvalidProjectId);
        }
        Ok(())
    }

    /// Serialize the inner events array, the form persisted by the store
    pub fn events_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(&self.events)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const SESSION: &str = "550e8400-e29b-41d4-a716-446655440000";

    #[test]
    fn test_decode_full_envelope() {
        let payload = json!({
            "project_id": 1,
            "session_id": SESSION,
            "seq": 3,
            "ts": "2026-02-12T10:00:00.250+00:00",
            "url": "https://shop.example/cart",
            "user": {"id": "u-1", "email": "a@example.com", "anonymous": false},
            "events": [{"type": 2}, {"type": 3}]
        });

        let envelope = BatchEnvelope::from_slice(&serde_json::to_vec(&payload).unwrap()).unwrap();

        assert_eq!(envelope.project_id, 1);
        assert_eq!(envelope.session_id, Uuid::parse_str(SESSION).unwrap());
        assert_eq!(envelope.seq, 3);
        assert_eq!(envelope.events, vec![json!({"type": 2}), json!({"type": 3})]);
        assert_eq!(envelope.url.as_deref(), Some("https://shop.example/cart"));
        assert_eq!(envelope.user.unwrap().id.as_deref(), Some("u-1"));
    }

    #[test]
    fn test_offset_timestamp_normalised_to_utc() {
        let payload = json!({
            "project_id": 1,
            "session_id": SESSION,
            "ts": "2026-02-12T12:00:00+02:00",
            "events": []
        });

        let envelope = BatchEnvelope::from_slice(&serde_json::to_vec(&payload).unwrap()).unwrap();

        assert_eq!(envelope.ts, Utc.with_ymd_and_hms(2026, 2, 12, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_missing_seq_and_events_default() {
        let payload = json!({
            "project_id": 9,
            "session_id": SESSION,
            "ts": "2026-02-12T10:00:00Z",
            "url": null,
            "user": null
        });

        let envelope = BatchEnvelope::from_slice(&serde_json::to_vec(&payload).unwrap()).unwrap();

        assert_eq!(envelope.seq, 0);
        assert!(envelope.events.is_empty());
        assert!(envelope.url.is_none());
        assert!(envelope.user.is_none());
    }

    #[test]
    fn test_rejects_zero_project_id() {
        let payload = json!({
            "project_id": 0,
            "session_id": SESSION,
            "ts": "2026-02-12T10:00:00Z",
            "events": []
        });

        let err = BatchEnvelope::from_slice(&serde_json::to_vec(&payload).unwrap()).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidProjectId));
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        let cases: Vec<&[u8]> = vec![
            b"not json",
            br#"{"project_id": 1, "ts": "2026-02-12T10:00:00Z"}"#,
            br#"{"project_id": 1, "session_id": "nope", "ts": "2026-02-12T10:00:00Z"}"#,
            br#"{"project_id": -4, "session_id": "550e8400-e29b-41d4-a716-446655440000", "ts": "2026-02-12T10:00:00Z"}"#,
            br#"{"project_id": 1, "session_id": "550e8400-e29b-41d4-a716-446655440000", "ts": "yesterday"}"#,
        ];

        for payload in cases {
            let err = BatchEnvelope::from_slice(payload).unwrap_err();
            assert!(
                matches!(err, EnvelopeError::Malformed(_)),
                "expected malformed error for {}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn test_events_json_preserves_order() {
        let envelope = BatchEnvelope::new(
            1,
            Uuid::new_v4(),
            0,
            Utc::now(),
            vec![json!("B"), json!("C"), json!({"nested": [1, 2]})],
        );

        assert_eq!(envelope.events_json().unwrap(), r#"["B","C",{"nested":[1,2]}]"#);
    }
}
