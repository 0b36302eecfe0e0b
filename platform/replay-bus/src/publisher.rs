//! Intake-side publisher for batch envelopes

use crate::{BatchEnvelope, BusError, BusResult, DurableStream};
use std::sync::Arc;

/// Publishes one serialized [`BatchEnvelope`] per accepted client request
/// onto the fixed intake subject.
///
/// Publishing resolves once the stream has accepted the write; there is no
/// dependency on the sink having processed it.
#[derive(Clone)]
pub struct BatchPublisher {
    bus: Arc<dyn DurableStream>,
    subject: String,
}

impl BatchPublisher {
    pub fn new(bus: Arc<dyn DurableStream>, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn publish(&self, envelope: &BatchEnvelope) -> BusResult<()> {
        envelope
            .validate()
            .map_err(|e| BusError::SerializationError(e.to_string()))?;
        let payload = envelope
            .to_vec()
            .map_err(|e| BusError::SerializationError(e.to_string()))?;

        self.bus.publish(&self.subject, payload).await?;

        tracing::debug!(
            subject = %self.subject,
            project_id = envelope.project_id,
            session_id = %envelope.session_id,
            seq = envelope.seq,
            "Published replay batch"
        );

        Ok(())
    }
}
