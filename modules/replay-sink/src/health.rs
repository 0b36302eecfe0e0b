use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use replay_bus::DurableStream;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::metrics::Metrics;
use crate::store::EventStore;

#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn EventStore>,
    pub bus: Arc<dyn DurableStream>,
    pub metrics: Metrics,
}

impl HealthState {
    /// Refresh the stream gauge from the live connection state
    pub fn check_stream(&self) -> bool {
        let connected = self.bus.is_connected();
        self.metrics.set_dependency("nats", connected);
        connected
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "replay-sink",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn ready(State(state): State<Arc<HealthState>>) -> Result<Json<Value>, StatusCode> {
    // Store check
    let store_ok = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Event store ping failed");
            false
        }
    };
    state.metrics.set_dependency("store", store_ok);

    let nats_ok = state.check_stream();

    if !store_ok || !nats_ok {
        state.metrics.set_dependency("ready", false);
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    state.metrics.set_dependency("ready", true);

    Ok(Json(json!({
        "status": "ready",
        "store": "connected",
        "nats": "connected"
    })))
}

pub async fn metrics(State(state): State<Arc<HealthState>>) -> Result<String, StatusCode> {
    state.metrics.render().map_err(|e| {
        tracing::error!(error = %e, "Failed to render metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
