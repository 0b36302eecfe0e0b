//! Process-level errors.
//!
//! Only startup failures end up here. Per-message failures are settled on the
//! stream (ack/nak) and never escalate to the process.

use crate::config::ConfigError;
use crate::store::StoreError;
use replay_bus::BusError;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("stream error: {0}")]
    Bus(#[from] BusError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
