pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod health;
pub mod jetstream_setup;
pub mod metrics;
pub mod reconstruct;
pub mod store;

pub use consumer::pool::{SinkPool, SinkPoolHandle};
pub use consumer::sink_worker::{SinkOutcome, SinkSettings, SinkStats, SinkWorker};
pub use error::SinkError;
pub use reconstruct::{Reconstructor, Replay, SkipReason, SkippedRow};
pub use store::{EventStore, NewRow, StoreError, StoredRow};
