//! Stream consumers that drain replay batches into the event store

pub mod pool;
pub mod sink_worker;
