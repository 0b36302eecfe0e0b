use futures::future::join_all;
use replay_bus::StreamConsumer;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::consumer::sink_worker::{SinkSettings, SinkStats, SinkWorker};
use crate::dlq::DeadLetter;
use crate::metrics::Metrics;
use crate::store::EventStore;

/// Fixed-size group of sink workers pulling through one durable consumer
pub struct SinkPool;

impl SinkPool {
    /// Spawn `worker_count` workers that share `consumer`.
    ///
    /// Workers share the durable consumer's ack state, so the stream splits
    /// messages between them like a queue group.
    pub fn spawn(
        worker_count: usize,
        consumer: Arc<dyn StreamConsumer>,
        store: Arc<dyn EventStore>,
        dead_letter: DeadLetter,
        settings: SinkSettings,
        metrics: Option<Metrics>,
    ) -> SinkPoolHandle {
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(worker_count);
        let mut stats = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let mut worker = SinkWorker::new(
                id,
                Arc::clone(&consumer),
                Arc::clone(&store),
                dead_letter.clone(),
                settings.clone(),
            );
            if let Some(metrics) = &metrics {
                worker = worker.with_metrics(metrics.clone());
            }
            stats.push(worker.stats());
            tasks.push(tokio::spawn(worker.run(rx.clone())));
        }

        tracing::info!(workers = worker_count, "Sink pool started");

        SinkPoolHandle {
            shutdown,
            tasks,
            stats,
        }
    }
}

/// Owner of a running [`SinkPool`]
pub struct SinkPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Vec<Arc<SinkStats>>,
}

impl SinkPoolHandle {
    /// Per-worker outcome counters, indexed by worker id
    pub fn stats(&self) -> &[Arc<SinkStats>] {
        &self.stats
    }

    pub fn worker_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every worker to stop and wait until each has settled its
    /// in-progress message and exited
    pub async fn shutdown(self) {
        tracing::info!("Stopping sink pool");
        // Receivers only go away once their workers have exited.
        let _ = self.shutdown.send(true);

        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Sink worker task failed");
            }
        }
        tracing::info!("Sink pool stopped");
    }
}
