use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub sink_messages_total: IntCounterVec,
    pub replay_rows_skipped_total: IntCounter,

    // Histograms
    pub sink_insert_duration_seconds: Histogram,

    // Dependency gauges
    pub dep_up: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sink_messages_total = IntCounterVec::new(
            Opts::new("sink_messages_total", "Messages settled by sink workers"),
            &["outcome"], // stored|requeued|dead_lettered|dropped
        )?;

        let replay_rows_skipped_total = IntCounter::new(
            "replay_rows_skipped_total",
            "Stored rows skipped during reconstruction because their payload was unusable",
        )?;

        let sink_insert_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "sink_insert_duration_seconds",
            "Event store insert duration seconds",
        ))?;

        let dep_up = IntGaugeVec::new(
            Opts::new("sink_dependency_up", "Dependency up gauge"),
            &["dep"], // nats|store
        )?;

        registry.register(Box::new(sink_messages_total.clone()))?;
        registry.register(Box::new(replay_rows_skipped_total.clone()))?;
        registry.register(Box::new(sink_insert_duration_seconds.clone()))?;
        registry.register(Box::new(dep_up.clone()))?;

        Ok(Self {
            registry,
            sink_messages_total,
            replay_rows_skipped_total,
            sink_insert_duration_seconds,
            dep_up,
        })
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&mf, &mut buf)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }

    pub fn set_dependency(&self, dep: &str, up: bool) {
        self.dep_up.with_label_values(&[dep]).set(i64::from(up));
    }
}
