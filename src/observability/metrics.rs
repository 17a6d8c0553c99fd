use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub claims_total: IntCounterVec,
    pub status_updates_total: IntCounterVec,
    pub list_refreshes_total: IntCounterVec,
    pub settle_retries_total: IntCounter,
    pub chat_sessions_open: IntGauge,
    pub chat_frames_dropped_total: IntCounter,
    pub mutation_latency_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let claims_total = IntCounterVec::new(
            Opts::new("claims_total", "Claim attempts by outcome"),
            &["outcome"],
        )
        .expect("valid claims_total metric");

        let status_updates_total = IntCounterVec::new(
            Opts::new("status_updates_total", "Order status updates by outcome"),
            &["outcome"],
        )
        .expect("valid status_updates_total metric");

        let list_refreshes_total = IntCounterVec::new(
            Opts::new("list_refreshes_total", "Order list fetches by view and outcome"),
            &["view", "outcome"],
        )
        .expect("valid list_refreshes_total metric");

        let settle_retries_total = IntCounter::new(
            "settle_retries_total",
            "Extra my-orders fetches after an empty post-claim result",
        )
        .expect("valid settle_retries_total metric");

        let chat_sessions_open =
            IntGauge::new("chat_sessions_open", "Chat sessions currently open")
                .expect("valid chat_sessions_open metric");

        let chat_frames_dropped_total = IntCounter::new(
            "chat_frames_dropped_total",
            "Incoming chat frames dropped as malformed or foreign",
        )
        .expect("valid chat_frames_dropped_total metric");

        let mutation_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mutation_latency_seconds",
                "Latency of claim and status update flows in seconds",
            ),
            &["operation"],
        )
        .expect("valid mutation_latency_seconds metric");

        registry
            .register(Box::new(claims_total.clone()))
            .expect("register claims_total");
        registry
            .register(Box::new(status_updates_total.clone()))
            .expect("register status_updates_total");
        registry
            .register(Box::new(list_refreshes_total.clone()))
            .expect("register list_refreshes_total");
        registry
            .register(Box::new(settle_retries_total.clone()))
            .expect("register settle_retries_total");
        registry
            .register(Box::new(chat_sessions_open.clone()))
            .expect("register chat_sessions_open");
        registry
            .register(Box::new(chat_frames_dropped_total.clone()))
            .expect("register chat_frames_dropped_total");
        registry
            .register(Box::new(mutation_latency_seconds.clone()))
            .expect("register mutation_latency_seconds");

        Self {
            registry,
            claims_total,
            status_updates_total,
            list_refreshes_total,
            settle_retries_total,
            chat_sessions_open,
            chat_frames_dropped_total,
            mutation_latency_seconds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
