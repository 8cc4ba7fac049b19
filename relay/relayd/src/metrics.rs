use prometheus::Encoder;
use relay_core::CommandQueue;

/// Prometheus instruments exported on `/metrics`.
#[derive(Clone)]
pub struct RelayMetrics {
    registry: prometheus::Registry,
    requests_total: prometheus::IntCounterVec,
    auth_failures_total: prometheus::IntCounterVec,
    enqueued_total: prometheus::IntCounter,
    request_latency_ms: prometheus::HistogramVec,
    pending_gauge: prometheus::IntGauge,
    storage_usage_bytes: prometheus::IntGauge,
}

/// Outcome label attached to request counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Request served.
    Ok,
    /// Rejected for authentication.
    Unauthorized,
    /// Rejected as malformed.
    Invalid,
    /// Internal failure.
    Error,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Unauthorized => "unauthorized",
            Outcome::Invalid => "invalid",
            Outcome::Error => "error",
        }
    }
}

impl RelayMetrics {
    /// Create and register all instruments.
    pub fn new(webhook_configured: bool) -> anyhow::Result<Self> {
        let registry = prometheus::Registry::new();
        let requests_total = prometheus::IntCounterVec::new(
            prometheus::Opts::new("relay_requests_total", "Requests by operation and outcome"),
            &["op", "outcome"],
        )?;
        let auth_failures_total = prometheus::IntCounterVec::new(
            prometheus::Opts::new(
                "relay_auth_failures_total",
                "Signature rejections by operation",
            ),
            &["op"],
        )?;
        let enqueued_total = prometheus::IntCounter::new(
            "relay_commands_enqueued_total",
            "Commands appended to the queue",
        )?;
        let request_latency_ms = prometheus::HistogramVec::new(
            prometheus::HistogramOpts::new(
                "relay_request_latency_ms",
                "Request latency in milliseconds",
            ),
            &["op"],
        )?;
        let pending_gauge =
            prometheus::IntGauge::new("relay_pending_commands", "Commands awaiting a result")?;
        let storage_usage_bytes = prometheus::IntGauge::new(
            "relay_storage_usage_bytes",
            "Estimated disk usage of the command queue",
        )?;
        let webhook_status = prometheus::IntGauge::new(
            "relay_webhook_configured",
            "Whether webhook ingestion is configured (1) or not (0)",
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(auth_failures_total.clone()))?;
        registry.register(Box::new(enqueued_total.clone()))?;
        registry.register(Box::new(request_latency_ms.clone()))?;
        registry.register(Box::new(pending_gauge.clone()))?;
        registry.register(Box::new(storage_usage_bytes.clone()))?;
        registry.register(Box::new(webhook_status.clone()))?;
        webhook_status.set(webhook_configured as i64);

        Ok(Self {
            registry,
            requests_total,
            auth_failures_total,
            enqueued_total,
            request_latency_ms,
            pending_gauge,
            storage_usage_bytes,
        })
    }

    /// Record one finished request.
    pub fn observe(&self, op: &str, outcome: Outcome, latency_ms: f64) {
        self.requests_total
            .with_label_values(&[op, outcome.as_str()])
            .inc();
        self.request_latency_ms
            .with_label_values(&[op])
            .observe(latency_ms);
        if outcome == Outcome::Unauthorized {
            self.auth_failures_total.with_label_values(&[op]).inc();
        }
    }

    /// Count a newly enqueued command.
    pub fn command_enqueued(&self) {
        self.enqueued_total.inc();
    }

    /// Refresh queue gauges.
    pub fn refresh_queue(&self, queue: &dyn CommandQueue) {
        self.pending_gauge.set(queue.pending_count() as i64);
        if let Some(usage) = queue.storage_usage_bytes() {
            self.storage_usage_bytes.set(usage as i64);
        }
    }

    /// Current pending gauge value.
    pub fn pending(&self) -> i64 {
        self.pending_gauge.get()
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
