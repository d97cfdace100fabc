use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// Core OTel metrics for the broker and admission path. Created once when the
/// broker is built and used to record counters/gauges on each operation.
pub struct Metrics {
    pub messages_enqueued: Counter<u64>,
    pub messages_leased: Counter<u64>,
    pub messages_acked: Counter<u64>,
    pub messages_nacked: Counter<u64>,
    pub messages_reclaimed: Counter<u64>,
    pub heartbeats: Counter<u64>,
    pub admission_rejected: Counter<u64>,
    pub queue_depth: Gauge<u64>,
    pub leases_active: Gauge<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create metrics from the global meter provider. If no meter provider
    /// is configured (OTel disabled), the instruments are no-op.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("runq");
        Self::from_meter(&meter)
    }

    /// Bind the instruments to `meter`.
    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            messages_enqueued: meter
                .u64_counter("runq.messages.enqueued")
                .with_description("Messages added to a queue")
                .build(),
            messages_leased: meter
                .u64_counter("runq.messages.leased")
                .with_description("Messages leased to workers")
                .build(),
            messages_acked: meter
                .u64_counter("runq.messages.acked")
                .with_description("Leased messages completed by a worker")
                .build(),
            messages_nacked: meter
                .u64_counter("runq.messages.nacked")
                .with_description("Leased messages returned to their queue by a worker")
                .build(),
            messages_reclaimed: meter
                .u64_counter("runq.messages.reclaimed")
                .with_description("Expired leases returned to their queue by the sweeper")
                .build(),
            heartbeats: meter
                .u64_counter("runq.leases.heartbeats")
                .with_description("Lease extensions accepted")
                .build(),
            admission_rejected: meter
                .u64_counter("runq.admission.rejected")
                .with_description("Triggers rejected at admission, by reason")
                .build(),
            queue_depth: meter
                .u64_gauge("runq.queue.depth")
                .with_description("Pending messages in a queue")
                .build(),
            leases_active: meter
                .u64_gauge("runq.leases.active")
                .with_description("Messages currently leased from a queue")
                .build(),
        }
    }

    pub fn record_enqueue(&self, queue: &str) {
        self.messages_enqueued
            .add(1, &[KeyValue::new("queue", queue.to_string())]);
    }

    pub fn record_lease(&self, queue: &str) {
        self.messages_leased
            .add(1, &[KeyValue::new("queue", queue.to_string())]);
    }

    pub fn record_ack(&self, queue: &str) {
        self.messages_acked
            .add(1, &[KeyValue::new("queue", queue.to_string())]);
    }

    pub fn record_nack(&self, queue: &str) {
        self.messages_nacked
            .add(1, &[KeyValue::new("queue", queue.to_string())]);
    }

    pub fn record_reclaim(&self, queue: &str) {
        self.messages_reclaimed
            .add(1, &[KeyValue::new("queue", queue.to_string())]);
    }

    pub fn record_heartbeat(&self, queue: &str) {
        self.heartbeats
            .add(1, &[KeyValue::new("queue", queue.to_string())]);
    }

    pub fn record_admission_rejected(&self, reason: &'static str) {
        self.admission_rejected
            .add(1, &[KeyValue::new("reason", reason)]);
    }

    pub fn set_queue_depth(&self, queue: &str, depth: u64) {
        self.queue_depth
            .record(depth, &[KeyValue::new("queue", queue.to_string())]);
    }

    pub fn set_leases_active(&self, queue: &str, count: u64) {
        self.leases_active
            .record(count, &[KeyValue::new("queue", queue.to_string())]);
    }
}
