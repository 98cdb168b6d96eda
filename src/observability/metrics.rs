use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub assignments_total: IntCounterVec,
    pub assignment_latency_seconds: HistogramVec,
    pub reservation_conflicts_total: IntCounter,
    pub dispatch_queue_depth: IntGauge,
    pub order_transitions_total: IntCounterVec,
    pub tracking_entries_total: IntCounterVec,
    pub orphaned_reservations_released_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let assignments_total = IntCounterVec::new(
            Opts::new("assignments_total", "Assignment attempts by outcome"),
            &["outcome"],
        )
        .expect("valid assignments_total metric");

        let assignment_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "assignment_latency_seconds",
                "Latency of driver assignment in seconds",
            ),
            &["outcome"],
        )
        .expect("valid assignment_latency_seconds metric");

        let reservation_conflicts_total = IntCounter::new(
            "reservation_conflicts_total",
            "Driver reservations lost to a concurrent claim",
        )
        .expect("valid reservation_conflicts_total metric");

        let dispatch_queue_depth =
            IntGauge::new("dispatch_queue_depth", "Dispatch requests waiting in queue")
                .expect("valid dispatch_queue_depth metric");

        let order_transitions_total = IntCounterVec::new(
            Opts::new("order_transitions_total", "Committed order transitions by target status"),
            &["to"],
        )
        .expect("valid order_transitions_total metric");

        let tracking_entries_total = IntCounterVec::new(
            Opts::new("tracking_entries_total", "Tracking pings by outcome"),
            &["outcome"],
        )
        .expect("valid tracking_entries_total metric");

        let orphaned_reservations_released_total = IntCounter::new(
            "orphaned_reservations_released_total",
            "Busy drivers released by the reconciler",
        )
        .expect("valid orphaned_reservations_released_total metric");

        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register assignments_total");
        registry
            .register(Box::new(assignment_latency_seconds.clone()))
            .expect("register assignment_latency_seconds");
        registry
            .register(Box::new(reservation_conflicts_total.clone()))
            .expect("register reservation_conflicts_total");
        registry
            .register(Box::new(dispatch_queue_depth.clone()))
            .expect("register dispatch_queue_depth");
        registry
            .register(Box::new(order_transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(tracking_entries_total.clone()))
            .expect("register tracking_entries_total");
        registry
            .register(Box::new(orphaned_reservations_released_total.clone()))
            .expect("register orphaned_reservations_released_total");

        Self {
            registry,
            assignments_total,
            assignment_latency_seconds,
            reservation_conflicts_total,
            dispatch_queue_depth,
            order_transitions_total,
            tracking_entries_total,
            orphaned_reservations_released_total,
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
