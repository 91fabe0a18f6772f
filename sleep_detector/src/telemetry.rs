use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

pub struct Metrics {
    detection_counter: Counter<u64>,
    rejection_counter: Counter<u64>,
    detection_duration: Histogram<u64>,
    // Dropping the last provider handle shuts its readers down.
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("sleep_detector");
        global::set_meter_provider(provider.clone());

        let detection_counter = meter
            .u64_counter("detections_total")
            .with_description("Detections answered, by resulting status")
            .build();

        let rejection_counter = meter
            .u64_counter("rejected_requests_total")
            .with_description("Detect requests rejected before reaching the model")
            .build();

        // Vision model round trips sit between a few hundred ms and tens of seconds.
        let detection_duration = meter
            .u64_histogram("detection_duration_ms")
            .with_boundaries(generate_boundaries(100, 2, 10))
            .with_description("Duration of detections in milliseconds")
            .build();

        Ok(Metrics {
            detection_counter,
            rejection_counter,
            detection_duration,
            _provider: provider,
            registry,
        })
    }

    pub fn record_detection(&self, status: &str, duration_ms: u64) {
        let attributes = [KeyValue::new("status", status.to_string())];
        self.detection_counter.add(1, &attributes);
        self.detection_duration.record(duration_ms, &attributes);
    }

    pub fn record_rejection(&self, reason: &str) {
        let attributes = [KeyValue::new("reason", reason.to_string())];
        self.rejection_counter.add(1, &attributes);
    }
}

/// `count` bucket bounds starting at `start`, each `factor` times the last.
fn generate_boundaries(start: u64, factor: u64, count: usize) -> Vec<f64> {
    std::iter::successors(Some(start), |&bound| bound.checked_mul(factor))
        .take(count)
        .map(|bound| bound as f64)
        .collect()
}
