use crate::errors::Result;
use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SAMPLES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "aggregator_samples_total",
        "Total samples ingested from gateways"
    ))
    .expect("valid metric opts");
    pub static ref ALERTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "aggregator_alerts_total",
        "Total alerts derived from ingested samples"
    ))
    .expect("valid metric opts");
    pub static ref UNAUTHORIZED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "aggregator_unauthorized_total",
        "Total gateway calls rejected for a bad secret"
    ))
    .expect("valid metric opts");
    pub static ref REGISTRATIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "aggregator_registrations_total",
        "Total gateway registrations"
    ))
    .expect("valid metric opts");
    pub static ref SUBSCRIBERS: Gauge = Gauge::with_opts(Opts::new(
        "aggregator_subscribers",
        "Currently connected stream subscribers"
    ))
    .expect("valid metric opts");
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "aggregator_ingest_latency_seconds",
            "Time taken to apply one sample to the store"
        )
        .buckets(vec![
            0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05
        ])
    )
    .expect("valid metric opts");
}

pub fn init_metrics() -> Result<()> {
    REGISTRY.register(Box::new(SAMPLES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ALERTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UNAUTHORIZED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REGISTRATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SUBSCRIBERS.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
