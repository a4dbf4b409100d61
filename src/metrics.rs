//! Prometheus metrics

use axum::{body::Body, http::Request, response::Response};
use lazy_static::lazy_static;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use tracing::Span;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Simple request counter
    pub static ref INCOMING_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("incoming_requests", "The number of HTTP requests received"),
        &["http_method"]
    ).unwrap();
    // Request counter by status code
    pub static ref RESPONSE_CODE_COLLECTOR: IntCounterVec = IntCounterVec::new(
        Opts::new("outgoing_response", "The number of responses sent."),
        &["status_code"]
    ).unwrap();
    // Request histogram by response time
    pub static ref RESPONSE_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("response_time", "The time taken to respond to each request"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(), // Change buckets here if desired
        },
        &[],
    ).unwrap();
    // Chunk attempts by outcome: succeeded, retried or failed
    pub static ref CHUNK_OUTCOMES: IntCounterVec = IntCounterVec::new(
        Opts::new("chunk_outcomes", "The number of chunk attempts by outcome"),
        &["outcome"]
    ).unwrap();
    // Parsed lines by validity
    pub static ref ROWS: IntCounterVec = IntCounterVec::new(
        Opts::new("rows", "The number of lines parsed by validity"),
        &["validity"]
    ).unwrap();
    pub static ref DUPLICATE_MERGES: IntCounter = IntCounter::new(
        "duplicate_merges",
        "The number of partial aggregates skipped because they were already merged"
    ).unwrap();
    pub static ref MERGE_RETRIES: IntCounter = IntCounter::new(
        "merge_retries",
        "The number of aggregate merges retried after losing a compare-and-swap"
    ).unwrap();
    // Cache writes by outcome: written, rejected or failed
    pub static ref CACHE_WRITES: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_writes", "The number of statistics cache writes by outcome"),
        &["outcome"]
    ).unwrap();
    // Tasks dead-lettered after exhausting their deliveries, by queue
    pub static ref DEAD_LETTERS: IntCounterVec = IntCounterVec::new(
        Opts::new("dead_letters", "The number of tasks dead-lettered"),
        &["queue"]
    ).unwrap();
    // Task deliveries by queue and result
    pub static ref TASKS: IntCounterVec = IntCounterVec::new(
        Opts::new("tasks", "The number of task deliveries by queue and result"),
        &["queue", "result"]
    ).unwrap();
    // Uploads reaching a terminal state, by status
    pub static ref UPLOADS_FINISHED: IntCounterVec = IntCounterVec::new(
        Opts::new("uploads_finished", "The number of uploads reaching a terminal state"),
        &["status"]
    ).unwrap();
}

/// Register the metrics with the registry.
///
/// Safe to call more than once; later calls are ignored.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(INCOMING_REQUESTS.clone()),
        Box::new(RESPONSE_CODE_COLLECTOR.clone()),
        Box::new(RESPONSE_TIME_COLLECTOR.clone()),
        Box::new(CHUNK_OUTCOMES.clone()),
        Box::new(ROWS.clone()),
        Box::new(DUPLICATE_MERGES.clone()),
        Box::new(MERGE_RETRIES.clone()),
        Box::new(CACHE_WRITES.clone()),
        Box::new(DEAD_LETTERS.clone()),
        Box::new(TASKS.clone()),
        Box::new(UPLOADS_FINISHED.clone()),
    ];
    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(err) => tracing::error!("Failed to register metric: {}", err),
        }
    }
}

pub async fn metrics_handler() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", err);
    }

    String::from_utf8_lossy(&buffer).into_owned()
}

/// Increments the prometheus counter on all incoming requests, labelled by http method
pub fn request_counter(request: &Request<Body>, _span: &Span) {
    INCOMING_REQUESTS
        .with_label_values(&[&request.method().to_string().to_ascii_uppercase()])
        .inc();
}

/// Increment the prometheus counter on all outgoing responses, labelled by status code
pub fn record_response_metrics<B>(
    response: &Response<B>,
    latency: std::time::Duration,
    _span: &Span,
) {
    RESPONSE_CODE_COLLECTOR
        .with_label_values(&[response.status().as_str()])
        .inc();

    RESPONSE_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}
