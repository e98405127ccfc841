use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec, TextEncoder,
};

/// Process-global instruments, created once and never replaced. Labels use
/// the mux route pattern rather than the raw path to bound cardinality.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "akashi_http_requests_total",
        "Total HTTP requests handled",
        &["method", "route", "status"]
    )
    .expect("register http request counter")
});

pub static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "akashi_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "route", "status"]
    )
    .expect("register http duration histogram")
});

pub fn observe_request(method: &str, route: &str, status: u16, elapsed_secs: f64) {
    let status = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, route, &status])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, route, &status])
        .observe(elapsed_secs);
}

/// Render the default registry in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}
