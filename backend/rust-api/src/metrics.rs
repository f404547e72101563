use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter_vec, CounterVec, Encoder,
    HistogramVec, IntCounterVec, TextEncoder,
};

use crate::error::FileUploadError;

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Grant store metrics (Redis)
    pub static ref CACHE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_operations_total",
        "Total number of cache operations",
        &["operation", "status"]
    )
    .unwrap();

    pub static ref CACHE_HIT_RATIO: CounterVec = register_counter_vec!(
        "cache_hit_ratio",
        "Cache hit/miss ratio",
        &["result"]
    )
    .unwrap();

    pub static ref CACHE_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "cache_operation_duration_seconds",
        "Cache operation duration in seconds",
        &["operation"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1]
    )
    .unwrap();

    // Blob store metrics
    pub static ref BLOB_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "blob_operations_total",
        "Total number of blob store operations",
        &["operation", "status"]
    )
    .unwrap();

    pub static ref BLOB_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "blob_operation_duration_seconds",
        "Blob store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    // Business Metrics
    pub static ref FILE_GRANTS_ISSUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "file_grants_issued_total",
        "Total number of upload/download grants issued",
        &["direction"]
    )
    .unwrap();

    pub static ref FILE_ACCESS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "file_access_total",
        "File access attempts against issued grants",
        &["direction", "outcome"]
    )
    .unwrap();

    pub static ref LEDGER_RECORDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_records_total",
        "Total number of ledger rows appended",
        &["kind"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track cache operation with metrics
pub async fn track_cache_operation<F, T>(operation: &str, future: F) -> Result<T, anyhow::Error>
where
    F: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = if result.is_ok() { "success" } else { "error" };

    CACHE_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();

    CACHE_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(duration);

    result
}

/// Helper: track blob store operation with metrics. A `NotFound` read is an
/// expected outcome, not an error.
pub async fn track_blob_operation<F, T>(operation: &str, future: F) -> Result<T, FileUploadError>
where
    F: std::future::Future<Output = Result<T, FileUploadError>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = match &result {
        Ok(_) => "success",
        Err(FileUploadError::NotFound { .. }) => "not_found",
        Err(_) => "error",
    };

    BLOB_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();

    BLOB_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(duration);

    result
}

/// Record cache hit
pub fn record_cache_hit() {
    CACHE_HIT_RATIO.with_label_values(&["hit"]).inc();
}

/// Record cache miss
pub fn record_cache_miss() {
    CACHE_HIT_RATIO.with_label_values(&["miss"]).inc();
}

pub fn record_file_access(direction: &str, outcome: &str) {
    FILE_ACCESS_TOTAL
        .with_label_values(&[direction, outcome])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_metrics() {
        FILE_GRANTS_ISSUED_TOTAL.with_label_values(&["upload"]).inc();

        let result = render_metrics();
        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.contains("file_grants_issued_total"));
    }

    #[tokio::test]
    async fn test_blob_not_found_counted_separately() {
        let before = BLOB_OPERATIONS_TOTAL
            .with_label_values(&["metrics_test", "not_found"])
            .get();

        let result: Result<(), FileUploadError> = track_blob_operation("metrics_test", async {
            Err(FileUploadError::NotFound { key: "k".into() })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(
            BLOB_OPERATIONS_TOTAL
                .with_label_values(&["metrics_test", "not_found"])
                .get(),
            before + 1
        );
    }
}
