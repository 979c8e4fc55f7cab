//! Observability metrics for queries and transfers
//!
//! Counters and histograms are recorded through the `metrics` facade and are
//! free when no recorder is installed. The CLI installs a Prometheus exporter
//! with [`init_metrics`] when `--metrics-addr` is given.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Global metrics initialization flag
static METRICS_INITIALIZED: Lazy<Mutex<bool>> = Lazy::new(|| Mutex::new(false));

/// Correlation ID generator for request tracing
static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize the Prometheus exporter and describe every metric.
///
/// Idempotent: later calls are no-ops.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.lock().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!("queries_total", Unit::Count, "Provider queries executed");
    describe_counter!(
        "query_results_total",
        Unit::Count,
        "Products returned by provider queries"
    );
    describe_counter!(
        "api_requests_total",
        Unit::Count,
        "Provider API requests by endpoint and status"
    );
    describe_counter!(
        "transfers_completed_total",
        Unit::Count,
        "Transfers that placed or kept a final file"
    );
    describe_counter!("transfers_failed_total", Unit::Count, "Transfers that failed");
    describe_counter!("transfer_bytes_total", Unit::Bytes, "Bytes streamed to disk");
    describe_counter!(
        "transfer_retries_total",
        Unit::Count,
        "Retries after transient transfer failures"
    );
    describe_counter!(
        "transfer_redirects_total",
        Unit::Count,
        "Redirect hops followed by transfers"
    );
    describe_histogram!(
        "transfer_duration_seconds",
        Unit::Seconds,
        "Wall-clock duration of transfers"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Duration of retry backoff in seconds"
    );

    *initialized = true;
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Generate a new correlation ID for request tracing
pub fn generate_correlation_id() -> String {
    let id = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("req-{id:08x}")
}

/// Record a provider query and the number of products it returned
pub fn record_query(provider: &str, operation: &str, results: usize) {
    counter!(
        "queries_total",
        "provider" => provider.to_string(),
        "operation" => operation.to_string(),
    )
    .increment(1);
    counter!("query_results_total", "provider" => provider.to_string()).increment(results as u64);
}

/// Record a provider API request outcome; `status` is `None` on network errors
pub fn record_api_request(provider: &str, endpoint: &str, status: Option<u16>) {
    let status = status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "network_error".to_string());
    counter!(
        "api_requests_total",
        "provider" => provider.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status,
    )
    .increment(1);
}

/// Record retry backoff duration
pub fn record_retry_backoff(label: &str, duration: Duration, attempt: u32) {
    counter!(
        "transfer_retries_total",
        "provider" => label.to_string(),
        "attempt" => attempt.to_string(),
    )
    .increment(1);

    histogram!("retry_backoff_duration_seconds").record(duration.as_secs_f64());

    debug!(
        attempt = attempt,
        backoff_ms = duration.as_millis(),
        "Retry backoff recorded"
    );
}

/// Record one followed redirect
pub fn record_redirect(label: &str) {
    counter!("transfer_redirects_total", "provider" => label.to_string()).increment(1);
}

/// Per-transfer metrics
pub struct TransferMetrics {
    label: String,
    target: String,
    correlation_id: String,
    start_time: Instant,
}

impl TransferMetrics {
    /// Start tracking a transfer
    pub fn start(label: impl Into<String>, target: impl Into<String>) -> Self {
        let label = label.into();
        let target = target.into();
        let correlation_id = generate_correlation_id();

        debug!(
            correlation_id = %correlation_id,
            provider = %label,
            target = %target,
            "Transfer started"
        );

        Self {
            label,
            target,
            correlation_id,
            start_time: Instant::now(),
        }
    }

    /// Correlation ID of this transfer
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Record streamed bytes
    pub fn record_bytes(&self, bytes: u64) {
        counter!("transfer_bytes_total", "provider" => self.label.clone()).increment(bytes);
    }

    /// Record a completed (or skipped) transfer
    pub fn record_success(&self, outcome: &str) {
        let duration = self.start_time.elapsed();

        counter!(
            "transfers_completed_total",
            "provider" => self.label.clone(),
            "outcome" => outcome.to_string(),
        )
        .increment(1);
        histogram!("transfer_duration_seconds", "provider" => self.label.clone())
            .record(duration.as_secs_f64());

        info!(
            correlation_id = %self.correlation_id,
            provider = %self.label,
            target = %self.target,
            outcome = outcome,
            duration_ms = duration.as_millis(),
            "Transfer completed"
        );
    }

    /// Record a failed transfer
    pub fn record_failure(&self, kind: &str, error: &str) {
        let duration = self.start_time.elapsed();

        counter!(
            "transfers_failed_total",
            "provider" => self.label.clone(),
            "kind" => kind.to_string(),
        )
        .increment(1);
        histogram!("transfer_duration_seconds", "provider" => self.label.clone())
            .record(duration.as_secs_f64());

        error!(
            correlation_id = %self.correlation_id,
            provider = %self.label,
            target = %self.target,
            error = %error,
            duration_ms = duration.as_millis(),
            "Transfer failed"
        );
    }
}

/// Check if metrics system is initialized
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.lock().await
}
