//! Prometheus instrumentation.
//!
//! Every RPC is timed through [`OperationTimer`]; the probe supervisor feeds
//! the connection gauge and the probe counter.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter, labelled by `operation` and `status`
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram of RPC latency, labelled by `operation`
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Gauge: 1 while a backend connection is cached, 0 otherwise
    pub const CSI_BACKEND_CONNECTED: &str = "csi_backend_connected";
    /// Counter, labelled by `success`
    pub const CSI_BACKEND_PROBE_ATTEMPTS: &str = "csi_backend_probe_attempts";
}

/// Install the global recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!(addr = %addr, "Serving Prometheus metrics on /metrics");
    Ok(())
}

/// `status` is `success` or a [`crate::CsiError`] kind name.
pub fn record_operation(operation: &'static str, status: &'static str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation, "status" => status)
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation)
        .record(duration_secs);
}

pub fn set_backend_connected(connected: bool) {
    gauge!(names::CSI_BACKEND_CONNECTED).set(if connected { 1.0 } else { 0.0 });
}

pub fn record_probe_attempt(success: bool) {
    let label = if success { "true" } else { "false" };
    counter!(names::CSI_BACKEND_PROBE_ATTEMPTS, "success" => label).increment(1);
}

/// Wall-clock timer for one RPC.
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    fn record(self, status: &'static str) {
        record_operation(self.operation, status, self.start.elapsed().as_secs_f64());
    }

    pub fn success(self) {
        self.record("success");
    }

    pub fn failure(self, code: &'static str) {
        self.record(code);
    }

    /// Record the outcome of a finished operation and hand the result back.
    pub fn finish<T>(self, result: crate::error::Result<T>) -> crate::error::Result<T> {
        match &result {
            Ok(_) => self.success(),
            Err(e) => self.failure(e.code_name()),
        }
        result
    }
}
