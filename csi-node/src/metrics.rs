//! Prometheus metrics for the node agent
//!
//! Counts and times node operations and admission gate rejections.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: node operations by type and status
    pub const OPERATIONS_TOTAL: &str = "csi_node_operations_total";
    /// Histogram: duration of node operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "csi_node_operation_duration_seconds";
    /// Counter: publish requests turned away by the admission gate
    pub const ADMISSION_REJECTED_TOTAL: &str = "csi_node_admission_rejected_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a node operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a publish rejected because the node was busy
pub fn record_admission_rejected() {
    counter!(names::ADMISSION_REJECTED_TOTAL).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, status: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, status, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_timer() {
        // No recorder is installed, so these are no-ops that must not panic
        let timer = OperationTimer::new("NodePublishVolume");
        std::thread::sleep(std::time::Duration::from_millis(5));
        timer.success();

        OperationTimer::new("NodeUnpublishVolume").failure("internal");
        record_admission_rejected();
    }
}
