//! Prometheus metrics for the processing loop

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Handle for rendering, `None` before [`init_metrics`]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Worker metrics, labeled by queue and processor
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    queue: String,
    processor: String,
}

impl WorkerMetrics {
    pub fn new(queue: impl Into<String>, processor: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            processor: processor.into(),
        }
    }

    pub fn item_received(&self) {
        counter!(
            "queue_worker_items_received_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone()
        )
        .increment(1);
    }

    pub fn item_processed(&self, duration: Duration) {
        counter!(
            "queue_worker_items_processed_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "queue_worker_item_duration_seconds",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// `category` is `transient`, `permanent` or `abandoned`
    pub fn item_failed(&self, category: &'static str) {
        counter!(
            "queue_worker_items_processed_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone(),
            "status" => "failed"
        )
        .increment(1);

        counter!(
            "queue_worker_item_errors_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone(),
            "category" => category
        )
        .increment(1);
    }

    pub fn item_retried(&self) {
        counter!(
            "queue_worker_items_retried_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone()
        )
        .increment(1);
    }

    pub fn item_dead_lettered(&self) {
        counter!(
            "queue_worker_items_dead_lettered_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone()
        )
        .increment(1);
    }

    pub fn settle_failed(&self) {
        counter!(
            "queue_worker_settle_failures_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    pub fn items_recovered(&self, count: usize) {
        counter!(
            "queue_worker_items_recovered_total",
            "queue" => self.queue.clone()
        )
        .increment(count as u64);
    }

    pub fn fetch_failed(&self) {
        counter!(
            "queue_worker_fetch_errors_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// 1 while the Redis session is up, 0 otherwise
    pub fn connected(&self, up: bool) {
        gauge!(
            "queue_worker_redis_connected",
            "queue" => self.queue.clone()
        )
        .set(if up { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = WorkerMetrics::new("processing_queue", "detail");
        assert_eq!(metrics.queue, "processing_queue");
        assert_eq!(metrics.processor, "detail");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = WorkerMetrics::new("q", "p");
        metrics.item_received();
        metrics.item_failed("transient");
        metrics.connected(false);
    }
}
