//! Redis-backed worker core
//!
//! Pulls work items from Redis and runs them through a pluggable processor.
//!
//! ## Features
//!
//! - **Connection manager**: `RedisConnector` owns the session, reconnects with bounded backoff
//! - **Job sources**: reliable lists (`BLMOVE`), consumer-group streams, or in memory
//! - **Retries and dead letters**: transient failures are requeued, permanent ones dead-lettered
//! - **Graceful shutdown**: the in-flight item gets a grace period before it is requeued
//! - **Health reporting**: `HealthReporter::check` plus K8s-ready HTTP probes
//! - **Prometheus metrics**: built-in observability
//!
//! ## Example
//!
//! ```ignore
//! use queue_worker::{RedisDialer, RedisListSource, Worker, WorkerConfig};
//!
//! let config = WorkerConfig::from_env()?;
//! let dialer = RedisDialer::new(&RedisConfig::from_env()?)?;
//! let source = RedisListSource::new(&config.queue_name, &config.consumer_name, config.max_retries);
//!
//! let worker = Worker::new(dialer, source, MyProcessor, config);
//! let summary = worker.run(shutdown_rx).await?;
//! ```

mod backoff;
mod config;
mod connection;
mod error;
mod health;
mod job;
pub mod metrics;
mod processor;
mod source;
mod worker;

// Re-export main types
pub use backoff::{retry_with_backoff, Backoff, RecordingSleeper, RetryExhausted, Sleeper, TokioSleeper};
pub use config::{QueueKind, WorkerConfig};
pub use connection::{ConnectionState, Dial, RedisConnector, RedisDialer};
pub use error::{ConnectionError, ErrorCategory, FetchError, ProcessingError, WorkerError};
pub use health::{
    health_router, serve, Health, HealthReporter, HealthResponse, HealthState, HealthStatus, DEFAULT_PROBE_TIMEOUT,
};
pub use job::{content_id, AckToken, DeadLetter, WorkItem};
pub use metrics::{init_metrics, WorkerMetrics};
pub use processor::WorkProcessor;
pub use source::{
    InMemorySource, JobSource, RedisListSource, RedisStreamSource, RequeueOutcome, DEFAULT_CLAIM_IDLE,
};
pub use worker::{Worker, WorkerState, WorkerSummary};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::connection::Dial;
    use crate::error::ConnectionError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Dialer whose reachability is flipped by the test
    #[derive(Clone)]
    pub struct FakeDial {
        up: Arc<AtomicBool>,
        dials: Arc<AtomicU32>,
        heal_after: u32,
        latency: Duration,
    }

    impl FakeDial {
        fn with_up(up: bool) -> Self {
            Self {
                up: Arc::new(AtomicBool::new(up)),
                dials: Arc::new(AtomicU32::new(0)),
                heal_after: u32::MAX,
                latency: Duration::ZERO,
            }
        }

        pub fn reachable() -> Self {
            Self::with_up(true)
        }

        pub fn unreachable() -> Self {
            Self::with_up(false)
        }

        /// Become reachable once `failures` dials have failed
        pub fn up_after(mut self, failures: u32) -> Self {
            self.heal_after = failures;
            self
        }

        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub fn set_up(&self, up: bool) {
            self.up.store(up, Ordering::SeqCst);
        }

        pub fn dials(&self) -> u32 {
            self.dials.load(Ordering::SeqCst)
        }

        fn check(&self) -> Result<(), ConnectionError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ConnectionError::Unavailable("connection refused".to_string()))
            }
        }
    }

    #[async_trait]
    impl Dial for FakeDial {
        type Session = ();

        async fn dial(&self) -> Result<(), ConnectionError> {
            let attempt = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.heal_after {
                self.set_up(true);
            }
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.check()
        }

        async fn ping(&self, _session: &mut ()) -> Result<(), ConnectionError> {
            self.check()
        }

        fn endpoint(&self) -> String {
            "redis://fake:6379/0".to_string()
        }
    }

    /// Poll `condition` until it holds, panicking after a few seconds
    pub async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }
}
