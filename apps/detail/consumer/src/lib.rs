//! Detail Consumer Service
//!
//! Takes listing messages off a Redis queue, enriches each one through the
//! detail view API and archives the result in S3.
//!
//! ## Architecture
//!
//! ```text
//! Redis list / stream (QUEUE_NAME)
//!   ↓ (reliable fetch, ack after store)
//! Worker<RedisDialer, JobSource, DetailProcessor>
//!   ↓ POST {"url": link}
//! Detail view API
//!   ↓ message + detail
//! S3 bucket: YYYY-MM-DD/YYYYMMDD_HHMMSS_ffffff.json
//! ```
//!
//! ## Features
//!
//! - Several instances can share one queue
//! - Transient failures are retried, bad messages dead-lettered
//! - Reconnects to Redis with bounded backoff, exits non-zero when it stays down
//! - Graceful shutdown on SIGINT / SIGTERM
//! - Health, readiness and metrics endpoints for Kubernetes probes

pub mod config;
pub mod detail_api;
pub mod processor;
pub mod storage;

use crate::config::AppConfig;
use crate::detail_api::HttpDetailApi;
use crate::processor::DetailProcessor;
use crate::storage::S3Sink;
use core_config::redis::RedisConfig;
use core_config::server::HealthServerConfig;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use queue_worker::{
    health_router, init_metrics, serve, ConnectionError, Dial, HealthReporter, HealthState, JobSource,
    QueueKind, RedisDialer, RedisListSource, RedisStreamSource, Worker, WorkerConfig, WorkerSummary,
    DEFAULT_PROBE_TIMEOUT,
};
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

type Processor = DetailProcessor<HttpDetailApi, S3Sink>;

/// Run the detail consumer
///
/// This is the main entry point for the service. It:
/// 1. Loads `.env` if present and sets up structured logging
/// 2. Loads Redis, worker, health server and application configuration
/// 3. Starts the health server
/// 4. Runs the worker until SIGINT / SIGTERM
///
/// # Errors
///
/// Returns an error if:
/// - Any configuration is missing or invalid
/// - Redis cannot be reached within the reconnect budget
pub async fn run() -> Result<()> {
    dotenv::dotenv().ok();

    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    core_config::tracing::install_color_eyre();

    init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name, version, environment = ?environment, "Starting detail consumer");

    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    let worker_config = WorkerConfig::from_env().wrap_err("Failed to load worker configuration")?;
    let server_config = HealthServerConfig::from_env().wrap_err("Failed to load health server configuration")?;
    let app_config = AppConfig::from_env().wrap_err("Failed to load application configuration")?;

    info!(
        redis = %redis_config.redacted_url(),
        queue = %worker_config.queue_name,
        kind = %worker_config.queue_kind,
        consumer = %worker_config.consumer_name,
        detail_api = %app_config.detail_api.url,
        bucket = %app_config.s3.bucket,
        "Configuration loaded"
    );

    let dialer = RedisDialer::new(&redis_config)
        .wrap_err("Invalid Redis configuration")?
        .with_response_timeout(worker_config.fetch_timeout + Duration::from_secs(10));
    let api = HttpDetailApi::new(app_config.detail_api.clone()).wrap_err("Failed to build detail API client")?;
    let processor = DetailProcessor::new(api, S3Sink::from_config(&app_config.s3));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let summary = match worker_config.queue_kind {
        QueueKind::List => {
            let source = RedisListSource::new(
                &worker_config.queue_name,
                &worker_config.consumer_name,
                worker_config.max_retries,
            )
            .with_claim_idle(worker_config.claim_idle);
            run_worker(dialer, source, processor, worker_config, &server_config, shutdown_rx).await?
        }
        QueueKind::Stream => {
            let source = RedisStreamSource::new(
                &worker_config.queue_name,
                &worker_config.consumer_group,
                &worker_config.consumer_name,
                worker_config.max_retries,
            )
            .with_claim_idle(worker_config.claim_idle);
            run_worker(dialer, source, processor, worker_config, &server_config, shutdown_rx).await?
        }
    };

    info!(
        processed = summary.processed,
        retried = summary.retried,
        dead_lettered = summary.dead_lettered,
        released = summary.released,
        unsettled = summary.unsettled,
        "Detail consumer stopped"
    );
    Ok(())
}

/// Start the health server next to `source`'s worker and run the worker to completion
async fn run_worker<S>(
    dialer: RedisDialer,
    source: S,
    processor: Processor,
    config: WorkerConfig,
    server_config: &HealthServerConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<WorkerSummary>
where
    S: JobSource<<RedisDialer as Dial>::Session> + 'static,
{
    let probe_timeout = config.probe_timeout;
    let worker = Worker::new(dialer, source, processor, config);

    let reporter = HealthReporter::new(worker.dialer().clone(), worker.connection_state())
        .with_probe_timeout(probe_timeout);
    let health_state = HealthState::new(
        reporter,
        worker.subscribe(),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );

    let router = health_router(health_state);
    let server_config = server_config.clone();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &server_config, server_shutdown).await {
            error!(error = %e, "Health server failed");
        }
    });

    worker.run(shutdown).await.wrap_err("Worker stopped on a fatal error")
}

/// Reporter for the one-shot `healthcheck` binary.
///
/// Dial, PING and the whole probe share one short bound so an unresponsive
/// Redis fails the container check quickly instead of hanging it.
pub fn healthcheck_reporter(config: &RedisConfig) -> Result<HealthReporter<RedisDialer>, ConnectionError> {
    let dialer = RedisDialer::new(config)?
        .with_timeout(DEFAULT_PROBE_TIMEOUT)
        .with_response_timeout(DEFAULT_PROBE_TIMEOUT);

    Ok(HealthReporter::standalone(dialer).with_probe_timeout(DEFAULT_PROBE_TIMEOUT))
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
