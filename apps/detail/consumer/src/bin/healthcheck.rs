//! One-shot liveness probe for container health checks.
//!
//! Pings the configured Redis once and exits 0 when it answers, 1 otherwise.

use core_config::redis::RedisConfig;
use core_config::{Environment, FromEnv};
use detail_consumer::healthcheck_reporter;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    core_config::tracing::init_tracing(&Environment::from_env());

    let config = match RedisConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid Redis configuration");
            return ExitCode::FAILURE;
        }
    };

    let reporter = match healthcheck_reporter(&config) {
        Ok(reporter) => reporter,
        Err(e) => {
            error!(error = %e, redis = %config.redacted_url(), "Invalid Redis configuration");
            return ExitCode::FAILURE;
        }
    };

    let status = reporter.check().await;

    if status.is_healthy() {
        info!(latency_ms = ?status.latency_ms, "Redis healthy");
        ExitCode::SUCCESS
    } else {
        error!(error = ?status.last_error, redis = %config.redacted_url(), "Redis unhealthy");
        ExitCode::FAILURE
    }
}
