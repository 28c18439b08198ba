//! Liveness reporting.
//!
//! [`HealthReporter::check`] is the single source of truth. The HTTP router
//! and the `healthcheck` binary only schedule it:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Prometheus metrics (`/metrics`)

use crate::connection::{ConnectionState, Dial};
use crate::metrics;
use crate::worker::WorkerState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use core_config::server::HealthServerConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
}

/// Result of one health check. Computed fresh every time, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: Health,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Probe round trip, when a probe was issued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl HealthStatus {
    fn healthy(latency: Duration) -> Self {
        Self {
            status: Health::Healthy,
            checked_at: Utc::now(),
            last_error: None,
            latency_ms: Some(latency.as_millis() as u64),
        }
    }

    fn unhealthy(error: impl Into<String>, latency: Option<Duration>) -> Self {
        Self {
            status: Health::Unhealthy,
            checked_at: Utc::now(),
            last_error: Some(error.into()),
            latency_ms: latency.map(|l| l.as_millis() as u64),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == Health::Healthy
    }
}

/// Upper bound on one readiness probe round trip
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Answers "can this process reach Redis right now?"
///
/// Probes on its own short-lived session and never touches the worker's.
pub struct HealthReporter<D> {
    dialer: D,
    connection: Option<watch::Receiver<ConnectionState>>,
    probe_timeout: Duration,
}

impl<D: Dial> HealthReporter<D> {
    /// Reporter attached to a running worker's connection state
    pub fn new(dialer: D, connection: watch::Receiver<ConnectionState>) -> Self {
        Self {
            dialer,
            connection: Some(connection),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Reporter for an out-of-process probe, with no worker to observe
    pub fn standalone(dialer: D) -> Self {
        Self {
            dialer,
            connection: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub async fn check(&self) -> HealthStatus {
        if let Some(connection) = &self.connection {
            let state = *connection.borrow();
            if state != ConnectionState::Connected {
                debug!(state = %state, "Worker connection not up, skipping probe");
                return HealthStatus::unhealthy(format!("redis connection {state}"), None);
            }
        }

        // Dialing includes the PING round trip
        let started = Instant::now();
        match tokio::time::timeout(self.probe_timeout, self.dialer.dial()).await {
            Ok(Ok(_session)) => HealthStatus::healthy(started.elapsed()),
            Ok(Err(e)) => HealthStatus::unhealthy(e.to_string(), Some(started.elapsed())),
            Err(_) => HealthStatus::unhealthy(
                format!("probe timed out after {:?}", self.probe_timeout),
                Some(started.elapsed()),
            ),
        }
    }
}

/// Shared state for health endpoints.
pub struct HealthState<D> {
    reporter: Arc<HealthReporter<D>>,
    worker: watch::Receiver<WorkerState>,
    app_name: String,
    app_version: String,
}

impl<D> Clone for HealthState<D> {
    fn clone(&self) -> Self {
        Self {
            reporter: Arc::clone(&self.reporter),
            worker: self.worker.clone(),
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
        }
    }
}

impl<D: Dial> HealthState<D> {
    pub fn new(
        reporter: HealthReporter<D>,
        worker: watch::Receiver<WorkerState>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            reporter: Arc::new(reporter),
            worker,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Body of every probe response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub name: String,
    pub version: String,
    pub worker: WorkerState,
    #[serde(flatten)]
    pub health: HealthStatus,
}

/// Probe and metrics routes
pub fn health_router<D: Dial + 'static>(state: HealthState<D>) -> Router {
    Router::new()
        .route("/health", get(health_handler::<D>))
        .route("/healthz", get(health_handler::<D>))
        .route("/ready", get(ready_handler::<D>))
        .route("/readyz", get(ready_handler::<D>))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve `router` until `shutdown` turns `true`.
pub async fn serve(
    router: Router,
    config: &HealthServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = config.address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Starting health server");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

/// Liveness: Redis is reachable.
async fn health_handler<D: Dial + 'static>(State(state): State<HealthState<D>>) -> impl IntoResponse {
    let health = state.reporter.check().await;
    let code = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(state.response(health)))
}

/// Readiness: Redis is reachable and the loop is running.
async fn ready_handler<D: Dial + 'static>(State(state): State<HealthState<D>>) -> impl IntoResponse {
    let health = state.reporter.check().await;
    let running = *state.worker.borrow() == WorkerState::Running;
    let code = if running && health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(state.response(health)))
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

impl<D> HealthState<D> {
    fn response(&self, health: HealthStatus) -> HealthResponse {
        HealthResponse {
            name: self.app_name.clone(),
            version: self.app_version.clone(),
            worker: *self.worker.borrow(),
            health,
        }
    }
}
