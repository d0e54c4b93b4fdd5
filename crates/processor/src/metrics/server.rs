//! HTTP endpoint for Prometheus scrapes and pipeline health
//!
//! `/metrics` renders the registry in the text exposition format. `/health`
//! reports the coordinator's latest stats snapshot when one is attached and
//! answers 503 once the coordinator has stopped.

use super::registry::MetricsRegistry;
use super::MetricsError;
use crate::coordinator::{CoordinatorState, CoordinatorStats};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Where the endpoint listens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsServerConfig {
    pub address: SocketAddr,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsServerConfig {
    /// Parse a `host:port` address such as `0.0.0.0:9090`
    pub fn parse(address: &str) -> Result<Self, MetricsError> {
        address
            .trim()
            .parse()
            .map(|address| Self { address })
            .map_err(|_| MetricsError::InvalidAddress(address.to_string()))
    }
}

/// Body of `/health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<CoordinatorState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark: Option<DateTime<Utc>>,
    pub open_windows: usize,
    pub pending_writes: usize,
}

impl HealthStatus {
    pub fn from_stats(stats: Option<&CoordinatorStats>, uptime: Duration) -> Self {
        let stopped = stats.is_some_and(|s| s.state == CoordinatorState::Stopped);
        Self {
            status: if stopped { "stopped" } else { "healthy" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
            state: stats.map(|s| s.state),
            watermark: stats.and_then(|s| s.watermark),
            open_windows: stats.map_or(0, |s| s.open_windows),
            pending_writes: stats.map_or(0, |s| s.pending_writes),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Clone)]
struct ServerState {
    registry: Arc<MetricsRegistry>,
    coordinator: Option<watch::Receiver<CoordinatorStats>>,
    started: Instant,
}

/// Serves `/metrics` and `/health`
pub struct MetricsServer {
    config: MetricsServerConfig,
    registry: Arc<MetricsRegistry>,
    coordinator: Option<watch::Receiver<CoordinatorStats>>,
}

impl MetricsServer {
    /// Server over the global registry
    pub fn new(config: MetricsServerConfig) -> Self {
        Self::with_registry(config, MetricsRegistry::global())
    }

    pub fn with_registry(config: MetricsServerConfig, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            config,
            registry,
            coordinator: None,
        }
    }

    /// Report this coordinator's snapshots on `/health`
    pub fn with_coordinator_status(mut self, status: watch::Receiver<CoordinatorStats>) -> Self {
        self.coordinator = Some(status);
        self
    }

    pub fn config(&self) -> &MetricsServerConfig {
        &self.config
    }

    fn router(self) -> Router {
        Router::new()
            .route("/metrics", get(render_metrics))
            .route("/health", get(render_health))
            .with_state(ServerState {
                registry: self.registry,
                coordinator: self.coordinator,
                started: Instant::now(),
            })
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), MetricsError> {
        let address = self.config.address;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| MetricsError::BindError {
                address: address.to_string(),
                source,
            })?;
        info!(%address, "metrics endpoint listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| MetricsError::Serve(e.to_string()))?;

        info!("metrics endpoint stopped");
        Ok(())
    }
}

async fn render_metrics(State(state): State<ServerState>) -> Response {
    match state.registry.encode() {
        Ok(body) => {
            debug!(bytes = body.len(), "metrics scraped");
            ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn render_health(State(state): State<ServerState>) -> (StatusCode, Json<HealthStatus>) {
    let snapshot = state.coordinator.as_ref().map(|rx| rx.borrow().clone());
    let health = HealthStatus::from_stats(snapshot.as_ref(), state.started.elapsed());
    let code = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let config = MetricsServerConfig::parse("127.0.0.1:9191").unwrap();
        assert_eq!(config.address.port(), 9191);
        assert_eq!(MetricsServerConfig::default().address.port(), 9090);

        assert!(MetricsServerConfig::parse("localhost").is_err());
        assert!(MetricsServerConfig::parse("127.0.0.1:http").is_err());
    }

    #[test]
    fn test_health_follows_coordinator_state() {
        let unattached = HealthStatus::from_stats(None, Duration::from_secs(42));
        assert!(unattached.is_healthy());
        assert_eq!(unattached.uptime_seconds, 42);
        assert_eq!(unattached.state, None);

        let mut stats = CoordinatorStats {
            state: CoordinatorState::Polling,
            open_windows: 3,
            ..Default::default()
        };
        let running = HealthStatus::from_stats(Some(&stats), Duration::ZERO);
        assert!(running.is_healthy());
        assert_eq!(running.open_windows, 3);

        stats.state = CoordinatorState::Stopped;
        let stopped = HealthStatus::from_stats(Some(&stats), Duration::ZERO);
        assert!(!stopped.is_healthy());
        assert_eq!(stopped.state, Some(CoordinatorState::Stopped));
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.register_pipeline().commit();
        let config = MetricsServerConfig::parse("127.0.0.1:0").unwrap();
        let server = MetricsServer::with_registry(config, registry);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.start(shutdown.clone()));
        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
