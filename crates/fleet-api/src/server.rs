//! API server implementation.
//!
//! Provides health, ready, metrics and node endpoints, and owns the
//! background offline sweep when one is configured.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use fleet_control::{ControlPlane, SweepCancellation};
use fleet_core::audit::{AuditLog, TracingAuditLog};
use fleet_core::storage::{MemoryBackend, StorageBackend};
use fleet_core::Result;

use crate::config::Config;
use crate::directory::{ServerDirectory, StaticServerDirectory};

const READY_CHECK_KEY: &str = "__fleet/ready-check";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    pub(crate) plane: ControlPlane,
    pub(crate) directory: Arc<dyn ServerDirectory>,
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("plane", &self.plane)
            .field("directory", &self.directory)
            .field("storage", &"<StorageBackend>")
            .finish()
    }
}

impl AppState {
    /// Assembles the control plane for `config`.
    #[must_use]
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        audit_log: Arc<dyn AuditLog>,
        directory: Arc<dyn ServerDirectory>,
    ) -> Self {
        let plane = ControlPlane::new(
            Arc::clone(&storage),
            audit_log,
            &config.control_config(),
        );
        Self {
            config,
            plane,
            directory,
            storage,
        }
    }

    /// The control plane behind the handlers.
    #[must_use]
    pub fn plane(&self) -> &ControlPlane {
        &self.plane
    }
}

/// Shallow liveness check; never touches dependencies.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check: a `HEAD` on a missing key proves storage is reachable.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.storage.head(READY_CHECK_KEY).await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("storage check failed: {e}")),
            }),
        ),
    }
}

/// The fleet API server.
pub struct Server {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    audit_log: Arc<dyn AuditLog>,
    directory: Arc<dyn ServerDirectory>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("storage", &"<StorageBackend>")
            .field("audit_log", &"<AuditLog>")
            .field("directory", &self.directory)
            .finish()
    }
}

impl Server {
    /// Creates a server with in-memory storage and tracing audit output.
    #[must_use]
    pub fn new(config: Config) -> Self {
        ServerBuilder::new().config(config).build()
    }

    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn state(&self) -> Arc<AppState> {
        Arc::new(AppState::new(
            self.config.clone(),
            Arc::clone(&self.storage),
            Arc::clone(&self.audit_log),
            Arc::clone(&self.directory),
        ))
    }

    fn create_router(state: Arc<AppState>) -> Router {
        let metrics_layer = middleware::from_fn(crate::metrics::metrics_middleware);
        let context_layer = middleware::from_fn(crate::context::context_middleware);

        Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/metrics", get(crate::metrics::serve_metrics))
            .nest("/api/v1", crate::routes::api_v1_routes().layer(context_layer))
            // Metrics outermost for timing, then trace.
            .layer(TraceLayer::new_for_http())
            .layer(metrics_layer)
            .with_state(state)
    }

    /// Starts the server and blocks until shutdown (Ctrl-C).
    ///
    /// When a sweep interval is configured, the offline sweep runs in the
    /// background and is cancelled before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the server cannot
    /// bind to the port.
    pub async fn serve(&self) -> Result<()> {
        self.config.validate()?;
        crate::metrics::init_metrics();

        let state = self.state();
        let cancel = SweepCancellation::new();
        let sweeper = self.config.sweep_interval().map(|interval| {
            tracing::info!(
                interval_secs = interval.as_secs(),
                threshold_secs = self.config.offline_after_seconds,
                "Starting periodic offline sweep"
            );
            Arc::clone(state.plane.liveness()).spawn_periodic_sweep(
                interval,
                self.config.offline_after_seconds,
                cancel.clone(),
            )
        });

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = Self::create_router(state);

        tracing::info!(http_port = self.config.http_port, "Starting fleet API server");

        let listener =
            tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| fleet_core::Error::Internal {
                    message: format!("failed to bind to {addr}: {e}"),
                })?;

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| fleet_core::Error::Internal {
                message: format!("server error: {e}"),
            });

        cancel.cancel();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Periodic sweep task ended abnormally");
            }
        }

        served
    }

    /// Creates a router without binding a port, for integration tests.
    #[doc(hidden)]
    pub fn test_router(&self) -> Router {
        Self::create_router(self.state())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Builder for constructing a server.
pub struct ServerBuilder {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    audit_log: Arc<dyn AuditLog>,
    directory: Option<Arc<dyn ServerDirectory>>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("storage", &"<StorageBackend>")
            .field("audit_log", &"<AuditLog>")
            .field("directory", &self.directory)
            .finish()
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            storage: Arc::new(MemoryBackend::new()),
            audit_log: Arc::new(TracingAuditLog),
            directory: None,
        }
    }
}

impl ServerBuilder {
    /// Creates a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the HTTP port.
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Enables debug mode (pretty logs).
    #[must_use]
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the storage backend.
    #[must_use]
    pub fn storage_backend(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = storage;
        self
    }

    /// Sets the audit log collaborator.
    #[must_use]
    pub fn audit_log(mut self, audit_log: Arc<dyn AuditLog>) -> Self {
        self.audit_log = audit_log;
        self
    }

    /// Sets the server directory used for `serverHost`.
    ///
    /// Defaults to a static directory built from `Config::servers`.
    #[must_use]
    pub fn server_directory(mut self, directory: Arc<dyn ServerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        let directory = self.directory.unwrap_or_else(|| {
            Arc::new(StaticServerDirectory::new(self.config.servers.clone()))
        });
        Server {
            config: self.config,
            storage: self.storage,
            audit_log: self.audit_log,
            directory,
        }
    }
}
