//! Application startup and lifecycle management.

use crate::config::MatchingConfig;
use crate::handlers;
use crate::services::{
    get_metrics, init_metrics, AliasDecayJob, Database, MatchStore, MatchingService,
};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get,
    routing::post, Json, Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: MatchingConfig,
    pub service: Arc<MatchingService>,
    pub store: Arc<dyn MatchStore>,
    pub db: Option<Arc<Database>>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_status = match &state.db {
        Some(db) => db.health_check().await,
        None => Ok(()),
    };
    match db_status {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "matching-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "matching-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_status = match &state.db {
        Some(db) => db.health_check().await,
        None => Ok(()),
    };
    match db_status {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: MatchingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: MatchingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: MatchingConfig, run_migrations: bool) -> Result<Self, AppError> {
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let store: Arc<dyn MatchStore> = db.clone();
        Self::build_with_store(config, store, Some(db)).await
    }

    /// Build against an explicit store. Tests use this to run the full
    /// application on the in-memory store.
    pub async fn build_with_store(
        config: MatchingConfig,
        store: Arc<dyn MatchStore>,
        db: Option<Arc<Database>>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let service = Arc::new(MatchingService::new(store.clone(), config.matching));

        let state = AppState {
            config: config.clone(),
            service,
            store,
            db,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Matching service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the store backing this application.
    pub fn store(&self) -> Arc<dyn MatchStore> {
        self.state.store.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .route("/matching/run", post(handlers::run_auto_match))
            .route("/matching/stats", get(handlers::stats))
            .route("/receipts/:receipt_id/candidates", get(handlers::get_candidates))
            .route("/matches/manual", post(handlers::create_manual_match))
            .route("/matches/:match_id/confirm", post(handlers::confirm_match))
            .route("/matches/:match_id/reject", post(handlers::reject_match))
            .route("/matches/:match_id/unmatch", post(handlers::unmatch))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(self.state.clone());

        // The decay job lives for as long as the server does.
        let shutdown = CancellationToken::new();
        let decay_job = AliasDecayJob::new(self.state.store.clone(), self.state.config.decay);
        let decay_handle = decay_job.spawn(shutdown.clone());

        tracing::info!(
            service = "matching-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, router).await;

        shutdown.cancel();
        decay_handle.abort();

        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server error");
            return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
        }
        Ok(())
    }
}
