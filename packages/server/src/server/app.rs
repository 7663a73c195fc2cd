//! Application setup and server configuration.

use std::time::Duration;

use axum::{extract::Extension, routing::get, Router};
use chrono::{DateTime, Utc};
use tickwork::SchedulerKind;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::domains::hardware::ValueStore;
use crate::server::routes::{best_hardware_handler, hardware_handler, health_handler, status_handler};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: ValueStore,
    pub scheduler: SchedulerKind,
    pub refresh_interval: Duration,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(store: ValueStore, config: &Config) -> Self {
        Self {
            store,
            scheduler: config.scheduler,
            refresh_interval: config.refresh_interval,
            started_at: Utc::now(),
        }
    }
}

/// Build the Axum application router
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/hardware", get(hardware_handler))
        .route("/api/hardware/best", get(best_hardware_handler))
        .route("/api/status", get(status_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(Extension(state)),
        )
}
