use axum::{extract::Extension, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domains::hardware::HardwareKind;
use crate::server::app::AppState;

#[derive(Serialize)]
pub struct StatusResponse {
    started_at: DateTime<Utc>,
    last_refreshed_at: Option<DateTime<Utc>>,
    refreshes: u64,
    listings: usize,
    failed_kinds: Vec<HardwareKind>,
    scheduler: String,
    refresh_interval_secs: u64,
}

/// Refresh progress as seen by the value store
pub async fn status_handler(Extension(state): Extension<AppState>) -> Json<StatusResponse> {
    let snapshot = state.store.snapshot();

    Json(StatusResponse {
        started_at: state.started_at,
        last_refreshed_at: snapshot.refreshed_at,
        refreshes: snapshot.refreshes,
        listings: snapshot.listing_count(),
        failed_kinds: snapshot.failed_kinds,
        scheduler: state.scheduler.to_string(),
        refresh_interval_secs: state.refresh_interval.as_secs(),
    })
}
