use axum::{
    extract::{Extension, Query},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::domains::hardware::{HardwareKind, HardwareValue};
use crate::server::app::AppState;
use crate::server::error::{ApiError, ApiResult};

const MAX_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct HardwareQuery {
    pub kind: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct BestQuery {
    pub kind: Option<String>,
}

#[derive(Serialize)]
pub struct HardwareResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<HardwareKind>,
    count: usize,
    values: Vec<HardwareValue>,
}

fn parse_kind(raw: Option<&str>) -> ApiResult<Option<HardwareKind>> {
    raw.filter(|raw| !raw.trim().is_empty())
        .map(|raw| {
            raw.parse::<HardwareKind>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))
        })
        .transpose()
}

/// Ranked values, best value first
///
/// `kind` narrows to one hardware kind; `limit` caps the result (max 100).
pub async fn hardware_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<HardwareQuery>,
) -> ApiResult<Json<HardwareResponse>> {
    let kind = parse_kind(query.kind.as_deref())?;
    let limit = query.limit.unwrap_or(MAX_LIMIT).min(MAX_LIMIT);
    let values = state.store.ranked(kind, Some(limit));

    Ok(Json(HardwareResponse {
        kind,
        count: values.len(),
        values,
    }))
}

/// The single best value for a kind
pub async fn best_hardware_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<BestQuery>,
) -> ApiResult<Json<HardwareValue>> {
    let kind = parse_kind(query.kind.as_deref())?
        .ok_or_else(|| ApiError::BadRequest("kind is required".to_string()))?;

    state
        .store
        .best(kind)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no {kind} values available yet")))
}
