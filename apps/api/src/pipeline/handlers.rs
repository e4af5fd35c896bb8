use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::segmentation::SegmentationLocationPair;
use crate::pipeline::driver::{Directive, RunOutcome};
use crate::pipeline::orchestrator::RoundStatus;
use crate::state::AppState;

const RUN_ID_HEADER: &str = "x-run-id";
const DEFAULT_PAIR_LIMIT: usize = 50;
const MAX_PAIR_LIMIT: usize = 500;

#[derive(Deserialize)]
pub struct RunRequest {
    pub directive: Directive,
    pub run_id: Option<String>,
}

/// POST /api/v1/run
///
/// Always answers with a status token; `failed` maps to 503 so schedulers
/// that only look at the HTTP code still back off. A body that does not
/// parse is answered with `failed` and 400.
pub async fn handle_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    let header_run_id = headers
        .get(RUN_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            let run_id = header_run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            warn!("Run {run_id}: rejected request body: {rejection}");
            let outcome = RunOutcome::invalid_request(&run_id, rejection.body_text());
            return with_run_id((StatusCode::BAD_REQUEST, Json(outcome)).into_response(), &run_id);
        }
    };

    let run_id = req
        .run_id
        .filter(|id| !id.trim().is_empty())
        .or(header_run_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let outcome = state.driver.execute(req.directive, &run_id).await;
    let status = if outcome.status == RoundStatus::Failed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    with_run_id((status, Json(outcome)).into_response(), &run_id)
}

fn with_run_id(mut response: Response, run_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(run_id) {
        response.headers_mut().insert(RUN_ID_HEADER, value);
    }
    response
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/segmentations
pub async fn handle_list_pairs(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<SegmentationLocationPair>>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAIR_LIMIT)
        .clamp(1, MAX_PAIR_LIMIT);
    Ok(Json(state.catalog.list_pairs(limit).await?))
}

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: String,
}

#[derive(Serialize)]
pub struct AdImageResponse {
    pub user_id: String,
    pub pair_key: String,
    pub image_url: String,
}

/// GET /api/v1/ad-image
pub async fn handle_ad_image(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<AdImageResponse>, AppError> {
    let user_id = params.user_id.trim();
    if user_id.is_empty() {
        return Err(AppError::Validation("user_id must not be empty".to_string()));
    }

    let pair = state
        .catalog
        .pair_for_user(user_id)
        .await?
        .filter(|p| p.is_rendered())
        .ok_or_else(|| AppError::NotFound(format!("No creative for user {user_id}")))?;

    Ok(Json(AdImageResponse {
        user_id: user_id.to_string(),
        pair_key: pair.pair_key,
        image_url: pair.image_url,
    }))
}

#[derive(Serialize)]
pub struct QueueDepthResponse {
    pub pending: u64,
}

/// GET /api/v1/queue
pub async fn handle_queue_depth(
    State(state): State<AppState>,
) -> Result<Json<QueueDepthResponse>, AppError> {
    Ok(Json(QueueDepthResponse {
        pending: state.queue.count_pending().await?,
    }))
}
