//! Label and unit review endpoints
//!
//! **[QDP-API-030]** The HTTP face of the review queue; these are the only
//! writes that move a mapping or a unit review out of PENDING_REVIEW.

use axum::{extract::State, routing::get, Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use qdp_common::db::settings::QualityThresholds;

use crate::error::ApiResult;
use crate::services::review_queue::{LabelDecision, PendingLabel, ReviewQueue};
use crate::AppState;

async fn queue(state: &AppState) -> ApiResult<ReviewQueue> {
    let thresholds = QualityThresholds::load(&state.db).await?;
    Ok(ReviewQueue::new(
        state.db.clone(),
        thresholds.label_suggest_threshold,
    ))
}

/// GET /api/review/labels
pub async fn list_pending_labels(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<PendingLabel>>> {
    let pending = queue(&state).await?.pending_labels().await?;
    Ok(Json(pending))
}

#[derive(Debug, Deserialize)]
pub struct LabelReviewRequest {
    pub raw_label: String,
    pub industry: String,
    #[serde(flatten)]
    pub decision: LabelDecision,
    pub reviewer: String,
}

#[derive(Debug, Serialize)]
pub struct LabelReviewResponse {
    /// Documents re-normalized by the application pass
    pub reapplied: usize,
}

/// POST /api/review/labels
pub async fn decide_label(
    State(state): State<AppState>,
    Json(req): Json<LabelReviewRequest>,
) -> ApiResult<Json<LabelReviewResponse>> {
    let reapplied = queue(&state)
        .await?
        .decide_label(&req.raw_label, &req.industry, &req.decision, &req.reviewer)
        .await?;
    Ok(Json(LabelReviewResponse { reapplied }))
}

#[derive(Debug, Serialize)]
pub struct PendingUnitReview {
    pub doc_id: i64,
    pub ticker: String,
    pub fiscal_date: NaiveDate,
    pub source_type: String,
}

/// GET /api/review/units
pub async fn list_pending_units(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<PendingUnitReview>>> {
    let rows = queue(&state).await?.pending_units().await?;
    let pending = rows
        .into_iter()
        .map(|row| PendingUnitReview {
            doc_id: row.doc_id,
            ticker: row.ticker,
            fiscal_date: row.fiscal_date,
            source_type: row.source_type,
        })
        .collect();
    Ok(Json(pending))
}

#[derive(Debug, Deserialize)]
pub struct UnitReviewRequest {
    pub doc_id: i64,
    pub approve: bool,
    pub reviewer: String,
}

/// POST /api/review/units
pub async fn decide_units(
    State(state): State<AppState>,
    Json(req): Json<UnitReviewRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    queue(&state)
        .await?
        .decide_units(req.doc_id, req.approve, &req.reviewer)
        .await?;
    Ok(Json(serde_json::json!({"doc_id": req.doc_id, "decided": true})))
}

pub fn review_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/review/labels",
            get(list_pending_labels).post(decide_label),
        )
        .route(
            "/api/review/units",
            get(list_pending_units).post(decide_units),
        )
}
