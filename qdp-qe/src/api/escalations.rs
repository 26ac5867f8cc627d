//! Escalation queue endpoints
//!
//! **[QDP-API-040]** Hand-off surface for the expensive-extraction tier:
//! list what needs a human (or a costlier pipeline), then resolve with
//! manually verified values or abandon. Resolution promotes immediately
//! when the re-reconciled key clears.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use qdp_common::db::models::TriageState;
use qdp_common::db::settings::QualityThresholds;

use crate::error::ApiResult;
use crate::reconcile::triage::EscalationRow;
use crate::reconcile::{GoldenStore, Triage};
use crate::AppState;

/// GET /api/escalations
pub async fn list_pending(State(state): State<AppState>) -> ApiResult<Json<Vec<EscalationRow>>> {
    let thresholds = QualityThresholds::load(&state.db).await?;
    let pending = Triage::new(state.db.clone(), thresholds)
        .pending_escalations()
        .await?;
    Ok(Json(pending))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// Manually verified values in base units, keyed by canonical field
    pub values: BTreeMap<String, f64>,
    pub resolved_by: String,
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub escalation_id: i64,
    pub state: String,
    /// Golden version inserted by the promotion that follows resolution
    pub golden_version: Option<i64>,
}

/// POST /api/escalations/:id/resolve
pub async fn resolve(
    State(state): State<AppState>,
    Path(escalation_id): Path<i64>,
    Json(req): Json<ResolveRequest>,
) -> ApiResult<Json<ResolveResponse>> {
    let thresholds = QualityThresholds::load(&state.db).await?;
    let triage = Triage::new(state.db.clone(), thresholds.clone());
    let escalation = triage
        .pending_escalations()
        .await?
        .into_iter()
        .find(|e| e.escalation_id == escalation_id);

    let mut resolved_state = triage
        .resolve(escalation_id, &req.values, &req.resolved_by)
        .await?;

    // RESOLVED keys promote straight away; a failed promotion leaves the
    // key RESOLVED for the next sweep.
    let mut golden_version = None;
    if let Some(escalation) = escalation {
        let store = GoldenStore::new(state.db.clone(), thresholds);
        match store.promote(&escalation.ticker, escalation.fiscal_date).await {
            Ok(version) => {
                golden_version = Some(version);
                resolved_state = TriageState::Promoted;
            }
            Err(e) => {
                tracing::warn!(escalation_id, error = %e,
                    "Resolution promoted later: promotion deferred to sweep");
            }
        }
    }

    Ok(Json(ResolveResponse {
        escalation_id,
        state: resolved_state.as_str().to_string(),
        golden_version,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AbandonRequest {
    pub abandoned_by: String,
}

/// POST /api/escalations/:id/abandon
pub async fn abandon(
    State(state): State<AppState>,
    Path(escalation_id): Path<i64>,
    Json(req): Json<AbandonRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let thresholds = QualityThresholds::load(&state.db).await?;
    let state_after = Triage::new(state.db.clone(), thresholds)
        .abandon(escalation_id, &req.abandoned_by)
        .await?;
    Ok(Json(serde_json::json!({
        "escalation_id": escalation_id,
        "state": state_after.as_str(),
    })))
}

pub fn escalation_routes() -> Router<AppState> {
    Router::new()
        .route("/api/escalations", get(list_pending))
        .route("/api/escalations/:id/resolve", post(resolve))
        .route("/api/escalations/:id/abandon", post(abandon))
}
