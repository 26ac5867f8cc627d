//! Read-side overview projection
//!
//! **[QDP-API-020]** A rebuildable join over the ledger, asset store,
//! parses, normalized records, and reconciliations. This is a projection
//! for operators, never a source of truth; every number here can be
//! recomputed from the underlying relations.

use axum::{extract::State, routing::get, Json, Router};
use chrono::NaiveDate;
use serde::Serialize;

use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct OverviewResponse {
    pub totals: Totals,
    pub keys: Vec<KeyStatus>,
}

#[derive(Debug, Serialize)]
pub struct Totals {
    pub jobs_total: i64,
    pub jobs_succeeded: i64,
    pub jobs_failed: i64,
    pub assets: i64,
    pub documents_parsed: i64,
    pub records_normalized: i64,
    pub pending_label_reviews: i64,
    pub pending_unit_reviews: i64,
    pub pending_escalations: i64,
    pub golden_records: i64,
}

/// Per-(ticker, fiscal date) pipeline position
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct KeyStatus {
    pub ticker: String,
    pub fiscal_date: NaiveDate,
    pub source_count: i64,
    pub risk_score: f64,
    pub triage_state: String,
    pub golden_version: Option<i64>,
}

/// GET /api/overview
pub async fn overview(State(state): State<AppState>) -> ApiResult<Json<OverviewResponse>> {
    let count = |sql: &'static str| {
        let db = state.db.clone();
        async move { sqlx::query_scalar::<_, i64>(sql).fetch_one(&db).await }
    };

    let totals = Totals {
        jobs_total: count("SELECT COUNT(*) FROM ingestion_jobs").await?,
        jobs_succeeded: count("SELECT COUNT(*) FROM ingestion_jobs WHERE status = 'SUCCESS'")
            .await?,
        jobs_failed: count(
            "SELECT COUNT(*) FROM ingestion_jobs WHERE status IN ('FETCH_FAILED', 'MISSING_AT_SOURCE')",
        )
        .await?,
        assets: count("SELECT COUNT(*) FROM raw_assets").await?,
        documents_parsed: count("SELECT COUNT(*) FROM parsed_documents WHERE parse_status = 'OK'")
            .await?,
        records_normalized: count("SELECT COUNT(*) FROM normalized_records").await?,
        pending_label_reviews: count(
            "SELECT COUNT(*) FROM label_mappings WHERE status = 'PENDING_REVIEW'",
        )
        .await?,
        pending_unit_reviews: count(
            "SELECT COUNT(*) FROM normalized_records WHERE unit_review_status = 'PENDING_REVIEW'",
        )
        .await?,
        pending_escalations: count("SELECT COUNT(*) FROM escalations WHERE status = 'PENDING'")
            .await?,
        golden_records: count("SELECT COUNT(*) FROM golden_records").await?,
    };

    let keys: Vec<KeyStatus> = sqlx::query_as(
        r#"
        SELECT rr.ticker, rr.fiscal_date, rr.source_count, rr.risk_score,
               rr.triage_state,
               (SELECT MAX(version) FROM golden_records g
                WHERE g.ticker = rr.ticker AND g.fiscal_date = rr.fiscal_date)
                   AS golden_version
        FROM reconciled_records rr
        ORDER BY rr.ticker, rr.fiscal_date
        "#,
    )
    .fetch_all(&state.db)
    .await?;

    Ok(Json(OverviewResponse { totals, keys }))
}

pub fn overview_routes() -> Router<AppState> {
    Router::new().route("/api/overview", get(overview))
}
