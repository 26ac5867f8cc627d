//! Validation run engine
//!
//! **[QDP-VE-010]** Owns the `validation_runs` relation: one row per fully
//! approved normalized record, five stage status/version column pairs, a
//! failure reason, accumulated field flags, and the final quality score.
//!
//! Execution rules:
//! - Stages run in fixed order; a FAIL at stage N stops the run and leaves
//!   later stages PENDING. Stage 2 (identity) failure is terminal for the
//!   document and excludes it from reconciliation.
//! - A stage stamps its version only on successful completion (PASS or
//!   SKIPPED); failed stages carry no version and stay FAIL. A run whose
//!   stamped version differs from the current constant gets a waterfall
//!   reset: that stage and everything after it return to PENDING and
//!   re-execute.

use qdp_common::db::models::{CanonicalFields, StageStatus};
use qdp_common::db::settings::QualityThresholds;
use qdp_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};

use crate::validation::stages::{
    self, FlaggedField, HistoryPeriod, StageResult, STAGE_IDENTITY_VERSION, STAGE_OUTLIER_VERSION,
    STAGE_SCORING_VERSION, STAGE_SECTOR_VERSION, STAGE_SHAPE_VERSION,
};

const STAGE_COUNT: usize = 5;

const CURRENT_VERSIONS: [&str; STAGE_COUNT] = [
    STAGE_SHAPE_VERSION,
    STAGE_IDENTITY_VERSION,
    STAGE_SECTOR_VERSION,
    STAGE_OUTLIER_VERSION,
    STAGE_SCORING_VERSION,
];

/// Flags collected by the advisory stages, persisted in `details`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RunDetails {
    #[serde(default)]
    sector_flags: Vec<FlaggedField>,
    #[serde(default)]
    outlier_flags: Vec<FlaggedField>,
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    run_id: i64,
    doc_id: i64,
    stage_1_status: String,
    stage_2_status: String,
    stage_3_status: String,
    stage_4_status: String,
    stage_5_status: String,
    stage_1_version: Option<String>,
    stage_2_version: Option<String>,
    stage_3_version: Option<String>,
    stage_4_version: Option<String>,
    stage_5_version: Option<String>,
    failure_reason: Option<String>,
    details: Option<String>,
}

/// In-memory working state of one run
struct RunState {
    run_id: i64,
    doc_id: i64,
    statuses: [StageStatus; STAGE_COUNT],
    versions: [Option<String>; STAGE_COUNT],
    failure_reason: Option<String>,
    details: RunDetails,
    quality_score: Option<f64>,
}

impl RunState {
    fn from_row(row: RunRow) -> Result<Self> {
        let statuses = [
            StageStatus::parse(&row.stage_1_status)?,
            StageStatus::parse(&row.stage_2_status)?,
            StageStatus::parse(&row.stage_3_status)?,
            StageStatus::parse(&row.stage_4_status)?,
            StageStatus::parse(&row.stage_5_status)?,
        ];
        let versions = [
            row.stage_1_version,
            row.stage_2_version,
            row.stage_3_version,
            row.stage_4_version,
            row.stage_5_version,
        ];
        let details = match &row.details {
            Some(json) => serde_json::from_str(json)
                .map_err(|e| Error::Internal(format!("Corrupt run details: {}", e)))?,
            None => RunDetails::default(),
        };
        Ok(Self {
            run_id: row.run_id,
            doc_id: row.doc_id,
            statuses,
            versions,
            failure_reason: row.failure_reason,
            details,
            quality_score: None,
        })
    }

    /// Reset stage `from` and everything after it to PENDING
    fn waterfall_reset(&mut self, from: usize) {
        for i in from..STAGE_COUNT {
            self.statuses[i] = StageStatus::Pending;
            self.versions[i] = None;
        }
        if from <= 2 {
            self.details.sector_flags.clear();
        }
        if from <= 3 {
            self.details.outlier_flags.clear();
        }
        self.failure_reason = None;
        self.quality_score = None;
    }

    /// First stage whose stamped version no longer matches the engine
    fn stale_stage(&self) -> Option<usize> {
        (0..STAGE_COUNT).find(|&i| {
            self.versions[i]
                .as_deref()
                .map(|v| v != CURRENT_VERSIONS[i])
                .unwrap_or(false)
        })
    }

    fn needs_work(&self) -> bool {
        if self.stale_stage().is_some() {
            return true;
        }
        // PENDING stages behind a FAIL are intentionally stuck
        for status in &self.statuses {
            match status {
                StageStatus::Pending => return true,
                StageStatus::Fail => return false,
                _ => {}
            }
        }
        false
    }
}

pub struct ValidationEngine {
    db: Pool<Sqlite>,
    thresholds: QualityThresholds,
}

impl ValidationEngine {
    pub fn new(db: Pool<Sqlite>, thresholds: QualityThresholds) -> Self {
        Self { db, thresholds }
    }

    /// Create run rows for fully approved normalized records that have none
    pub async fn seed_runs(&self) -> Result<usize> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO validation_runs (doc_id)
            SELECT doc_id FROM normalized_records
            WHERE statement_normalized = 1
              AND unit_review_status IN ('AUTO_APPROVED', 'APPROVED')
              AND label_review_status IN ('AUTO_APPROVED', 'APPROVED')
            "#,
        )
        .execute(&self.db)
        .await?;
        let seeded = result.rows_affected() as usize;
        if seeded > 0 {
            tracing::info!(seeded, "Seeded validation runs");
        }
        Ok(seeded)
    }

    /// Advance every run that has actionable work. Returns the number of
    /// runs that executed at least one stage.
    pub async fn run_pending(&self) -> Result<usize> {
        let rows: Vec<RunRow> = sqlx::query_as("SELECT * FROM validation_runs ORDER BY run_id")
            .fetch_all(&self.db)
            .await?;

        let mut advanced = 0;
        for row in rows {
            let state = RunState::from_row(row)?;
            if !state.needs_work() {
                continue;
            }
            self.process(state).await?;
            advanced += 1;
        }
        Ok(advanced)
    }

    async fn process(&self, mut state: RunState) -> Result<()> {
        if let Some(stale) = state.stale_stage() {
            tracing::info!(run_id = state.run_id, stage = stale + 1,
                "Stage version bumped, waterfall reset");
            state.waterfall_reset(stale);
        }

        let record: (String, chrono::NaiveDate, String) = sqlx::query_as(
            "SELECT ticker, fiscal_date, canonical_fields
             FROM normalized_records WHERE doc_id = ?",
        )
        .bind(state.doc_id)
        .fetch_one(&self.db)
        .await?;
        let (ticker, fiscal_date, fields_json) = record;
        let fields: CanonicalFields = serde_json::from_str(&fields_json)
            .map_err(|e| Error::Internal(format!("Corrupt canonical fields: {}", e)))?;
        let industry = self.industry_of(&ticker).await?;

        for i in 0..STAGE_COUNT {
            match state.statuses[i] {
                StageStatus::Pass | StageStatus::Skipped => continue,
                StageStatus::Fail => break,
                StageStatus::Pending => {}
            }

            let result = match i {
                0 => stages::shape(&fields, &industry),
                1 => stages::identity(&fields, self.thresholds.identity_tolerance),
                2 => {
                    let r = stages::sector(&fields, &industry);
                    state.details.sector_flags = r.flags.clone();
                    r
                }
                3 => {
                    let history = self.golden_history(&ticker, fiscal_date).await?;
                    let r = stages::outlier(
                        &fields,
                        &history,
                        self.thresholds.outlier_sigma_threshold,
                        self.thresholds.outlier_min_history,
                    );
                    state.details.outlier_flags = r.flags.clone();
                    r
                }
                _ => {
                    let mut flags = state.details.sector_flags.clone();
                    flags.extend(state.details.outlier_flags.iter().cloned());
                    let (r, score) = stages::scoring(fields.len(), &flags);
                    state.quality_score = Some(score);
                    r
                }
            };

            state.statuses[i] = result.status;

            if result.status == StageStatus::Fail {
                // No version stamp on failure
                state.versions[i] = None;
                tracing::warn!(run_id = state.run_id, doc_id = state.doc_id,
                    stage = i + 1, reason = ?result.failure_reason,
                    "Validation stage failed");
                state.failure_reason = result.failure_reason;
                break;
            }
            state.versions[i] = Some(CURRENT_VERSIONS[i].to_string());
        }

        self.persist(&state).await
    }

    async fn persist(&self, state: &RunState) -> Result<()> {
        let details = serde_json::to_string(&state.details)
            .map_err(|e| Error::Internal(format!("Serializing run details: {}", e)))?;

        sqlx::query(
            r#"
            UPDATE validation_runs SET
                stage_1_status = ?, stage_2_status = ?, stage_3_status = ?,
                stage_4_status = ?, stage_5_status = ?,
                stage_1_version = ?, stage_2_version = ?, stage_3_version = ?,
                stage_4_version = ?, stage_5_version = ?,
                failure_reason = ?, details = ?, quality_score = ?,
                last_updated_at = CURRENT_TIMESTAMP
            WHERE run_id = ?
            "#,
        )
        .bind(state.statuses[0].as_str())
        .bind(state.statuses[1].as_str())
        .bind(state.statuses[2].as_str())
        .bind(state.statuses[3].as_str())
        .bind(state.statuses[4].as_str())
        .bind(&state.versions[0])
        .bind(&state.versions[1])
        .bind(&state.versions[2])
        .bind(&state.versions[3])
        .bind(&state.versions[4])
        .bind(&state.failure_reason)
        .bind(&details)
        .bind(state.quality_score)
        .bind(state.run_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Trailing golden history for a ticker, newest first, latest version
    /// per period, capped at the configured window.
    async fn golden_history(
        &self,
        ticker: &str,
        before: chrono::NaiveDate,
    ) -> Result<Vec<HistoryPeriod>> {
        #[derive(sqlx::FromRow)]
        struct GoldenMetrics {
            revenue: Option<f64>,
            operating_expenses: Option<f64>,
            ebitda: Option<f64>,
            net_income: Option<f64>,
            total_assets: Option<f64>,
            total_liabilities: Option<f64>,
            total_equity: Option<f64>,
            operating_cash_flow: Option<f64>,
        }

        let rows: Vec<GoldenMetrics> = sqlx::query_as(
            r#"
            SELECT g.revenue, g.operating_expenses, g.ebitda, g.net_income,
                   g.total_assets, g.total_liabilities, g.total_equity,
                   g.operating_cash_flow
            FROM golden_records g
            JOIN (
                SELECT fiscal_date, MAX(version) AS version
                FROM golden_records
                WHERE ticker = ? AND fiscal_date < ?
                GROUP BY fiscal_date
            ) latest ON latest.fiscal_date = g.fiscal_date
                    AND latest.version = g.version
            WHERE g.ticker = ? AND g.fiscal_date < ?
            ORDER BY g.fiscal_date DESC
            LIMIT ?
            "#,
        )
        .bind(ticker)
        .bind(before)
        .bind(ticker)
        .bind(before)
        .bind(self.thresholds.outlier_window_periods as i64)
        .fetch_all(&self.db)
        .await?;

        let periods = rows
            .into_iter()
            .map(|m| {
                let mut period = HistoryPeriod::new();
                let mut put = |name: &str, value: Option<f64>| {
                    if let Some(v) = value {
                        period.insert(name.to_string(), v);
                    }
                };
                put("revenue", m.revenue);
                put("operating_expenses", m.operating_expenses);
                put("ebitda", m.ebitda);
                put("net_income", m.net_income);
                put("total_assets", m.total_assets);
                put("total_liabilities", m.total_liabilities);
                put("total_equity", m.total_equity);
                put("operating_cash_flow", m.operating_cash_flow);
                period
            })
            .collect();
        Ok(periods)
    }

    async fn industry_of(&self, ticker: &str) -> Result<String> {
        let industry: Option<String> =
            sqlx::query_scalar("SELECT industry FROM companies WHERE ticker = ?")
                .bind(ticker)
                .fetch_optional(&self.db)
                .await?;
        Ok(industry.unwrap_or_else(|| "GENERAL".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qdp_common::db::models::{FieldValue, SourceType};
    use sqlx::SqlitePool;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        qdp_common::db::create_schema(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO companies (ticker, company_name, industry) VALUES ('ACME', 'Acme Industries', 'MANUFACTURING')",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    fn fields_json(entries: &[(&str, f64)]) -> String {
        let fields: CanonicalFields = entries
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    FieldValue {
                        value: *value,
                        raw_label: name.to_string(),
                        source_type: SourceType::StructuredFiling,
                    },
                )
            })
            .collect();
        serde_json::to_string(&fields).unwrap()
    }

    /// Insert a parsed document + fully approved normalized record directly
    async fn insert_record(pool: &SqlitePool, fields: &[(&str, f64)], date: &str) -> i64 {
        sqlx::query(
            "INSERT INTO raw_assets (content_hash, content, source_type)
             VALUES (?, X'00', 'STRUCTURED_FILING')",
        )
        .bind(format!("hash-{}", date))
        .execute(pool)
        .await
        .unwrap();
        let asset_id: i64 = sqlx::query_scalar("SELECT MAX(asset_id) FROM raw_assets")
            .fetch_one(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO parsed_documents (asset_id, parser_version, parse_status, content)
             VALUES (?, 'json-1.0', 'OK', '{}')",
        )
        .bind(asset_id)
        .execute(pool)
        .await
        .unwrap();
        let doc_id: i64 = sqlx::query_scalar("SELECT MAX(doc_id) FROM parsed_documents")
            .fetch_one(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO normalized_records
                (doc_id, ticker, fiscal_date, source_type, canonical_fields,
                 statement_normalized, unit_review_status, label_review_status)
             VALUES (?, 'ACME', ?, 'STRUCTURED_FILING', ?, 1, 'AUTO_APPROVED', 'AUTO_APPROVED')",
        )
        .bind(doc_id)
        .bind(date)
        .bind(fields_json(fields))
        .execute(pool)
        .await
        .unwrap();
        doc_id
    }

    const BALANCED: &[(&str, f64)] = &[
        ("revenue", 1000.0),
        ("net_income", 150.0),
        ("total_assets", 5000.0),
        ("total_liabilities", 3000.0),
        ("total_equity", 2000.0),
    ];

    #[tokio::test]
    async fn test_clean_record_passes_all_stages() {
        let pool = setup_test_db().await;
        let doc_id = insert_record(&pool, BALANCED, "2025-06-30").await;

        let engine = ValidationEngine::new(pool.clone(), QualityThresholds::default());
        assert_eq!(engine.seed_runs().await.unwrap(), 1);
        assert_eq!(engine.run_pending().await.unwrap(), 1);

        let row: RunRow = sqlx::query_as("SELECT * FROM validation_runs WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.stage_1_status, "PASS");
        assert_eq!(row.stage_2_status, "PASS");
        assert_eq!(row.stage_3_status, "PASS");
        // No golden history yet
        assert_eq!(row.stage_4_status, "SKIPPED");
        assert_eq!(row.stage_5_status, "PASS");
        assert_eq!(row.stage_2_version.as_deref(), Some(STAGE_IDENTITY_VERSION));

        let score: Option<f64> =
            sqlx::query_scalar("SELECT quality_score FROM validation_runs WHERE doc_id = ?")
                .bind(doc_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(score, Some(1.0));

        // Second sweep finds nothing to do
        assert_eq!(engine.run_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_identity_failure_is_terminal() {
        let pool = setup_test_db().await;
        let doc_id = insert_record(
            &pool,
            &[
                ("revenue", 1000.0),
                ("net_income", 150.0),
                ("total_assets", 5000.0),
                ("total_liabilities", 3000.0),
                ("total_equity", 1500.0), // 10% imbalance
            ],
            "2025-06-30",
        )
        .await;

        let engine = ValidationEngine::new(pool.clone(), QualityThresholds::default());
        engine.seed_runs().await.unwrap();
        engine.run_pending().await.unwrap();

        let row: RunRow = sqlx::query_as("SELECT * FROM validation_runs WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.stage_1_status, "PASS");
        assert_eq!(row.stage_2_status, "FAIL");
        assert_eq!(row.stage_3_status, "PENDING");
        assert_eq!(row.stage_5_status, "PENDING");
        assert!(row.failure_reason.unwrap().contains("identity"));
        // Versions stamp only on successful completion
        assert_eq!(row.stage_1_version.as_deref(), Some(STAGE_SHAPE_VERSION));
        assert!(row.stage_2_version.is_none());

        // Failed run is terminal, not retried
        assert_eq!(engine.run_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unapproved_record_not_seeded() {
        let pool = setup_test_db().await;
        let doc_id = insert_record(&pool, BALANCED, "2025-06-30").await;
        sqlx::query(
            "UPDATE normalized_records SET label_review_status = 'PENDING_REVIEW' WHERE doc_id = ?",
        )
        .bind(doc_id)
        .execute(&pool)
        .await
        .unwrap();

        let engine = ValidationEngine::new(pool.clone(), QualityThresholds::default());
        assert_eq!(engine.seed_runs().await.unwrap(), 0);

        // An incomplete statement gates seeding on its own axis too
        sqlx::query(
            "UPDATE normalized_records
             SET label_review_status = 'AUTO_APPROVED', statement_normalized = 0
             WHERE doc_id = ?",
        )
        .bind(doc_id)
        .execute(&pool)
        .await
        .unwrap();
        assert_eq!(engine.seed_runs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_waterfall_reset_on_version_bump() {
        let pool = setup_test_db().await;
        let doc_id = insert_record(&pool, BALANCED, "2025-06-30").await;

        let engine = ValidationEngine::new(pool.clone(), QualityThresholds::default());
        engine.seed_runs().await.unwrap();
        engine.run_pending().await.unwrap();

        // Simulate a historical run executed under an older sector rules
        // version
        sqlx::query(
            "UPDATE validation_runs SET stage_3_version = '0.9' WHERE doc_id = ?",
        )
        .bind(doc_id)
        .execute(&pool)
        .await
        .unwrap();

        assert_eq!(engine.run_pending().await.unwrap(), 1);

        let row: RunRow = sqlx::query_as("SELECT * FROM validation_runs WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        // Earlier stages untouched, stale stage and everything after re-ran
        assert_eq!(row.stage_1_status, "PASS");
        assert_eq!(row.stage_2_status, "PASS");
        assert_eq!(row.stage_3_status, "PASS");
        assert_eq!(row.stage_3_version.as_deref(), Some(STAGE_SECTOR_VERSION));
        assert_eq!(row.stage_5_status, "PASS");
    }
}
