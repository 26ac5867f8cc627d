//! Pipeline runner
//!
//! **[QDP-AS-050]** `run_once` advances all pending work in dependency
//! order: normalize parsed documents that have no record yet, seed and run
//! validation, reconcile every key with eligible inputs, score UNSCORED
//! keys, and promote whatever triage cleared. Work is per-entity and
//! idempotent end to end, so overlapping sweeps converge on the same row
//! state instead of conflicting.
//!
//! Per-key failures are captured as row state and a log line; one bad key
//! never aborts the sweep.

use chrono::NaiveDate;
use qdp_common::db::models::TriageState;
use qdp_common::db::settings::QualityThresholds;
use qdp_common::Result;
use sqlx::{Pool, Sqlite};

use crate::reconcile::{GoldenStore, Reconciler, Triage};
use crate::services::normalizer::Normalizer;
use crate::validation::ValidationEngine;

/// Counts of work performed by one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub normalized: usize,
    pub validated: usize,
    pub reconciled: usize,
    pub scored: usize,
    pub promoted: usize,
}

pub struct Pipeline {
    db: Pool<Sqlite>,
    thresholds: QualityThresholds,
}

impl Pipeline {
    pub fn new(db: Pool<Sqlite>, thresholds: QualityThresholds) -> Self {
        Self { db, thresholds }
    }

    /// One full sweep over all pending work
    pub async fn run_once(&self) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();

        summary.normalized = self.normalize_new_documents().await?;

        let engine = ValidationEngine::new(self.db.clone(), self.thresholds.clone());
        engine.seed_runs().await?;
        summary.validated = engine.run_pending().await?;

        summary.reconciled = self.reconcile_ready_keys().await?;
        summary.scored = self.score_unscored_keys().await?;
        summary.promoted = self.promote_cleared_keys().await?;

        tracing::info!(
            normalized = summary.normalized,
            validated = summary.validated,
            reconciled = summary.reconciled,
            scored = summary.scored,
            promoted = summary.promoted,
            "Pipeline sweep complete"
        );
        Ok(summary)
    }

    /// Normalize OK parses that have no normalized record yet
    async fn normalize_new_documents(&self) -> Result<usize> {
        let doc_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT pd.doc_id FROM parsed_documents pd
             LEFT JOIN normalized_records nr ON nr.doc_id = pd.doc_id
             WHERE pd.parse_status = 'OK' AND nr.doc_id IS NULL
             ORDER BY pd.doc_id",
        )
        .fetch_all(&self.db)
        .await?;

        let normalizer = Normalizer::new(self.db.clone(), self.thresholds.label_suggest_threshold);
        let mut normalized = 0;
        for doc_id in doc_ids {
            match normalizer.normalize(doc_id).await {
                Ok(_) => normalized += 1,
                Err(e) => {
                    tracing::error!(doc_id, error = %e, "Normalization failed, skipping document")
                }
            }
        }
        Ok(normalized)
    }

    /// Reconcile every key with eligible records newer than its last
    /// reconcile. Keys whose inputs have not moved are left alone, so a
    /// promoted key is not needlessly re-scored and re-promoted.
    async fn reconcile_ready_keys(&self) -> Result<usize> {
        let keys: Vec<(String, NaiveDate)> = sqlx::query_as(
            r#"
            SELECT nr.ticker, nr.fiscal_date
            FROM normalized_records nr
            JOIN validation_runs vr ON vr.doc_id = nr.doc_id
            LEFT JOIN reconciled_records rr
                ON rr.ticker = nr.ticker AND rr.fiscal_date = nr.fiscal_date
            WHERE nr.statement_normalized = 1
              AND nr.unit_review_status IN ('AUTO_APPROVED', 'APPROVED')
              AND nr.label_review_status IN ('AUTO_APPROVED', 'APPROVED')
              AND vr.stage_1_status = 'PASS'
              AND vr.stage_2_status IN ('PASS', 'SKIPPED')
            GROUP BY nr.ticker, nr.fiscal_date
            HAVING MAX(rr.last_input_doc_id) IS NULL
                OR MAX(nr.doc_id) > MAX(rr.last_input_doc_id)
            ORDER BY nr.ticker, nr.fiscal_date
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        let reconciler = Reconciler::new(self.db.clone(), self.thresholds.clone());
        let mut reconciled = 0;
        for (ticker, fiscal_date) in keys {
            match reconciler.reconcile(&ticker, fiscal_date).await {
                Ok(_) => reconciled += 1,
                Err(e) => {
                    tracing::error!(ticker, %fiscal_date, error = %e, "Reconciliation failed for key")
                }
            }
        }
        Ok(reconciled)
    }

    async fn score_unscored_keys(&self) -> Result<usize> {
        let keys: Vec<(String, NaiveDate)> = sqlx::query_as(
            "SELECT ticker, fiscal_date FROM reconciled_records
             WHERE triage_state = 'UNSCORED' ORDER BY ticker, fiscal_date",
        )
        .fetch_all(&self.db)
        .await?;

        let triage = Triage::new(self.db.clone(), self.thresholds.clone());
        let mut scored = 0;
        for (ticker, fiscal_date) in keys {
            match triage.score(&ticker, fiscal_date).await {
                Ok(_) => scored += 1,
                Err(e) => tracing::error!(ticker, %fiscal_date, error = %e, "Triage failed for key"),
            }
        }
        Ok(scored)
    }

    /// Promote LOW_RISK and RESOLVED keys
    async fn promote_cleared_keys(&self) -> Result<usize> {
        let keys: Vec<(String, NaiveDate, String)> = sqlx::query_as(
            "SELECT ticker, fiscal_date, triage_state FROM reconciled_records
             WHERE triage_state IN ('LOW_RISK', 'RESOLVED')
             ORDER BY ticker, fiscal_date",
        )
        .fetch_all(&self.db)
        .await?;

        let store = GoldenStore::new(self.db.clone(), self.thresholds.clone());
        let mut promoted = 0;
        for (ticker, fiscal_date, state) in keys {
            debug_assert!(TriageState::parse(&state).is_ok());
            match store.promote(&ticker, fiscal_date).await {
                Ok(version) => {
                    promoted += 1;
                    tracing::debug!(ticker, %fiscal_date, version, "Promoted during sweep");
                }
                Err(e) => {
                    tracing::error!(ticker, %fiscal_date, error = %e, "Promotion failed for key")
                }
            }
        }
        Ok(promoted)
    }
}
