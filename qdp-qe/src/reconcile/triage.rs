//! Triage state machine and escalation queue
//!
//! **[QDP-TR-010]** Every reconciled key is scored exactly once per
//! recompute: UNSCORED → LOW_RISK (await promotion) or UNSCORED → HIGH_RISK
//! → ESCALATED. Escalation enqueues a row for the expensive-extraction tier;
//! resolving it registers a manually verified record at the highest
//! precedence, re-reconciles the key, and moves it to RESOLVED so it can be
//! promoted. Abandoning leaves the key UNRESOLVED and out of the golden
//! table until a new source arrives.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, Utc};
use qdp_common::db::models::{
    field_category, EscalationStatus, FieldCategory, SourceType, TriageState,
};
use qdp_common::db::settings::QualityThresholds;
use qdp_common::{Error, Result};
use serde::Serialize;
use sqlx::{Pool, Sqlite};

use crate::reconcile::reconciler::Reconciler;
use crate::services::asset_store::AssetStore;
use crate::services::normalizer::Normalizer;
use crate::services::parser::{ParserRunner, StructuredJsonParser};
use crate::validation::stages::required_fields;
use crate::validation::ValidationEngine;

/// One escalation queue entry
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EscalationRow {
    pub escalation_id: i64,
    pub ticker: String,
    pub fiscal_date: NaiveDate,
    pub reason: String,
    pub status: String,
    pub requested_at: chrono::DateTime<Utc>,
    pub resolved_at: Option<chrono::DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

pub struct Triage {
    db: Pool<Sqlite>,
    thresholds: QualityThresholds,
}

impl Triage {
    pub fn new(db: Pool<Sqlite>, thresholds: QualityThresholds) -> Self {
        Self { db, thresholds }
    }

    /// Score an UNSCORED reconciled key. Any other state is returned
    /// unchanged; scoring is not a way to skip the escalation flow.
    pub async fn score(&self, ticker: &str, fiscal_date: NaiveDate) -> Result<TriageState> {
        let (risk_score, state): (f64, String) = sqlx::query_as(
            "SELECT risk_score, triage_state FROM reconciled_records
             WHERE ticker = ? AND fiscal_date = ?",
        )
        .bind(ticker)
        .bind(fiscal_date)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| Error::NotFound(format!("reconciled record {} {}", ticker, fiscal_date)))?;

        let current = TriageState::parse(&state)?;
        if current != TriageState::Unscored {
            return Ok(current);
        }

        if risk_score < self.thresholds.risk_low_cutoff {
            self.transition(ticker, fiscal_date, current, TriageState::LowRisk)
                .await?;
            Ok(TriageState::LowRisk)
        } else {
            self.transition(ticker, fiscal_date, current, TriageState::HighRisk)
                .await?;
            self.escalate(ticker, fiscal_date, risk_score).await?;
            Ok(TriageState::Escalated)
        }
    }

    /// HIGH_RISK → ESCALATED with a queue entry. An already-pending
    /// escalation for the key is reused, not duplicated.
    async fn escalate(&self, ticker: &str, fiscal_date: NaiveDate, risk_score: f64) -> Result<()> {
        let pending: Option<i64> = sqlx::query_scalar(
            "SELECT escalation_id FROM escalations
             WHERE ticker = ? AND fiscal_date = ? AND status = 'PENDING'",
        )
        .bind(ticker)
        .bind(fiscal_date)
        .fetch_optional(&self.db)
        .await?;

        if pending.is_none() {
            sqlx::query(
                "INSERT INTO escalations (ticker, fiscal_date, reason) VALUES (?, ?, ?)",
            )
            .bind(ticker)
            .bind(fiscal_date)
            .bind(format!("Cross-source risk {:.3} above cutoff", risk_score))
            .execute(&self.db)
            .await?;
            tracing::warn!(ticker, %fiscal_date, risk = risk_score,
                "Escalated key for manual extraction");
        }

        self.transition(ticker, fiscal_date, TriageState::HighRisk, TriageState::Escalated)
            .await
    }

    /// Escalations awaiting the expensive-extraction tier
    pub async fn pending_escalations(&self) -> Result<Vec<EscalationRow>> {
        let rows = sqlx::query_as(
            "SELECT * FROM escalations WHERE status = 'PENDING' ORDER BY requested_at",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// Resolve an escalation with manually verified values (base units,
    /// canonical field names). Registers the values as a highest-precedence
    /// source, re-reconciles the key, and moves it to RESOLVED.
    pub async fn resolve(
        &self,
        escalation_id: i64,
        values: &BTreeMap<String, f64>,
        resolved_by: &str,
    ) -> Result<TriageState> {
        let escalation = self.get_escalation(escalation_id).await?;
        if EscalationStatus::parse(&escalation.status)? != EscalationStatus::Pending {
            return Err(Error::InvalidTransition(format!(
                "escalation {} is {}, only PENDING can be resolved",
                escalation_id, escalation.status
            )));
        }

        let industry = self.industry_of(&escalation.ticker).await?;
        for name in values.keys() {
            if field_category(name).is_none() {
                return Err(Error::InvalidInput(format!(
                    "'{}' is not a canonical field",
                    name
                )));
            }
        }
        let missing: Vec<&str> = required_fields(&industry)
            .iter()
            .copied()
            .filter(|f| !values.contains_key(*f))
            .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidInput(format!(
                "resolution missing required fields: {}",
                missing.join(", ")
            )));
        }

        // Register the manual values as a normal source document so they
        // flow through the same parse/normalize/validate path as everything
        // else.
        let filing = manual_filing(&escalation.ticker, escalation.fiscal_date, values)?;
        let store = AssetStore::new(self.db.clone());
        let asset_id = store
            .put(&filing, SourceType::ManuallyVerified, None, None)
            .await?
            .asset_id();
        let asset = store.get(asset_id).await?;
        let parse = ParserRunner::new(self.db.clone())
            .run(&asset, &StructuredJsonParser)
            .await?;
        Normalizer::new(self.db.clone(), self.thresholds.label_suggest_threshold)
            .normalize(parse.doc_id)
            .await?;
        let engine = ValidationEngine::new(self.db.clone(), self.thresholds.clone());
        engine.seed_runs().await?;
        engine.run_pending().await?;

        // The manual record must itself survive shape and identity checks
        // before it can settle the dispute. A failing resolution leaves the
        // escalation open and the key ESCALATED.
        let run: Option<(String, String)> = sqlx::query_as(
            "SELECT stage_1_status, stage_2_status FROM validation_runs WHERE doc_id = ?",
        )
        .bind(parse.doc_id)
        .fetch_optional(&self.db)
        .await?;
        let eligible = match &run {
            Some((s1, s2)) => s1 == "PASS" && (s2 == "PASS" || s2 == "SKIPPED"),
            None => false,
        };
        if !eligible {
            return Err(Error::InvalidInput(format!(
                "manually verified record for {} {} failed validation, escalation stays open",
                escalation.ticker, escalation.fiscal_date
            )));
        }

        sqlx::query(
            "UPDATE escalations SET status = 'RESOLVED', resolved_at = ?, resolved_by = ?
             WHERE escalation_id = ?",
        )
        .bind(Utc::now())
        .bind(resolved_by)
        .bind(escalation_id)
        .execute(&self.db)
        .await?;

        // ESCALATED holds through the recompute, then moves to RESOLVED
        Reconciler::new(self.db.clone(), self.thresholds.clone())
            .reconcile(&escalation.ticker, escalation.fiscal_date)
            .await?;
        self.transition(
            &escalation.ticker,
            escalation.fiscal_date,
            TriageState::Escalated,
            TriageState::Resolved,
        )
        .await?;

        tracing::info!(escalation_id, ticker = %escalation.ticker,
            fiscal_date = %escalation.fiscal_date, resolved_by,
            "Escalation resolved with manually verified record");
        Ok(TriageState::Resolved)
    }

    /// Abandon an escalation; the key stays out of the golden table.
    pub async fn abandon(&self, escalation_id: i64, abandoned_by: &str) -> Result<TriageState> {
        let escalation = self.get_escalation(escalation_id).await?;
        if EscalationStatus::parse(&escalation.status)? != EscalationStatus::Pending {
            return Err(Error::InvalidTransition(format!(
                "escalation {} is {}, only PENDING can be abandoned",
                escalation_id, escalation.status
            )));
        }

        sqlx::query(
            "UPDATE escalations SET status = 'ABANDONED', resolved_at = ?, resolved_by = ?
             WHERE escalation_id = ?",
        )
        .bind(Utc::now())
        .bind(abandoned_by)
        .bind(escalation_id)
        .execute(&self.db)
        .await?;

        self.transition(
            &escalation.ticker,
            escalation.fiscal_date,
            TriageState::Escalated,
            TriageState::Unresolved,
        )
        .await?;
        Ok(TriageState::Unresolved)
    }

    /// Guarded state write; the transition matrix is the single authority.
    pub(crate) async fn transition(
        &self,
        ticker: &str,
        fiscal_date: NaiveDate,
        from: TriageState,
        to: TriageState,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition(format!(
                "{} -> {} is not a legal triage transition",
                from.as_str(),
                to.as_str()
            )));
        }

        let result = sqlx::query(
            "UPDATE reconciled_records SET triage_state = ?
             WHERE ticker = ? AND fiscal_date = ? AND triage_state = ?",
        )
        .bind(to.as_str())
        .bind(ticker)
        .bind(fiscal_date)
        .bind(from.as_str())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidTransition(format!(
                "reconciled record {} {} is no longer {}",
                ticker,
                fiscal_date,
                from.as_str()
            )));
        }

        tracing::debug!(ticker, %fiscal_date, from = from.as_str(), to = to.as_str(),
            "Triage transition");
        Ok(())
    }

    async fn get_escalation(&self, escalation_id: i64) -> Result<EscalationRow> {
        let row: Option<EscalationRow> =
            sqlx::query_as("SELECT * FROM escalations WHERE escalation_id = ?")
                .bind(escalation_id)
                .fetch_optional(&self.db)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("escalation {}", escalation_id)))
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

/// Build the JSON filing bytes for a manual resolution, reversing the
/// fiscal-date convention back to (fiscal year, quarter).
fn manual_filing(
    ticker: &str,
    fiscal_date: NaiveDate,
    values: &BTreeMap<String, f64>,
) -> Result<Vec<u8>> {
    let (fiscal_year, quarter) = match fiscal_date.month() {
        6 => (fiscal_date.year() as i64, 1),
        9 => (fiscal_date.year() as i64, 2),
        12 => (fiscal_date.year() as i64, 3),
        3 => (fiscal_date.year() as i64 - 1, 4),
        other => {
            return Err(Error::Internal(format!(
                "fiscal date {} not on a quarter boundary (month {})",
                fiscal_date, other
            )));
        }
    };

    let mut facts = serde_json::Map::new();
    for (name, value) in values {
        let unit = match field_category(name) {
            Some(FieldCategory::Ratio) => "RATIO",
            _ => "INR",
        };
        facts.insert(
            name.clone(),
            serde_json::json!({"value": value, "unit": unit}),
        );
    }

    let filing = serde_json::json!({
        "ticker": ticker,
        "fiscal_year": fiscal_year,
        "quarter": quarter,
        "facts": facts,
    });
    serde_json::to_vec(&filing)
        .map_err(|e| Error::Internal(format!("Serializing manual filing: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        qdp_common::db::create_schema(&pool).await.unwrap();
        pool
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()
    }

    async fn insert_reconciled(pool: &SqlitePool, risk: f64) {
        sqlx::query(
            "INSERT INTO reconciled_records (ticker, fiscal_date, fields, risk_score, source_count)
             VALUES ('ACME', '2025-06-30', '{}', ?, 2)",
        )
        .bind(risk)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_low_risk_scores_low() {
        let pool = setup_test_db().await;
        insert_reconciled(&pool, 0.05).await;

        let triage = Triage::new(pool.clone(), QualityThresholds::default());
        assert_eq!(triage.score("ACME", date()).await.unwrap(), TriageState::LowRisk);

        // Re-scoring a non-UNSCORED key is a no-op
        assert_eq!(triage.score("ACME", date()).await.unwrap(), TriageState::LowRisk);
    }

    #[tokio::test]
    async fn test_high_risk_escalates_once() {
        let pool = setup_test_db().await;
        insert_reconciled(&pool, 0.4).await;

        let triage = Triage::new(pool.clone(), QualityThresholds::default());
        assert_eq!(triage.score("ACME", date()).await.unwrap(), TriageState::Escalated);

        let pending = triage.pending_escalations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ticker, "ACME");

        // Re-reconcile holds ESCALATED; a second scoring pass must not
        // enqueue a duplicate
        assert_eq!(triage.score("ACME", date()).await.unwrap(), TriageState::Escalated);
        assert_eq!(triage.pending_escalations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abandon_leaves_unresolved() {
        let pool = setup_test_db().await;
        insert_reconciled(&pool, 0.4).await;

        let triage = Triage::new(pool.clone(), QualityThresholds::default());
        triage.score("ACME", date()).await.unwrap();
        let escalation_id = triage.pending_escalations().await.unwrap()[0].escalation_id;

        assert_eq!(
            triage.abandon(escalation_id, "ops@qdp").await.unwrap(),
            TriageState::Unresolved
        );

        let status: String =
            sqlx::query_scalar("SELECT status FROM escalations WHERE escalation_id = ?")
                .bind(escalation_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "ABANDONED");

        // Double abandon rejected
        assert!(matches!(
            triage.abandon(escalation_id, "ops@qdp").await.unwrap_err(),
            Error::InvalidTransition(_)
        ));
    }

    #[tokio::test]
    async fn test_resolve_requires_required_fields() {
        let pool = setup_test_db().await;
        insert_reconciled(&pool, 0.4).await;

        let triage = Triage::new(pool.clone(), QualityThresholds::default());
        triage.score("ACME", date()).await.unwrap();
        let escalation_id = triage.pending_escalations().await.unwrap()[0].escalation_id;

        let partial: BTreeMap<String, f64> = [("revenue".to_string(), 1200.0)].into();
        let err = triage
            .resolve(escalation_id, &partial, "analyst@qdp")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_resolve_with_imbalanced_values_leaves_escalation_open() {
        let pool = setup_test_db().await;
        insert_reconciled(&pool, 0.4).await;

        let triage = Triage::new(pool.clone(), QualityThresholds::default());
        triage.score("ACME", date()).await.unwrap();
        let escalation_id = triage.pending_escalations().await.unwrap()[0].escalation_id;

        // Assets 5000 vs liabilities + equity 2500: the manual record fails
        // the accounting identity and must not settle the dispute
        let values: BTreeMap<String, f64> = [
            ("revenue".to_string(), 1000.0),
            ("net_income".to_string(), 150.0),
            ("total_assets".to_string(), 5000.0),
            ("total_liabilities".to_string(), 1500.0),
            ("total_equity".to_string(), 1000.0),
        ]
        .into();
        let err = triage
            .resolve(escalation_id, &values, "analyst@qdp")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        // Escalation still pending, key still escalated
        assert_eq!(triage.pending_escalations().await.unwrap().len(), 1);
        let state: String = sqlx::query_scalar(
            "SELECT triage_state FROM reconciled_records WHERE ticker = 'ACME'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(state, "ESCALATED");
    }

    #[test]
    fn test_manual_filing_reverses_fiscal_date() {
        let values: BTreeMap<String, f64> = [("revenue".to_string(), 1200.0)].into();
        let q4 = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        let filing: serde_json::Value =
            serde_json::from_slice(&manual_filing("ACME", q4, &values).unwrap()).unwrap();
        assert_eq!(filing["fiscal_year"], 2025);
        assert_eq!(filing["quarter"], 4);
        assert_eq!(filing["facts"]["revenue"]["unit"], "INR");
    }
}
