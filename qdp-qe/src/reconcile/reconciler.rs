//! Cross-source reconciler
//!
//! **[QDP-RC-010]** For one (ticker, fiscal date) key, gather the current
//! best record from every source that has one, merge per canonical field by
//! source precedence, and score aggregate disagreement risk. The result is
//! always recomputed from scratch and upserted on the key, so reconciling
//! twice with the same inputs is byte-for-byte deterministic and a new
//! source arrival simply triggers another full recompute.
//!
//! **[QDP-RC-020]** Precedence is per field category: manually verified
//! beats structured filings beats OCR beats third-party APIs for currency
//! fields, while ratio fields demote OCR below third-party APIs (decimal
//! ratios survive API plumbing better than OCR'd percent tables).

use std::collections::BTreeMap;

use chrono::NaiveDate;
use qdp_common::db::models::{
    CanonicalFields, FieldCategory, ReconciledField, SourceType, TriageState,
};
use qdp_common::db::settings::QualityThresholds;
use qdp_common::{Error, Result};
use sqlx::{Pool, Sqlite};

/// One source's contribution to a reconciliation
#[derive(Debug, Clone)]
struct SourceRecord {
    doc_id: i64,
    source_type: SourceType,
    fields: CanonicalFields,
    quality_score: Option<f64>,
}

/// Result of reconciling one key
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub fields: BTreeMap<String, ReconciledField>,
    pub risk_score: f64,
    pub source_count: usize,
    pub triage_state: TriageState,
}

pub struct Reconciler {
    db: Pool<Sqlite>,
    thresholds: QualityThresholds,
}

impl Reconciler {
    pub fn new(db: Pool<Sqlite>, thresholds: QualityThresholds) -> Self {
        Self { db, thresholds }
    }

    /// Recompute the reconciled record for a key from scratch.
    ///
    /// Eligible inputs are fully approved normalized records whose
    /// validation run passed shape and identity; per source type, the most
    /// recent document wins the candidacy.
    pub async fn reconcile(&self, ticker: &str, fiscal_date: NaiveDate) -> Result<ReconcileOutcome> {
        let sources = self.eligible_sources(ticker, fiscal_date).await?;
        if sources.is_empty() {
            return Err(Error::NotFound(format!(
                "no eligible records for {} {}",
                ticker, fiscal_date
            )));
        }

        let mut fields: BTreeMap<String, ReconciledField> = BTreeMap::new();
        let mut max_field_risk = 0.0_f64;

        // Union of canonical fields reported by any source
        let mut field_names: Vec<String> = Vec::new();
        for source in &sources {
            for name in source.fields.keys() {
                if !field_names.contains(name) {
                    field_names.push(name.clone());
                }
            }
        }
        field_names.sort();

        for name in &field_names {
            let category = qdp_common::db::models::field_category(name)
                .unwrap_or(FieldCategory::Currency);

            let mut candidates: BTreeMap<String, f64> = BTreeMap::new();
            let mut winner: Option<(SourceType, f64)> = None;
            for source in &sources {
                let Some(fv) = source.fields.get(name) else {
                    continue;
                };
                candidates.insert(source.source_type.as_str().to_string(), fv.value);
                let rank = source.source_type.precedence_for(category);
                let better = match winner {
                    Some((current, _)) => rank > current.precedence_for(category),
                    None => true,
                };
                if better {
                    winner = Some((source.source_type, fv.value));
                }
            }

            let Some((winning_source, chosen_value)) = winner else {
                continue;
            };

            let discrepancy = relative_spread(candidates.values().copied());
            let field_risk = if discrepancy <= self.thresholds.reconcile_tolerance {
                0.0
            } else {
                discrepancy.min(1.0)
            };
            max_field_risk = max_field_risk.max(field_risk);

            fields.insert(
                name.clone(),
                ReconciledField {
                    chosen_value,
                    winning_source,
                    discrepancy,
                    candidates,
                },
            );
        }

        // Aggregate risk: the worst per-field disagreement plus a small
        // penalty for low validation quality among the inputs. One field in
        // serious dispute is enough to hold the whole key back.
        let base_risk = max_field_risk;
        let min_quality = sources
            .iter()
            .map(|s| s.quality_score.unwrap_or(1.0))
            .fold(1.0_f64, f64::min);
        let risk_score = (base_risk + 0.1 * (1.0 - min_quality)).min(1.0);

        let last_input_doc_id = sources.iter().map(|s| s.doc_id).max().unwrap_or(0);
        let triage_state = self
            .upsert(
                ticker,
                fiscal_date,
                &fields,
                risk_score,
                sources.len(),
                last_input_doc_id,
            )
            .await?;

        tracing::info!(ticker, %fiscal_date, sources = sources.len(),
            risk = risk_score, state = triage_state.as_str(), "Reconciled key");

        Ok(ReconcileOutcome {
            fields,
            risk_score,
            source_count: sources.len(),
            triage_state,
        })
    }

    /// Current best eligible record per source type for a key
    async fn eligible_sources(
        &self,
        ticker: &str,
        fiscal_date: NaiveDate,
    ) -> Result<Vec<SourceRecord>> {
        let rows: Vec<(i64, String, String, Option<f64>)> = sqlx::query_as(
            r#"
            SELECT nr.doc_id, nr.source_type, nr.canonical_fields, vr.quality_score
            FROM normalized_records nr
            JOIN validation_runs vr ON vr.doc_id = nr.doc_id
            WHERE nr.ticker = ? AND nr.fiscal_date = ?
              AND nr.statement_normalized = 1
              AND nr.unit_review_status IN ('AUTO_APPROVED', 'APPROVED')
              AND nr.label_review_status IN ('AUTO_APPROVED', 'APPROVED')
              AND vr.stage_1_status = 'PASS'
              AND vr.stage_2_status IN ('PASS', 'SKIPPED')
            ORDER BY nr.doc_id
            "#,
        )
        .bind(ticker)
        .bind(fiscal_date)
        .fetch_all(&self.db)
        .await?;

        // Latest document per source type wins the candidacy
        let mut by_source: BTreeMap<String, SourceRecord> = BTreeMap::new();
        for (doc_id, source, fields_json, quality_score) in rows {
            let record = SourceRecord {
                doc_id,
                source_type: SourceType::parse(&source)?,
                fields: serde_json::from_str(&fields_json)
                    .map_err(|e| Error::Internal(format!("Corrupt canonical fields: {}", e)))?,
                quality_score,
            };
            by_source.insert(source, record);
        }
        let mut sources: Vec<SourceRecord> = by_source.into_values().collect();
        sources.sort_by_key(|s| s.doc_id);
        Ok(sources)
    }

    /// Upsert the reconciled row. The triage state resets to UNSCORED for
    /// re-scoring, except ESCALATED and RESOLVED keys which hold their place
    /// in the escalation flow. `last_input_doc_id` is the staleness
    /// watermark: sweeps re-reconcile a key only when a newer document
    /// becomes eligible.
    async fn upsert(
        &self,
        ticker: &str,
        fiscal_date: NaiveDate,
        fields: &BTreeMap<String, ReconciledField>,
        risk_score: f64,
        source_count: usize,
        last_input_doc_id: i64,
    ) -> Result<TriageState> {
        let current: Option<String> = sqlx::query_scalar(
            "SELECT triage_state FROM reconciled_records WHERE ticker = ? AND fiscal_date = ?",
        )
        .bind(ticker)
        .bind(fiscal_date)
        .fetch_optional(&self.db)
        .await?;

        let next_state = match current {
            Some(state) => match TriageState::parse(&state)? {
                TriageState::Escalated => TriageState::Escalated,
                TriageState::Resolved => TriageState::Resolved,
                TriageState::Unscored => TriageState::Unscored,
                other if other.can_transition_to(TriageState::Unscored) => TriageState::Unscored,
                other => other,
            },
            None => TriageState::Unscored,
        };

        let fields_json = serde_json::to_string(fields)
            .map_err(|e| Error::Internal(format!("Serializing reconciled fields: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO reconciled_records
                (ticker, fiscal_date, fields, risk_score, source_count,
                 last_input_doc_id, triage_state, reconciled_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(ticker, fiscal_date) DO UPDATE SET
                fields = excluded.fields,
                risk_score = excluded.risk_score,
                source_count = excluded.source_count,
                last_input_doc_id = excluded.last_input_doc_id,
                triage_state = excluded.triage_state,
                reconciled_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(ticker)
        .bind(fiscal_date)
        .bind(&fields_json)
        .bind(risk_score)
        .bind(source_count as i64)
        .bind(last_input_doc_id)
        .bind(next_state.as_str())
        .execute(&self.db)
        .await?;

        Ok(next_state)
    }
}

/// Relative disagreement across candidate values: total spread scaled by
/// the smallest magnitude, so a 1000-vs-1300 split reads as 30% rather
/// than being flattered by the larger figure.
fn relative_spread(values: impl Iterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.collect();
    if values.len() < 2 {
        return 0.0;
    }
    let max = values.iter().cloned().fold(f64::MIN, f64::max);
    let min = values.iter().cloned().fold(f64::MAX, f64::min);
    let min_abs = values.iter().map(|v| v.abs()).fold(f64::MAX, f64::min);
    let scale = if min_abs > 0.0 {
        min_abs
    } else {
        values.iter().map(|v| v.abs()).fold(0.0_f64, f64::max)
    };
    if scale == 0.0 {
        0.0
    } else {
        (max - min) / scale
    }
}
