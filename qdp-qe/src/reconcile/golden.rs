//! Golden record store
//!
//! **[QDP-GR-010]** The final fact table is append-only and versioned per
//! (ticker, fiscal_date). Promotion always inserts max(version)+1; a
//! restatement never touches prior versions, so consumers can pin a version
//! and audits can replay history. The satellite bag rides along one-to-one
//! with each golden row.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use qdp_common::db::models::{
    field_category, FieldCategory, GoldenRecordRow, ReconciledField, SatelliteBag, SourceType,
    TriageState,
};
use qdp_common::{Error, Result};
use sqlx::{Pool, Sqlite};

use crate::reconcile::triage::Triage;
use qdp_common::db::settings::QualityThresholds;

/// Currency columns materialized on `golden_records`
const GOLDEN_COLUMNS: [&str; 8] = [
    "revenue",
    "operating_expenses",
    "ebitda",
    "net_income",
    "total_assets",
    "total_liabilities",
    "total_equity",
    "operating_cash_flow",
];

pub struct GoldenStore {
    db: Pool<Sqlite>,
    thresholds: QualityThresholds,
}

impl GoldenStore {
    pub fn new(db: Pool<Sqlite>, thresholds: QualityThresholds) -> Self {
        Self { db, thresholds }
    }

    /// Promote a LOW_RISK or RESOLVED reconciled key into the golden table.
    /// Returns the version inserted.
    pub async fn promote(&self, ticker: &str, fiscal_date: NaiveDate) -> Result<i64> {
        let (fields_json, state): (String, String) = sqlx::query_as(
            "SELECT fields, triage_state FROM reconciled_records
             WHERE ticker = ? AND fiscal_date = ?",
        )
        .bind(ticker)
        .bind(fiscal_date)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| Error::NotFound(format!("reconciled record {} {}", ticker, fiscal_date)))?;

        let state = TriageState::parse(&state)?;
        if !state.can_transition_to(TriageState::Promoted) {
            return Err(Error::InvalidTransition(format!(
                "cannot promote {} {} from {}",
                ticker,
                fiscal_date,
                state.as_str()
            )));
        }

        let fields: BTreeMap<String, ReconciledField> = serde_json::from_str(&fields_json)
            .map_err(|e| Error::Internal(format!("Corrupt reconciled fields: {}", e)))?;

        // Overall provenance: the highest-precedence source that won any
        // field, and that source's latest asset.
        let primary_source = fields
            .values()
            .map(|f| f.winning_source)
            .max_by_key(|s| s.precedence_for(FieldCategory::Currency))
            .unwrap_or(SourceType::ThirdPartyApi);
        let primary_asset_id = self
            .latest_asset_for(ticker, fiscal_date, primary_source)
            .await?;

        let next_version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM golden_records
             WHERE ticker = ? AND fiscal_date = ?",
        )
        .bind(ticker)
        .bind(fiscal_date)
        .fetch_one(&self.db)
        .await?;

        let column_value =
            |name: &str| -> Option<f64> { fields.get(name).map(|f| f.chosen_value) };

        sqlx::query(
            r#"
            INSERT INTO golden_records
                (ticker, fiscal_date, version, source_type, primary_asset_id,
                 revenue, operating_expenses, ebitda, net_income, total_assets,
                 total_liabilities, total_equity, operating_cash_flow)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ticker)
        .bind(fiscal_date)
        .bind(next_version)
        .bind(primary_source.as_str())
        .bind(primary_asset_id)
        .bind(column_value("revenue"))
        .bind(column_value("operating_expenses"))
        .bind(column_value("ebitda"))
        .bind(column_value("net_income"))
        .bind(column_value("total_assets"))
        .bind(column_value("total_liabilities"))
        .bind(column_value("total_equity"))
        .bind(column_value("operating_cash_flow"))
        .execute(&self.db)
        .await?;

        let golden_id: i64 = sqlx::query_scalar(
            "SELECT golden_id FROM golden_records
             WHERE ticker = ? AND fiscal_date = ? AND version = ?",
        )
        .bind(ticker)
        .bind(fiscal_date)
        .bind(next_version)
        .fetch_one(&self.db)
        .await?;

        let kpi_data = self.collect_satellites(ticker, fiscal_date, &fields).await?;
        let kpi_json = serde_json::to_string(&kpi_data)
            .map_err(|e| Error::Internal(format!("Serializing satellite bag: {}", e)))?;
        sqlx::query("INSERT INTO golden_record_satellites (golden_id, kpi_data) VALUES (?, ?)")
            .bind(golden_id)
            .bind(&kpi_json)
            .execute(&self.db)
            .await?;

        Triage::new(self.db.clone(), self.thresholds.clone())
            .transition(ticker, fiscal_date, state, TriageState::Promoted)
            .await?;

        tracing::info!(ticker, %fiscal_date, version = next_version,
            source = primary_source.as_str(), satellites = kpi_data.len(),
            "Promoted golden record");
        Ok(next_version)
    }

    /// Latest golden version for a key, if any
    pub async fn latest(
        &self,
        ticker: &str,
        fiscal_date: NaiveDate,
    ) -> Result<Option<GoldenRecordRow>> {
        let row = sqlx::query_as(
            "SELECT * FROM golden_records WHERE ticker = ? AND fiscal_date = ?
             ORDER BY version DESC LIMIT 1",
        )
        .bind(ticker)
        .bind(fiscal_date)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    /// Satellite bag for a promotion: contributing records' satellite facts
    /// merged in ascending precedence (higher precedence overwrites), plus
    /// reconciled ratio fields that have no golden column.
    async fn collect_satellites(
        &self,
        ticker: &str,
        fiscal_date: NaiveDate,
        fields: &BTreeMap<String, ReconciledField>,
    ) -> Result<SatelliteBag> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT source_type, satellite_facts FROM normalized_records
             WHERE ticker = ? AND fiscal_date = ?
               AND unit_review_status IN ('AUTO_APPROVED', 'APPROVED')
               AND label_review_status IN ('AUTO_APPROVED', 'APPROVED')",
        )
        .bind(ticker)
        .bind(fiscal_date)
        .fetch_all(&self.db)
        .await?;

        let mut contributions: Vec<(u8, SatelliteBag)> = Vec::new();
        for (source, bag_json) in rows {
            let source = SourceType::parse(&source)?;
            let bag: SatelliteBag = serde_json::from_str(&bag_json)
                .map_err(|e| Error::Internal(format!("Corrupt satellite facts: {}", e)))?;
            contributions.push((source.precedence_for(FieldCategory::Currency), bag));
        }
        contributions.sort_by_key(|(rank, _)| *rank);

        let mut merged = SatelliteBag::new();
        for (_, bag) in contributions {
            merged.extend(bag);
        }
        for (name, field) in fields {
            if !GOLDEN_COLUMNS.contains(&name.as_str())
                && field_category(name).is_some()
            {
                merged.insert(name.clone(), field.chosen_value);
            }
        }
        Ok(merged)
    }

    async fn latest_asset_for(
        &self,
        ticker: &str,
        fiscal_date: NaiveDate,
        source: SourceType,
    ) -> Result<Option<i64>> {
        let asset_id: Option<i64> = sqlx::query_scalar(
            "SELECT pd.asset_id FROM normalized_records nr
             JOIN parsed_documents pd ON pd.doc_id = nr.doc_id
             WHERE nr.ticker = ? AND nr.fiscal_date = ? AND nr.source_type = ?
             ORDER BY nr.doc_id DESC LIMIT 1",
        )
        .bind(ticker)
        .bind(fiscal_date)
        .bind(source.as_str())
        .fetch_optional(&self.db)
        .await?;
        Ok(asset_id)
    }
}
