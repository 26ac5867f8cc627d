//! Semantic Normalizer
//!
//! **[QDP-NR-010]** Turns a parsed document's raw labeled facts into a
//! normalized record against the canonical field schema. Every raw label
//! takes exactly one of three routes:
//!
//! 1. An APPROVED mapping for (raw_label, industry) exists, or the cleaned
//!    label *is* a canonical field name: the fact lands in the canonical
//!    field map with provenance.
//! 2. No mapping, but the label is lexically close to a canonical field
//!    (Jaro-Winkler above the configured threshold): a PENDING_REVIEW
//!    suggestion is inserted for a human and the fact stays unresolved.
//! 3. Neither: the fact goes to the satellite bag, where it is preserved
//!    but never treated as canonical.
//!
//! **[QDP-NR-020]** Normalization never inserts APPROVED mappings. The only
//! path from PENDING_REVIEW to APPROVED is the review surface.
//!
//! **[QDP-NR-030]** Unit handling follows the same unambiguous-or-reviewed
//! rule: facts with known explicit units are scaled to base units and the
//! record is AUTO_APPROVED; any missing or unknown unit parks the record in
//! PENDING_REVIEW.
//!
//! The third gate, `statement_normalized`, records whether the canonical
//! fields cover every statement section the ticker's industry requires. An
//! incomplete statement never reaches validation or reconciliation.

use qdp_common::db::models::{
    canonical_field_names, field_category, CanonicalFields, FieldCategory, FieldValue,
    MappingStatus, ReviewStatus, SatelliteBag, SourceType,
};
use qdp_common::{Error, Result};
use sqlx::{Pool, Sqlite};

use crate::services::job_ledger::quarter_end;
use crate::services::parser::{ParsedContent, ParserRunner, RawFact};
use crate::validation::stages::required_fields;

/// Result summary of normalizing one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationOutcome {
    pub doc_id: i64,
    pub statement_normalized: bool,
    pub label_status: ReviewStatus,
    pub unit_status: ReviewStatus,
    pub canonical_count: usize,
    pub satellite_count: usize,
    pub suggestions_inserted: usize,
}

/// Semantic normalizer over `normalized_records` and `label_mappings`
pub struct Normalizer {
    db: Pool<Sqlite>,
    /// Jaro-Winkler similarity needed before a mapping suggestion is raised
    suggest_threshold: f64,
}

/// Lowercase a label and collapse runs of non-alphanumerics to underscores,
/// so "Revenue from Operations" and "revenue_from_operations" compare equal.
fn slug(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut last_sep = true;
    for ch in label.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Multiplier that scales a currency fact with the given unit to base units.
/// Returns None for units the system does not recognize.
fn currency_scale(unit: &str) -> Option<f64> {
    match unit {
        "INR" | "USD" => Some(1.0),
        "INR_LAKH" => Some(1e5),
        "INR_CRORE" => Some(1e7),
        _ => None,
    }
}

/// Scale a ratio fact to the [0,1] fraction convention.
fn ratio_scale(unit: &str) -> Option<f64> {
    match unit {
        "RATIO" => Some(1.0),
        "PCT" => Some(0.01),
        _ => None,
    }
}

impl Normalizer {
    pub fn new(db: Pool<Sqlite>, suggest_threshold: f64) -> Self {
        Self {
            db,
            suggest_threshold,
        }
    }

    /// Normalize one parsed document into a normalized record, upserting on
    /// doc_id. Re-running is safe: APPROVED review states set by a human are
    /// never downgraded, while PENDING_REVIEW states are recomputed so the
    /// application pass picks up newly approved mappings.
    pub async fn normalize(&self, doc_id: i64) -> Result<NormalizationOutcome> {
        let runner = ParserRunner::new(self.db.clone());
        let content = runner.get_content(doc_id).await?;
        let source_type = self.source_type_of(doc_id).await?;
        let industry = self.industry_of(&content.ticker).await?;
        let fiscal_date = quarter_end(content.fiscal_year, content.quarter)?;

        let mut canonical = CanonicalFields::new();
        let mut satellites = SatelliteBag::new();
        let mut suggestions_inserted = 0usize;
        let mut pending_labels = false;
        let mut pending_units = false;

        for fact in &content.facts {
            let cleaned = slug(&fact.label);

            // Route the label: an existing mapping row is authoritative for
            // the pair, otherwise the cleaned label may be canonical itself,
            // lexically close to one, or unknown.
            enum Route {
                Canonical(String),
                AwaitingReview,
                Satellite,
            }

            let route = match self.mapping_for(&fact.label, &industry).await? {
                Some((MappingStatus::Approved, Some(field))) => Route::Canonical(field),
                Some((MappingStatus::Approved, None)) => Route::Satellite,
                Some((MappingStatus::PendingReview, _)) => Route::AwaitingReview,
                Some((MappingStatus::Rejected, _)) => Route::Satellite,
                None if field_category(&cleaned).is_some() => Route::Canonical(cleaned.clone()),
                None => match self.best_suggestion(&cleaned) {
                    Some(candidate) => {
                        if self
                            .insert_suggestion(&fact.label, &industry, &candidate, &content)
                            .await?
                        {
                            suggestions_inserted += 1;
                        }
                        Route::AwaitingReview
                    }
                    None => Route::Satellite,
                },
            };

            match route {
                Route::Canonical(field) => {
                    let (value, unit_ok) = scale_fact(fact, field_category(&field));
                    if !unit_ok {
                        pending_units = true;
                    }
                    canonical.insert(
                        field,
                        FieldValue {
                            value,
                            raw_label: fact.label.clone(),
                            source_type,
                        },
                    );
                }
                Route::AwaitingReview => {
                    pending_labels = true;
                }
                Route::Satellite => {
                    // Preserved, never promoted to canonical without a human
                    // decision.
                    let (value, unit_ok) = scale_fact(fact, None);
                    if !unit_ok {
                        pending_units = true;
                    }
                    satellites.insert(fact.label.clone(), value);
                }
            }
        }

        // Statement completeness: every section the industry requires must
        // be present as a canonical field
        let statement_normalized = required_fields(&industry)
            .iter()
            .all(|field| canonical.contains_key(*field));

        let label_status = if pending_labels {
            ReviewStatus::PendingReview
        } else {
            ReviewStatus::AutoApproved
        };
        let unit_status = if pending_units {
            ReviewStatus::PendingReview
        } else {
            ReviewStatus::AutoApproved
        };

        // Human APPROVED states survive re-normalization
        let existing: Option<(String, String)> = sqlx::query_as(
            "SELECT unit_review_status, label_review_status
             FROM normalized_records WHERE doc_id = ?",
        )
        .bind(doc_id)
        .fetch_optional(&self.db)
        .await?;

        let (unit_status, label_status) = match existing {
            Some((unit, label)) => (
                if unit == "APPROVED" { ReviewStatus::Approved } else { unit_status },
                if label == "APPROVED" { ReviewStatus::Approved } else { label_status },
            ),
            None => (unit_status, label_status),
        };

        let canonical_json = serde_json::to_string(&canonical)
            .map_err(|e| Error::Internal(format!("Serializing canonical fields: {}", e)))?;
        let satellite_json = serde_json::to_string(&satellites)
            .map_err(|e| Error::Internal(format!("Serializing satellite facts: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO normalized_records
                (doc_id, ticker, fiscal_date, source_type, canonical_fields,
                 satellite_facts, statement_normalized, unit_review_status,
                 label_review_status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(doc_id) DO UPDATE SET
                canonical_fields = excluded.canonical_fields,
                satellite_facts = excluded.satellite_facts,
                statement_normalized = excluded.statement_normalized,
                unit_review_status = excluded.unit_review_status,
                label_review_status = excluded.label_review_status
            "#,
        )
        .bind(doc_id)
        .bind(&content.ticker)
        .bind(fiscal_date)
        .bind(source_type.as_str())
        .bind(&canonical_json)
        .bind(&satellite_json)
        .bind(statement_normalized)
        .bind(unit_status.as_str())
        .bind(label_status.as_str())
        .execute(&self.db)
        .await?;

        tracing::info!(doc_id, ticker = %content.ticker, %fiscal_date,
            statement_normalized,
            label_status = label_status.as_str(), unit_status = unit_status.as_str(),
            canonical = canonical.len(), satellite = satellites.len(),
            suggestions = suggestions_inserted, "Normalized document");

        Ok(NormalizationOutcome {
            doc_id,
            statement_normalized,
            label_status,
            unit_status,
            canonical_count: canonical.len(),
            satellite_count: satellites.len(),
            suggestions_inserted,
        })
    }

    /// Mapping row lookup for (raw_label, industry)
    async fn mapping_for(
        &self,
        raw_label: &str,
        industry: &str,
    ) -> Result<Option<(MappingStatus, Option<String>)>> {
        let row: Option<(Option<String>, String)> = sqlx::query_as(
            "SELECT normalized_label, status FROM label_mappings
             WHERE raw_label = ? AND industry = ?",
        )
        .bind(raw_label)
        .bind(industry)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some((normalized, status)) => Ok(Some((MappingStatus::parse(&status)?, normalized))),
            None => Ok(None),
        }
    }

    /// Best canonical candidate by Jaro-Winkler similarity on cleaned labels
    fn best_suggestion(&self, cleaned: &str) -> Option<String> {
        let compare = cleaned.replace('_', " ");
        let mut best: Option<(f64, &str)> = None;
        for name in canonical_field_names() {
            let score = strsim::jaro_winkler(&compare, &name.replace('_', " "));
            if score >= self.suggest_threshold
                && best.map(|(s, _)| score > s).unwrap_or(true)
            {
                best = Some((score, name));
            }
        }
        best.map(|(_, name)| name.to_string())
    }

    /// Insert a PENDING_REVIEW suggestion unless a row for the pair already
    /// exists (a prior suggestion, approval, or rejection stands).
    /// Returns true when a new suggestion row was created.
    async fn insert_suggestion(
        &self,
        raw_label: &str,
        industry: &str,
        candidate: &str,
        content: &ParsedContent,
    ) -> Result<bool> {
        let context = format!(
            "{} FY{} Q{}",
            content.ticker, content.fiscal_year, content.quarter
        );
        let result = sqlx::query(
            r#"
            INSERT INTO label_mappings (raw_label, industry, normalized_label, status, source_context)
            VALUES (?, ?, ?, 'PENDING_REVIEW', ?)
            ON CONFLICT(raw_label, industry) DO NOTHING
            "#,
        )
        .bind(raw_label)
        .bind(industry)
        .bind(candidate)
        .bind(&context)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 1 {
            tracing::info!(raw_label, industry, candidate,
                "Raised label mapping suggestion for review");
        }
        Ok(result.rows_affected() == 1)
    }

    async fn source_type_of(&self, doc_id: i64) -> Result<SourceType> {
        let source: Option<String> = sqlx::query_scalar(
            "SELECT ra.source_type FROM parsed_documents pd
             JOIN raw_assets ra ON ra.asset_id = pd.asset_id
             WHERE pd.doc_id = ?",
        )
        .bind(doc_id)
        .fetch_optional(&self.db)
        .await?;
        let source = source.ok_or_else(|| Error::NotFound(format!("parsed document {}", doc_id)))?;
        SourceType::parse(&source)
    }

    /// Industry of a ticker from the company master; GENERAL when the
    /// company is not yet registered.
    async fn industry_of(&self, ticker: &str) -> Result<String> {
        let industry: Option<String> =
            sqlx::query_scalar("SELECT industry FROM companies WHERE ticker = ?")
                .bind(ticker)
                .fetch_optional(&self.db)
                .await?;
        Ok(industry.unwrap_or_else(|| "GENERAL".to_string()))
    }
}

/// Scale one fact according to its declared unit and target category.
/// Returns (scaled value, whether the unit was unambiguous).
fn scale_fact(fact: &RawFact, category: Option<FieldCategory>) -> (f64, bool) {
    match (&fact.unit, category) {
        (Some(unit), Some(FieldCategory::Ratio)) => match ratio_scale(unit) {
            Some(scale) => (fact.value * scale, true),
            None => (fact.value, false),
        },
        (Some(unit), _) => match currency_scale(unit) {
            Some(scale) => (fact.value * scale, true),
            None => (fact.value, false),
        },
        (None, _) => (fact.value, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::asset_store::AssetStore;
    use crate::services::parser::StructuredJsonParser;
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

    async fn parse_filing(pool: &SqlitePool, body: &[u8]) -> i64 {
        let store = AssetStore::new(pool.clone());
        let asset_id = store
            .put(body, SourceType::ThirdPartyApi, None, None)
            .await
            .unwrap()
            .asset_id();
        let asset = store.get(asset_id).await.unwrap();
        ParserRunner::new(pool.clone())
            .run(&asset, &StructuredJsonParser)
            .await
            .unwrap()
            .doc_id
    }

    #[tokio::test]
    async fn test_canonical_labels_auto_approve() {
        let pool = setup_test_db().await;
        let doc_id = parse_filing(
            &pool,
            br#"{"ticker": "ACME", "fiscal_year": 2025, "quarter": 1, "facts": {
                "revenue": {"value": 1000.0, "unit": "INR"},
                "net_income": {"value": 150.0, "unit": "INR"}
            }}"#,
        )
        .await;

        let outcome = Normalizer::new(pool.clone(), 0.85)
            .normalize(doc_id)
            .await
            .unwrap();
        assert_eq!(outcome.label_status, ReviewStatus::AutoApproved);
        assert_eq!(outcome.unit_status, ReviewStatus::AutoApproved);
        assert_eq!(outcome.canonical_count, 2);
        assert_eq!(outcome.suggestions_inserted, 0);
        // Two fields do not make a complete statement
        assert!(!outcome.statement_normalized);
    }

    #[tokio::test]
    async fn test_statement_completeness_tracks_required_sections() {
        let pool = setup_test_db().await;
        let incomplete = parse_filing(
            &pool,
            br#"{"ticker": "ACME", "fiscal_year": 2025, "quarter": 1, "facts": {
                "revenue": {"value": 1000.0, "unit": "INR"},
                "net_income": {"value": 150.0, "unit": "INR"},
                "total_assets": {"value": 5000.0, "unit": "INR"}
            }}"#,
        )
        .await;
        let complete = parse_filing(
            &pool,
            br#"{"ticker": "ACME", "fiscal_year": 2025, "quarter": 2, "facts": {
                "revenue": {"value": 1000.0, "unit": "INR"},
                "net_income": {"value": 150.0, "unit": "INR"},
                "total_assets": {"value": 5000.0, "unit": "INR"},
                "total_liabilities": {"value": 3000.0, "unit": "INR"},
                "total_equity": {"value": 2000.0, "unit": "INR"}
            }}"#,
        )
        .await;

        let normalizer = Normalizer::new(pool.clone(), 0.85);
        assert!(!normalizer.normalize(incomplete).await.unwrap().statement_normalized);
        assert!(normalizer.normalize(complete).await.unwrap().statement_normalized);

        let flags: Vec<(i64, bool)> = sqlx::query_as(
            "SELECT doc_id, statement_normalized FROM normalized_records ORDER BY doc_id",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(flags, vec![(incomplete, false), (complete, true)]);
    }

    #[tokio::test]
    async fn test_similar_label_raises_suggestion_never_approved() {
        let pool = setup_test_db().await;
        let doc_id = parse_filing(
            &pool,
            br#"{"ticker": "ACME", "fiscal_year": 2025, "quarter": 1, "facts": {
                "Total Asets": {"value": 5000.0, "unit": "INR"}
            }}"#,
        )
        .await;

        let outcome = Normalizer::new(pool.clone(), 0.85)
            .normalize(doc_id)
            .await
            .unwrap();
        assert_eq!(outcome.label_status, ReviewStatus::PendingReview);
        assert_eq!(outcome.canonical_count, 0);
        assert_eq!(outcome.suggestions_inserted, 1);

        let (normalized, status): (Option<String>, String) = sqlx::query_as(
            "SELECT normalized_label, status FROM label_mappings
             WHERE raw_label = 'Total Asets' AND industry = 'MANUFACTURING'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(normalized.as_deref(), Some("total_assets"));
        assert_eq!(status, "PENDING_REVIEW");
    }

    #[tokio::test]
    async fn test_unknown_label_goes_to_satellite_bag() {
        let pool = setup_test_db().await;
        let doc_id = parse_filing(
            &pool,
            br#"{"ticker": "ACME", "fiscal_year": 2025, "quarter": 2, "facts": {
                "Branch Count": {"value": 42.0, "unit": "INR"}
            }}"#,
        )
        .await;

        let outcome = Normalizer::new(pool.clone(), 0.85)
            .normalize(doc_id)
            .await
            .unwrap();
        assert_eq!(outcome.satellite_count, 1);
        assert_eq!(outcome.canonical_count, 0);
        assert_eq!(outcome.suggestions_inserted, 0);

        let bag: String =
            sqlx::query_scalar("SELECT satellite_facts FROM normalized_records WHERE doc_id = ?")
                .bind(doc_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        let bag: SatelliteBag = serde_json::from_str(&bag).unwrap();
        assert_eq!(bag.get("Branch Count"), Some(&42.0));
    }

    #[tokio::test]
    async fn test_approved_mapping_resolves_and_scales_crore() {
        let pool = setup_test_db().await;
        sqlx::query(
            "INSERT INTO label_mappings (raw_label, industry, normalized_label, status)
             VALUES ('Revenue from Operations', 'MANUFACTURING', 'revenue', 'APPROVED')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let doc_id = parse_filing(
            &pool,
            br#"{"ticker": "ACME", "fiscal_year": 2025, "quarter": 1, "facts": {
                "Revenue from Operations": {"value": 12.5, "unit": "INR_CRORE"}
            }}"#,
        )
        .await;

        let outcome = Normalizer::new(pool.clone(), 0.85)
            .normalize(doc_id)
            .await
            .unwrap();
        assert_eq!(outcome.label_status, ReviewStatus::AutoApproved);
        assert_eq!(outcome.canonical_count, 1);

        let fields: String =
            sqlx::query_scalar("SELECT canonical_fields FROM normalized_records WHERE doc_id = ?")
                .bind(doc_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        let fields: CanonicalFields = serde_json::from_str(&fields).unwrap();
        let revenue = fields.get("revenue").unwrap();
        assert_eq!(revenue.value, 12.5 * 1e7);
        assert_eq!(revenue.raw_label, "Revenue from Operations");
    }

    #[tokio::test]
    async fn test_missing_unit_parks_unit_review() {
        let pool = setup_test_db().await;
        let doc_id = parse_filing(
            &pool,
            br#"{"ticker": "ACME", "fiscal_year": 2025, "quarter": 3, "facts": {
                "revenue": 1000.0
            }}"#,
        )
        .await;

        let outcome = Normalizer::new(pool.clone(), 0.85)
            .normalize(doc_id)
            .await
            .unwrap();
        assert_eq!(outcome.unit_status, ReviewStatus::PendingReview);
        assert_eq!(outcome.label_status, ReviewStatus::AutoApproved);
    }

    #[test]
    fn test_slug_cleaning() {
        assert_eq!(slug("Revenue from Operations"), "revenue_from_operations");
        assert_eq!(slug("  Net   Income  "), "net_income");
        assert_eq!(slug("total_assets"), "total_assets");
    }
}
