//! Domain enums and row models for the QDP pipeline relations
//!
//! Status enums are stored as TEXT in SQLite and round-trip through
//! `as_str`/`parse`. The `SourceType` ordering is the explicit
//! source-of-truth hierarchy consumed by the reconciliation comparator.

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Ingestion
// ============================================================================

/// Ingestion job status **[QDP-JL-010]**
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Registered expectation, no fetch attempt yet
    Pending,
    /// Fetch succeeded and the job is linked to an asset
    Success,
    /// Source authoritatively reported the document does not exist
    MissingAtSource,
    /// Fetch attempt failed (retryable up to a bounded count)
    FetchFailed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Success => "SUCCESS",
            JobStatus::MissingAtSource => "MISSING_AT_SOURCE",
            JobStatus::FetchFailed => "FETCH_FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "SUCCESS" => Ok(JobStatus::Success),
            "MISSING_AT_SOURCE" => Ok(JobStatus::MissingAtSource),
            "FETCH_FAILED" => Ok(JobStatus::FetchFailed),
            other => Err(Error::InvalidInput(format!("Unknown job status: {}", other))),
        }
    }
}

/// Parse status for a (asset, parser-version) run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseStatus {
    Ok,
    Error,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStatus::Ok => "OK",
            ParseStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "OK" => Ok(ParseStatus::Ok),
            "ERROR" => Ok(ParseStatus::Error),
            other => Err(Error::InvalidInput(format!("Unknown parse status: {}", other))),
        }
    }
}

// ============================================================================
// Sources and precedence
// ============================================================================

/// Data source tier, ordered by trust.
///
/// **[QDP-RC-020]** This is the explicit source-of-truth hierarchy: when two
/// sources agree within tolerance, the value from the higher-precedence
/// source wins. Modeled as an ordered enumeration, never as ad hoc string
/// comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceType {
    /// Third-party aggregator API
    ThirdPartyApi,
    /// OCR extraction from a PDF filing
    OcrExtracted,
    /// Structured machine-readable filing (XBRL or equivalent)
    StructuredFiling,
    /// Human-verified data, including resolved escalations
    ManuallyVerified,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::ThirdPartyApi => "THIRD_PARTY_API",
            SourceType::OcrExtracted => "OCR_EXTRACTED",
            SourceType::StructuredFiling => "STRUCTURED_FILING",
            SourceType::ManuallyVerified => "MANUALLY_VERIFIED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "THIRD_PARTY_API" => Ok(SourceType::ThirdPartyApi),
            "OCR_EXTRACTED" => Ok(SourceType::OcrExtracted),
            "STRUCTURED_FILING" => Ok(SourceType::StructuredFiling),
            "MANUALLY_VERIFIED" => Ok(SourceType::ManuallyVerified),
            other => Err(Error::InvalidInput(format!("Unknown source type: {}", other))),
        }
    }

    /// Precedence rank for a field category; higher wins.
    ///
    /// Precedence is per-field-category rather than global-per-source: OCR
    /// extraction garbles small ratio figures far more often than currency
    /// amounts, so for ratio fields OCR ranks below the third-party API tier.
    pub fn precedence_for(&self, category: FieldCategory) -> u8 {
        match (category, self) {
            (FieldCategory::Ratio, SourceType::OcrExtracted) => 0,
            (FieldCategory::Ratio, SourceType::ThirdPartyApi) => 1,
            (_, SourceType::ThirdPartyApi) => 0,
            (_, SourceType::OcrExtracted) => 1,
            (_, SourceType::StructuredFiling) => 2,
            (_, SourceType::ManuallyVerified) => 3,
        }
    }
}

/// Category of a canonical field, used for precedence and plausibility rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldCategory {
    /// Monetary amount in reporting currency
    Currency,
    /// Percentage or ratio figure
    Ratio,
}

/// The canonical field schema: universal fields every source normalizes into.
///
/// Industry-specific metrics that are not in this list are routed to the
/// satellite bag, never into the canonical columns.
pub const CANONICAL_FIELDS: &[(&str, FieldCategory)] = &[
    ("revenue", FieldCategory::Currency),
    ("operating_expenses", FieldCategory::Currency),
    ("ebitda", FieldCategory::Currency),
    ("net_income", FieldCategory::Currency),
    ("total_assets", FieldCategory::Currency),
    ("total_liabilities", FieldCategory::Currency),
    ("total_equity", FieldCategory::Currency),
    ("operating_cash_flow", FieldCategory::Currency),
    ("gross_npa_ratio", FieldCategory::Ratio),
    ("net_npa_ratio", FieldCategory::Ratio),
];

/// Look up the category of a canonical field, if it is one.
pub fn field_category(name: &str) -> Option<FieldCategory> {
    CANONICAL_FIELDS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, c)| *c)
}

/// All canonical field names (suggestion candidates for label mapping).
pub fn canonical_field_names() -> impl Iterator<Item = &'static str> {
    CANONICAL_FIELDS.iter().map(|(n, _)| *n)
}

// ============================================================================
// Normalization review states
// ============================================================================

/// Review state for unit and label normalization of a record
///
/// Progression: PENDING → (AUTO_APPROVED | PENDING_REVIEW) → APPROVED.
/// A record may not be promoted until every review state is APPROVED or
/// AUTO_APPROVED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewStatus {
    Pending,
    AutoApproved,
    PendingReview,
    Approved,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "PENDING",
            ReviewStatus::AutoApproved => "AUTO_APPROVED",
            ReviewStatus::PendingReview => "PENDING_REVIEW",
            ReviewStatus::Approved => "APPROVED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(ReviewStatus::Pending),
            "AUTO_APPROVED" => Ok(ReviewStatus::AutoApproved),
            "PENDING_REVIEW" => Ok(ReviewStatus::PendingReview),
            "APPROVED" => Ok(ReviewStatus::Approved),
            other => Err(Error::InvalidInput(format!("Unknown review status: {}", other))),
        }
    }

    /// Resolved states allow downstream promotion.
    pub fn is_resolved(&self) -> bool {
        matches!(self, ReviewStatus::AutoApproved | ReviewStatus::Approved)
    }
}

/// Approval status of a cached label mapping **[QDP-NR-020]**
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingStatus {
    Approved,
    PendingReview,
    Rejected,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Approved => "APPROVED",
            MappingStatus::PendingReview => "PENDING_REVIEW",
            MappingStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "APPROVED" => Ok(MappingStatus::Approved),
            "PENDING_REVIEW" => Ok(MappingStatus::PendingReview),
            "REJECTED" => Ok(MappingStatus::Rejected),
            other => Err(Error::InvalidInput(format!("Unknown mapping status: {}", other))),
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Status of one validation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Pass,
    Fail,
    /// Stage could not produce a meaningful answer (e.g. insufficient
    /// history for the outlier check); distinct from failure.
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "PENDING",
            StageStatus::Pass => "PASS",
            StageStatus::Fail => "FAIL",
            StageStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(StageStatus::Pending),
            "PASS" => Ok(StageStatus::Pass),
            "FAIL" => Ok(StageStatus::Fail),
            "SKIPPED" => Ok(StageStatus::Skipped),
            other => Err(Error::InvalidInput(format!("Unknown stage status: {}", other))),
        }
    }
}

/// Advisory flag attached to a single field by validation stages 3/4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldFlag {
    /// Sector rule: an exactly-zero value implausible for this sector
    SuspiciousZero,
    /// Value deviates beyond the σ threshold from trailing history
    HistoricalOutlier,
}

impl FieldFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldFlag::SuspiciousZero => "SUSPICIOUS_ZERO",
            FieldFlag::HistoricalOutlier => "HISTORICAL_OUTLIER",
        }
    }
}

// ============================================================================
// Triage
// ============================================================================

/// Triage state machine for a reconciled record **[QDP-TR-010]**
///
/// `UNSCORED → LOW_RISK → PROMOTED`
/// `UNSCORED → HIGH_RISK → ESCALATED → (RESOLVED → PROMOTED | UNRESOLVED)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriageState {
    Unscored,
    LowRisk,
    HighRisk,
    Escalated,
    Resolved,
    Unresolved,
    Promoted,
}

impl TriageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriageState::Unscored => "UNSCORED",
            TriageState::LowRisk => "LOW_RISK",
            TriageState::HighRisk => "HIGH_RISK",
            TriageState::Escalated => "ESCALATED",
            TriageState::Resolved => "RESOLVED",
            TriageState::Unresolved => "UNRESOLVED",
            TriageState::Promoted => "PROMOTED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "UNSCORED" => Ok(TriageState::Unscored),
            "LOW_RISK" => Ok(TriageState::LowRisk),
            "HIGH_RISK" => Ok(TriageState::HighRisk),
            "ESCALATED" => Ok(TriageState::Escalated),
            "RESOLVED" => Ok(TriageState::Resolved),
            "UNRESOLVED" => Ok(TriageState::Unresolved),
            "PROMOTED" => Ok(TriageState::Promoted),
            other => Err(Error::InvalidInput(format!("Unknown triage state: {}", other))),
        }
    }

    /// Legal transitions of the triage state machine.
    pub fn can_transition_to(&self, next: TriageState) -> bool {
        use TriageState::*;
        matches!(
            (self, next),
            (Unscored, LowRisk)
                | (Unscored, HighRisk)
                | (LowRisk, Promoted)
                | (HighRisk, Escalated)
                | (Escalated, Resolved)
                | (Escalated, Unresolved)
                | (Resolved, Promoted)
                // Re-reconciliation with a new source re-scores the record
                | (LowRisk, Unscored)
                | (HighRisk, Unscored)
                | (Promoted, Unscored)
                | (Resolved, Unscored)
                | (Unresolved, Unscored)
        )
    }
}

/// Escalation queue entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscalationStatus {
    Pending,
    Resolved,
    Abandoned,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Pending => "PENDING",
            EscalationStatus::Resolved => "RESOLVED",
            EscalationStatus::Abandoned => "ABANDONED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(EscalationStatus::Pending),
            "RESOLVED" => Ok(EscalationStatus::Resolved),
            "ABANDONED" => Ok(EscalationStatus::Abandoned),
            other => Err(Error::InvalidInput(format!(
                "Unknown escalation status: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// Structured payloads (stored as JSON columns)
// ============================================================================

/// A canonical field value with provenance, as stored on a normalized record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: f64,
    /// The exact source label this value was mapped from
    pub raw_label: String,
    pub source_type: SourceType,
}

/// Canonical field map for a normalized record (BTreeMap keeps JSON output
/// deterministic for hashing and tests)
pub type CanonicalFields = BTreeMap<String, FieldValue>;

/// Open-ended satellite facts: raw label → value, no canonical meaning
pub type SatelliteBag = BTreeMap<String, f64>;

/// Per-field outcome recorded by the reconciliation comparator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciledField {
    pub chosen_value: f64,
    pub winning_source: SourceType,
    /// Max relative disagreement across sources for this field (0.0 when a
    /// single source reported it)
    pub discrepancy: f64,
    /// Every source's candidate value, kept for audit
    pub candidates: BTreeMap<String, f64>,
}

// ============================================================================
// Row models
// ============================================================================

/// Row model for `ingestion_jobs`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IngestionJobRow {
    pub job_id: String,
    pub ticker: String,
    pub fiscal_year: i64,
    pub quarter: i64,
    pub source_type: String,
    pub consolidation_status: String,
    pub script_version: String,
    pub status: String,
    pub failure_reason: Option<String>,
    pub attempt_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_attempted_at: Option<DateTime<Utc>>,
}

/// Row model for `raw_assets`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawAssetRow {
    pub asset_id: i64,
    pub content_hash: String,
    pub source_type: String,
    pub storage_location: Option<String>,
    pub source_last_modified: Option<DateTime<Utc>>,
    pub content: Vec<u8>,
    pub first_seen_at: DateTime<Utc>,
}

/// Row model for `parsed_documents`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ParsedDocumentRow {
    pub doc_id: i64,
    pub asset_id: i64,
    pub parser_version: String,
    pub parse_status: String,
    pub error_detail: Option<String>,
    pub content: Option<String>,
    pub parsed_at: DateTime<Utc>,
}

/// Row model for `normalized_records`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NormalizedRecordRow {
    pub doc_id: i64,
    pub ticker: String,
    pub fiscal_date: NaiveDate,
    pub source_type: String,
    pub canonical_fields: String,
    pub satellite_facts: String,
    pub statement_normalized: bool,
    pub unit_review_status: String,
    pub label_review_status: String,
    pub created_at: DateTime<Utc>,
}

impl NormalizedRecordRow {
    /// All three review states resolved → eligible for validation/promotion.
    pub fn is_fully_approved(&self) -> Result<bool> {
        let unit = ReviewStatus::parse(&self.unit_review_status)?;
        let label = ReviewStatus::parse(&self.label_review_status)?;
        Ok(self.statement_normalized && unit.is_resolved() && label.is_resolved())
    }
}

/// Row model for `golden_records`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GoldenRecordRow {
    pub golden_id: i64,
    pub ticker: String,
    pub fiscal_date: NaiveDate,
    pub version: i64,
    pub source_type: String,
    pub primary_asset_id: Option<i64>,
    pub revenue: Option<f64>,
    pub operating_expenses: Option<f64>,
    pub ebitda: Option<f64>,
    pub net_income: Option<f64>,
    pub total_assets: Option<f64>,
    pub total_liabilities: Option<f64>,
    pub total_equity: Option<f64>,
    pub operating_cash_flow: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for s in [
            JobStatus::Pending,
            JobStatus::Success,
            JobStatus::MissingAtSource,
            JobStatus::FetchFailed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()).unwrap(), s);
        }
        for s in [
            TriageState::Unscored,
            TriageState::LowRisk,
            TriageState::HighRisk,
            TriageState::Escalated,
            TriageState::Resolved,
            TriageState::Unresolved,
            TriageState::Promoted,
        ] {
            assert_eq!(TriageState::parse(s.as_str()).unwrap(), s);
        }
        assert!(JobStatus::parse("BOGUS").is_err());
    }

    #[test]
    fn test_currency_precedence_order() {
        let order = [
            SourceType::ThirdPartyApi,
            SourceType::OcrExtracted,
            SourceType::StructuredFiling,
            SourceType::ManuallyVerified,
        ];
        for pair in order.windows(2) {
            assert!(
                pair[0].precedence_for(FieldCategory::Currency)
                    < pair[1].precedence_for(FieldCategory::Currency)
            );
        }
    }

    #[test]
    fn test_ratio_precedence_demotes_ocr() {
        // For ratio fields OCR ranks below the third-party API tier
        assert!(
            SourceType::OcrExtracted.precedence_for(FieldCategory::Ratio)
                < SourceType::ThirdPartyApi.precedence_for(FieldCategory::Ratio)
        );
        // Manual verification still wins everywhere
        assert!(
            SourceType::ManuallyVerified.precedence_for(FieldCategory::Ratio)
                > SourceType::StructuredFiling.precedence_for(FieldCategory::Ratio)
        );
    }

    #[test]
    fn test_triage_transitions() {
        assert!(TriageState::Unscored.can_transition_to(TriageState::LowRisk));
        assert!(TriageState::LowRisk.can_transition_to(TriageState::Promoted));
        assert!(TriageState::HighRisk.can_transition_to(TriageState::Escalated));
        assert!(TriageState::Escalated.can_transition_to(TriageState::Resolved));
        // Promotion is never legal straight from HIGH_RISK
        assert!(!TriageState::HighRisk.can_transition_to(TriageState::Promoted));
        assert!(!TriageState::Unscored.can_transition_to(TriageState::Promoted));
    }

    #[test]
    fn test_field_category_lookup() {
        assert_eq!(field_category("revenue"), Some(FieldCategory::Currency));
        assert_eq!(field_category("gross_npa_ratio"), Some(FieldCategory::Ratio));
        assert_eq!(field_category("not_a_field"), None);
    }
}
