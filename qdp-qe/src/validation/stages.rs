//! Validation stage rules
//!
//! **[QDP-VE-020]** Pure stage logic, separated from run-state persistence.
//! Stages 1 and 2 can fail a document outright; stages 3 and 4 only attach
//! field flags; stage 5 folds flags into a quality score.

use std::collections::BTreeMap;

use qdp_common::db::models::{CanonicalFields, FieldFlag, StageStatus};
use serde::{Deserialize, Serialize};

/// One historical period's canonical values, keyed by field name
pub type HistoryPeriod = BTreeMap<String, f64>;

pub const STAGE_SHAPE_VERSION: &str = "1.0";
pub const STAGE_IDENTITY_VERSION: &str = "1.0";
pub const STAGE_SECTOR_VERSION: &str = "1.0";
pub const STAGE_OUTLIER_VERSION: &str = "1.0";
pub const STAGE_SCORING_VERSION: &str = "1.0";

/// A flag raised against one canonical field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedField {
    pub field: String,
    pub flag: String,
}

impl FlaggedField {
    pub fn new(field: &str, flag: FieldFlag) -> Self {
        Self {
            field: field.to_string(),
            flag: flag.as_str().to_string(),
        }
    }
}

/// Outcome of executing one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub status: StageStatus,
    pub failure_reason: Option<String>,
    pub flags: Vec<FlaggedField>,
}

impl StageResult {
    pub fn pass() -> Self {
        Self {
            status: StageStatus::Pass,
            failure_reason: None,
            flags: Vec::new(),
        }
    }

    pub fn fail(reason: String) -> Self {
        Self {
            status: StageStatus::Fail,
            failure_reason: Some(reason),
            flags: Vec::new(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: StageStatus::Skipped,
            failure_reason: None,
            flags: Vec::new(),
        }
    }

    pub fn pass_with_flags(flags: Vec<FlaggedField>) -> Self {
        Self {
            status: StageStatus::Pass,
            failure_reason: None,
            flags,
        }
    }
}

/// Canonical fields a filing must carry to have a recognizable statement
/// shape. The banking playbook additionally expects asset-quality ratios.
pub fn required_fields(industry: &str) -> &'static [&'static str] {
    match industry {
        "BANKING" => &[
            "revenue",
            "net_income",
            "total_assets",
            "total_liabilities",
            "total_equity",
            "gross_npa_ratio",
            "net_npa_ratio",
        ],
        _ => &[
            "revenue",
            "net_income",
            "total_assets",
            "total_liabilities",
            "total_equity",
        ],
    }
}

/// Stage 1: statement shape. All fields the sector playbook requires are
/// present.
pub fn shape(fields: &CanonicalFields, industry: &str) -> StageResult {
    let missing: Vec<&str> = required_fields(industry)
        .iter()
        .copied()
        .filter(|f| !fields.contains_key(*f))
        .collect();

    if missing.is_empty() {
        StageResult::pass()
    } else {
        StageResult::fail(format!("Missing required fields: {}", missing.join(", ")))
    }
}

/// Stage 2: accounting identity. |assets − (liabilities + equity)| must be
/// within the relative tolerance. Failure here is terminal for the document.
pub fn identity(fields: &CanonicalFields, tolerance: f64) -> StageResult {
    let value = |name: &str| fields.get(name).map(|f| f.value);
    let (assets, liabilities, equity) = match (
        value("total_assets"),
        value("total_liabilities"),
        value("total_equity"),
    ) {
        (Some(a), Some(l), Some(e)) => (a, l, e),
        // Shape passed without balance-sheet fields only for playbooks that
        // do not require them; nothing to check then.
        _ => return StageResult::skipped(),
    };

    let imbalance = (assets - (liabilities + equity)).abs();
    let magnitude = assets.abs().max(1.0);
    if imbalance <= tolerance * magnitude {
        StageResult::pass()
    } else {
        StageResult::fail(format!(
            "Accounting identity violated: assets {} vs liabilities+equity {} (imbalance {:.2})",
            assets,
            liabilities + equity,
            imbalance
        ))
    }
}

/// Stage 3: sector rules, advisory. For banking, an exactly-zero NPA ratio
/// is implausible and flagged SUSPICIOUS_ZERO rather than failed; a clean
/// book and a not-yet-entered number look identical in the data.
pub fn sector(fields: &CanonicalFields, industry: &str) -> StageResult {
    if industry != "BANKING" {
        return StageResult::pass();
    }

    let mut flags = Vec::new();
    for field in ["gross_npa_ratio", "net_npa_ratio"] {
        if let Some(fv) = fields.get(field) {
            if fv.value == 0.0 {
                flags.push(FlaggedField::new(field, FieldFlag::SuspiciousZero));
            }
        }
    }
    StageResult::pass_with_flags(flags)
}

/// Stage 4: historical outliers, advisory. Compares each canonical field
/// against the mean/σ of its trailing history; |x − μ| > kσ flags the field.
/// With fewer than `min_history` prior periods the stage is SKIPPED, never
/// failed: young tickers have no history to betray.
pub fn outlier(
    fields: &CanonicalFields,
    history: &[HistoryPeriod],
    sigma_threshold: f64,
    min_history: usize,
) -> StageResult {
    if history.len() < min_history {
        return StageResult::skipped();
    }

    let mut flags = Vec::new();
    for (field, fv) in fields {
        let prior: Vec<f64> = history
            .iter()
            .filter_map(|h| h.get(field).copied())
            .collect();
        if prior.len() < min_history {
            continue;
        }

        let n = prior.len() as f64;
        let mean = prior.iter().sum::<f64>() / n;
        let variance = prior.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let sigma = variance.sqrt();
        if sigma == 0.0 {
            // Constant history: any change at all is a deviation, but with
            // zero spread the kσ band is degenerate; skip the field.
            continue;
        }

        if (fv.value - mean).abs() > sigma_threshold * sigma {
            flags.push(FlaggedField::new(field, FieldFlag::HistoricalOutlier));
        }
    }
    StageResult::pass_with_flags(flags)
}

/// Stage 5: fold accumulated flags into a quality score in [0, 1].
pub fn scoring(field_count: usize, flags: &[FlaggedField]) -> (StageResult, f64) {
    let score = if field_count == 0 {
        0.0
    } else {
        (1.0 - flags.len() as f64 / field_count as f64).clamp(0.0, 1.0)
    };
    (StageResult::pass(), score)
}
