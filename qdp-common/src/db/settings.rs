//! Settings database operations
//!
//! Get/set accessors for the key/value settings table, plus the typed
//! `QualityThresholds` bundle loaded once per pipeline pass.

use crate::{Error, Result};
use sqlx::{Pool, Sqlite};

/// Pipeline thresholds, loaded from the settings table with seeded defaults.
///
/// Defaults follow the documented design values; nothing stricter is
/// inferred. Operators tune these via the settings table.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityThresholds {
    /// Stage 2: relative tolerance for accounting identities (default 0.01)
    pub identity_tolerance: f64,
    /// Stage 4: σ threshold for historical outliers (default 5.0)
    pub outlier_sigma_threshold: f64,
    /// Stage 4: trailing window length in periods (default 8)
    pub outlier_window_periods: usize,
    /// Stage 4: minimum prior periods for the check to run (default 6)
    pub outlier_min_history: usize,
    /// Reconciliation: relative agreement tolerance (default 0.05)
    pub reconcile_tolerance: f64,
    /// Triage: risk below this is LOW_RISK (default 0.25)
    pub risk_low_cutoff: f64,
    /// Normalization: similarity needed to suggest a mapping (default 0.85)
    pub label_suggest_threshold: f64,
    /// Ledger: FETCH_FAILED retry bound (default 3)
    pub ingest_max_attempts: i64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            identity_tolerance: 0.01,
            outlier_sigma_threshold: 5.0,
            outlier_window_periods: 8,
            outlier_min_history: 6,
            reconcile_tolerance: 0.05,
            risk_low_cutoff: 0.25,
            label_suggest_threshold: 0.85,
            ingest_max_attempts: 3,
        }
    }
}

impl QualityThresholds {
    /// Load thresholds from the settings table, falling back to defaults for
    /// any missing key.
    pub async fn load(db: &Pool<Sqlite>) -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            identity_tolerance: get_setting(db, "identity_tolerance")
                .await?
                .unwrap_or(d.identity_tolerance),
            outlier_sigma_threshold: get_setting(db, "outlier_sigma_threshold")
                .await?
                .unwrap_or(d.outlier_sigma_threshold),
            outlier_window_periods: get_setting(db, "outlier_window_periods")
                .await?
                .unwrap_or(d.outlier_window_periods),
            outlier_min_history: get_setting(db, "outlier_min_history")
                .await?
                .unwrap_or(d.outlier_min_history),
            reconcile_tolerance: get_setting(db, "reconcile_tolerance")
                .await?
                .unwrap_or(d.reconcile_tolerance),
            risk_low_cutoff: get_setting(db, "risk_low_cutoff")
                .await?
                .unwrap_or(d.risk_low_cutoff),
            label_suggest_threshold: get_setting(db, "label_suggest_threshold")
                .await?
                .unwrap_or(d.label_suggest_threshold),
            ingest_max_attempts: get_setting(db, "ingest_max_attempts")
                .await?
                .unwrap_or(d.ingest_max_attempts),
        })
    }
}

/// Get the HTTP listen port for the quality-engine service (default 5741)
pub async fn get_http_port(db: &Pool<Sqlite>) -> Result<u16> {
    get_setting(db, "qe_http_port").await.map(|opt| opt.unwrap_or(5741))
}

/// Generic setting getter
pub async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    match row {
        Some((value,)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting '{}' failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Generic setting setter
pub async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                        updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}
