//! Ingestion Job Ledger
//!
//! **[QDP-JL-010]** The manifest of expected fetches: one job per
//! (ticker, fiscal year, quarter, source type, consolidation status,
//! script version). Jobs are created when an expectation is registered,
//! mutated only by the fetch attempt that owns them, and never deleted.
//!
//! **[QDP-JL-030]** A job resolves to at most one asset. A second success
//! pointing at a *different* asset is a data-integrity signal and is
//! rejected with `InvalidTransition`, not silently overwritten.

use chrono::{NaiveDate, Utc};
use qdp_common::db::models::{IngestionJobRow, JobStatus, SourceType};
use qdp_common::{Error, Result};
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

/// Identity tuple of an ingestion job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobIdentity {
    pub ticker: String,
    pub fiscal_year: i64,
    /// Fiscal quarter 1-4
    pub quarter: i64,
    pub source_type: SourceType,
    /// STANDALONE or CONSOLIDATED
    pub consolidation_status: String,
    pub script_version: String,
}

/// Outcome of one fetch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Document fetched; caller links the stored asset next
    Success,
    /// Source authoritatively has no such document
    MissingAtSource,
    /// Transient or permanent fetch failure
    FetchFailed { reason: String },
}

/// Quarter-end date for a fiscal (April-March) reporting period.
///
/// Q1 ends Jun 30 of the fiscal year, Q2 Sep 30, Q3 Dec 31, Q4 Mar 31 of
/// the following calendar year.
pub fn quarter_end(fiscal_year: i64, quarter: i64) -> Result<NaiveDate> {
    let (year, month, day) = match quarter {
        1 => (fiscal_year, 6, 30),
        2 => (fiscal_year, 9, 30),
        3 => (fiscal_year, 12, 31),
        4 => (fiscal_year + 1, 3, 31),
        other => {
            return Err(Error::InvalidInput(format!("Invalid quarter: {}", other)));
        }
    };
    NaiveDate::from_ymd_opt(year as i32, month, day)
        .ok_or_else(|| Error::Internal(format!("Bad quarter-end date {}-{}-{}", year, month, day)))
}

/// Ingestion job ledger over the `ingestion_jobs` relation
pub struct JobLedger {
    db: Pool<Sqlite>,
}

impl JobLedger {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// Register an expectation; idempotent on the identity tuple.
    ///
    /// Re-registration returns the existing job id and does not reset its
    /// status or attempt count.
    pub async fn register_expectation(&self, identity: &JobIdentity) -> Result<Uuid> {
        let job_id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO ingestion_jobs
                (job_id, ticker, fiscal_year, quarter, source_type,
                 consolidation_status, script_version)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ticker, fiscal_year, quarter, source_type,
                        consolidation_status, script_version) DO NOTHING
            "#,
        )
        .bind(job_id.to_string())
        .bind(&identity.ticker)
        .bind(identity.fiscal_year)
        .bind(identity.quarter)
        .bind(identity.source_type.as_str())
        .bind(&identity.consolidation_status)
        .bind(&identity.script_version)
        .execute(&self.db)
        .await?;

        let existing: String = sqlx::query_scalar(
            r#"
            SELECT job_id FROM ingestion_jobs
            WHERE ticker = ? AND fiscal_year = ? AND quarter = ?
              AND source_type = ? AND consolidation_status = ? AND script_version = ?
            "#,
        )
        .bind(&identity.ticker)
        .bind(identity.fiscal_year)
        .bind(identity.quarter)
        .bind(identity.source_type.as_str())
        .bind(&identity.consolidation_status)
        .bind(&identity.script_version)
        .fetch_one(&self.db)
        .await?;

        let id = Uuid::parse_str(&existing)
            .map_err(|e| Error::Internal(format!("Invalid UUID in database: {}", e)))?;

        if id == job_id {
            tracing::info!(job_id = %id, ticker = %identity.ticker,
                fiscal_year = identity.fiscal_year, quarter = identity.quarter,
                source = identity.source_type.as_str(),
                "Registered new ingestion expectation");
        } else {
            tracing::debug!(job_id = %id, "Expectation already registered, reusing job");
        }

        Ok(id)
    }

    /// Record the outcome of one fetch attempt and transition job status.
    pub async fn record_attempt(&self, job_id: Uuid, outcome: AttemptOutcome) -> Result<()> {
        let job = self.get(job_id).await?;
        let current = JobStatus::parse(&job.status)?;

        let (status, reason) = match &outcome {
            AttemptOutcome::Success => (JobStatus::Success, None),
            AttemptOutcome::MissingAtSource => (JobStatus::MissingAtSource, None),
            AttemptOutcome::FetchFailed { reason } => {
                (JobStatus::FetchFailed, Some(reason.clone()))
            }
        };

        // A succeeded job cannot regress to a failure state; the fetch that
        // owns the job already resolved it.
        if current == JobStatus::Success && status != JobStatus::Success {
            return Err(Error::InvalidTransition(format!(
                "job {} already SUCCESS, cannot transition to {}",
                job_id,
                status.as_str()
            )));
        }

        sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = ?, failure_reason = ?, attempt_count = attempt_count + 1,
                last_attempted_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(&reason)
        .bind(Utc::now())
        .bind(job_id.to_string())
        .execute(&self.db)
        .await?;

        tracing::info!(job_id = %job_id, status = status.as_str(),
            reason = ?reason, "Recorded fetch attempt");

        Ok(())
    }

    /// Link a job to its fetched asset, exactly once.
    ///
    /// Re-linking the same asset is a no-op; linking a different asset to an
    /// already-resolved job is an integrity violation.
    pub async fn link_asset(&self, job_id: Uuid, asset_id: i64) -> Result<()> {
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT asset_id FROM job_asset_link WHERE job_id = ?")
                .bind(job_id.to_string())
                .fetch_optional(&self.db)
                .await?;

        match existing {
            Some(linked) if linked == asset_id => Ok(()),
            Some(linked) => Err(Error::InvalidTransition(format!(
                "job {} already linked to asset {}, refusing relink to asset {}",
                job_id, linked, asset_id
            ))),
            None => {
                sqlx::query("INSERT INTO job_asset_link (job_id, asset_id) VALUES (?, ?)")
                    .bind(job_id.to_string())
                    .bind(asset_id)
                    .execute(&self.db)
                    .await?;
                tracing::debug!(job_id = %job_id, asset_id, "Linked job to asset");
                Ok(())
            }
        }
    }

    /// Fetch a job row; NotFound if absent.
    pub async fn get(&self, job_id: Uuid) -> Result<IngestionJobRow> {
        let row: Option<IngestionJobRow> =
            sqlx::query_as("SELECT * FROM ingestion_jobs WHERE job_id = ?")
                .bind(job_id.to_string())
                .fetch_optional(&self.db)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
    }

    /// Jobs that still warrant a fetch attempt: PENDING, plus FETCH_FAILED
    /// below the bounded retry count. Exhausted jobs are left in place as an
    /// observable failed state, never retried automatically.
    pub async fn fetchable_jobs(&self, max_attempts: i64) -> Result<Vec<IngestionJobRow>> {
        let rows: Vec<IngestionJobRow> = sqlx::query_as(
            r#"
            SELECT * FROM ingestion_jobs
            WHERE status = 'PENDING'
               OR (status = 'FETCH_FAILED' AND attempt_count < ?)
            ORDER BY created_at
            "#,
        )
        .bind(max_attempts)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }
}
