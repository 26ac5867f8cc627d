//! Human Review Surface
//!
//! **[QDP-NR-040]** The only path from PENDING_REVIEW to APPROVED, for both
//! label mappings and unit reviews. Every decision records the reviewer's
//! identity and timestamp. Approving a label mapping triggers the
//! application pass: documents still waiting on label review are
//! re-normalized so newly approved mappings take effect immediately.

use chrono::Utc;
use qdp_common::db::models::{field_category, MappingStatus, NormalizedRecordRow, ReviewStatus};
use qdp_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};

use crate::services::normalizer::Normalizer;

/// One pending label mapping suggestion
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PendingLabel {
    pub raw_label: String,
    pub industry: String,
    pub normalized_label: Option<String>,
    pub source_context: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
}

/// Reviewer decision on a label mapping suggestion
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum LabelDecision {
    /// Approve, optionally overriding the suggested canonical field
    Approve { normalized_label: Option<String> },
    Reject,
}

pub struct ReviewQueue {
    db: Pool<Sqlite>,
    suggest_threshold: f64,
}

impl ReviewQueue {
    pub fn new(db: Pool<Sqlite>, suggest_threshold: f64) -> Self {
        Self {
            db,
            suggest_threshold,
        }
    }

    /// Label mapping suggestions awaiting a decision, oldest first
    pub async fn pending_labels(&self) -> Result<Vec<PendingLabel>> {
        let rows = sqlx::query_as(
            "SELECT raw_label, industry, normalized_label, source_context, created_at
             FROM label_mappings WHERE status = 'PENDING_REVIEW'
             ORDER BY created_at",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// Decide a pending label mapping. Returns the number of documents
    /// re-normalized by the application pass.
    pub async fn decide_label(
        &self,
        raw_label: &str,
        industry: &str,
        decision: &LabelDecision,
        reviewer: &str,
    ) -> Result<usize> {
        let current: Option<String> = sqlx::query_scalar(
            "SELECT status FROM label_mappings WHERE raw_label = ? AND industry = ?",
        )
        .bind(raw_label)
        .bind(industry)
        .fetch_optional(&self.db)
        .await?;

        let current = current.ok_or_else(|| {
            Error::NotFound(format!("label mapping ({}, {})", raw_label, industry))
        })?;
        if MappingStatus::parse(&current)? != MappingStatus::PendingReview {
            return Err(Error::InvalidTransition(format!(
                "mapping ({}, {}) is {}, only PENDING_REVIEW can be decided",
                raw_label, industry, current
            )));
        }

        let (status, normalized) = match decision {
            LabelDecision::Approve { normalized_label } => {
                // Target must be a canonical field; an override replaces the
                // suggestion, otherwise the stored suggestion stands.
                let target = match normalized_label {
                    Some(label) => label.clone(),
                    None => sqlx::query_scalar::<_, Option<String>>(
                        "SELECT normalized_label FROM label_mappings
                         WHERE raw_label = ? AND industry = ?",
                    )
                    .bind(raw_label)
                    .bind(industry)
                    .fetch_one(&self.db)
                    .await?
                    .ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "mapping ({}, {}) has no suggested field to approve",
                            raw_label, industry
                        ))
                    })?,
                };
                if field_category(&target).is_none() {
                    return Err(Error::InvalidInput(format!(
                        "'{}' is not a canonical field",
                        target
                    )));
                }
                (MappingStatus::Approved, Some(target))
            }
            LabelDecision::Reject => (MappingStatus::Rejected, None),
        };

        sqlx::query(
            "UPDATE label_mappings
             SET status = ?, normalized_label = COALESCE(?, normalized_label),
                 reviewed_by = ?, last_reviewed_at = ?
             WHERE raw_label = ? AND industry = ?",
        )
        .bind(status.as_str())
        .bind(&normalized)
        .bind(reviewer)
        .bind(Utc::now())
        .bind(raw_label)
        .bind(industry)
        .execute(&self.db)
        .await?;

        tracing::info!(raw_label, industry, status = status.as_str(), reviewer,
            "Label mapping decided");

        self.apply_pending().await
    }

    /// Application pass: re-normalize every document still waiting on label
    /// review. Documents whose labels are now all resolved flip out of
    /// PENDING_REVIEW; the rest stay parked.
    pub async fn apply_pending(&self) -> Result<usize> {
        let doc_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT doc_id FROM normalized_records WHERE label_review_status = 'PENDING_REVIEW'",
        )
        .fetch_all(&self.db)
        .await?;

        let normalizer = Normalizer::new(self.db.clone(), self.suggest_threshold);
        let count = doc_ids.len();
        for doc_id in doc_ids {
            normalizer.normalize(doc_id).await?;
        }
        if count > 0 {
            tracing::debug!(count, "Application pass re-normalized pending documents");
        }
        Ok(count)
    }

    /// Normalized records whose unit interpretation needs a human
    pub async fn pending_units(&self) -> Result<Vec<NormalizedRecordRow>> {
        let rows = sqlx::query_as(
            "SELECT * FROM normalized_records WHERE unit_review_status = 'PENDING_REVIEW'
             ORDER BY created_at",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// Decide a unit review. Approval marks the record's units trusted;
    /// rejection sends it back to PENDING until corrected source data
    /// arrives and the document is re-normalized.
    pub async fn decide_units(&self, doc_id: i64, approve: bool, reviewer: &str) -> Result<()> {
        let current: Option<String> = sqlx::query_scalar(
            "SELECT unit_review_status FROM normalized_records WHERE doc_id = ?",
        )
        .bind(doc_id)
        .fetch_optional(&self.db)
        .await?;

        let current =
            current.ok_or_else(|| Error::NotFound(format!("normalized record {}", doc_id)))?;
        if ReviewStatus::parse(&current)? != ReviewStatus::PendingReview {
            return Err(Error::InvalidTransition(format!(
                "unit review for doc {} is {}, only PENDING_REVIEW can be decided",
                doc_id, current
            )));
        }

        let status = if approve {
            ReviewStatus::Approved
        } else {
            ReviewStatus::Pending
        };
        sqlx::query("UPDATE normalized_records SET unit_review_status = ? WHERE doc_id = ?")
            .bind(status.as_str())
            .bind(doc_id)
            .execute(&self.db)
            .await?;

        tracing::info!(doc_id, status = status.as_str(), reviewer, "Unit review decided");
        Ok(())
    }
}
