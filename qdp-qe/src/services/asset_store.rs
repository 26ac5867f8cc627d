//! Content-Addressable Asset Store
//!
//! **[QDP-AS-010]** Raw ingested documents are deduplicated by the SHA-256
//! of their byte content. Submitting the same bytes twice returns the
//! existing asset identity; storage holds exactly one copy and
//! `first_seen_at` is set exactly once, by whichever insert won the hash.

use chrono::{DateTime, Utc};
use qdp_common::db::models::{RawAssetRow, SourceType};
use qdp_common::hashing::content_hash;
use qdp_common::{Error, Result};
use sqlx::{Pool, Sqlite};

/// Outcome of an asset store put
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// First time this content was seen
    Created { asset_id: i64 },
    /// Identical content already stored; no duplicate bytes written
    Deduplicated { asset_id: i64 },
}

impl PutOutcome {
    pub fn asset_id(&self) -> i64 {
        match self {
            PutOutcome::Created { asset_id } | PutOutcome::Deduplicated { asset_id } => *asset_id,
        }
    }
}

/// Content-addressable asset store over the `raw_assets` relation
pub struct AssetStore {
    db: Pool<Sqlite>,
}

impl AssetStore {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// Store a raw document, deduplicating on content hash.
    ///
    /// **Algorithm:**
    /// 1. Compute SHA-256 over the raw bytes
    /// 2. `INSERT .. ON CONFLICT(content_hash) DO NOTHING`
    /// 3. Select the surviving row id; report created vs deduplicated
    ///
    /// Concurrent puts of the same bytes converge on one row; the conflict
    /// clause makes the insert side idempotent.
    pub async fn put(
        &self,
        raw_bytes: &[u8],
        source_type: SourceType,
        storage_hint: Option<&str>,
        source_last_modified: Option<DateTime<Utc>>,
    ) -> Result<PutOutcome> {
        let hash = content_hash(raw_bytes);

        let inserted = sqlx::query(
            r#"
            INSERT INTO raw_assets
                (content_hash, source_type, storage_location, source_last_modified, content)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO NOTHING
            "#,
        )
        .bind(&hash)
        .bind(source_type.as_str())
        .bind(storage_hint)
        .bind(source_last_modified)
        .bind(raw_bytes)
        .execute(&self.db)
        .await?;

        let asset_id: i64 =
            sqlx::query_scalar("SELECT asset_id FROM raw_assets WHERE content_hash = ?")
                .bind(&hash)
                .fetch_one(&self.db)
                .await?;

        if inserted.rows_affected() == 1 {
            tracing::debug!(asset_id, hash = %hash, "Stored new raw asset");
            Ok(PutOutcome::Created { asset_id })
        } else {
            tracing::debug!(asset_id, hash = %hash, "Duplicate content, reusing asset");
            Ok(PutOutcome::Deduplicated { asset_id })
        }
    }

    /// Fetch an asset by id; NotFound if absent.
    pub async fn get(&self, asset_id: i64) -> Result<RawAssetRow> {
        let row: Option<RawAssetRow> =
            sqlx::query_as("SELECT * FROM raw_assets WHERE asset_id = ?")
                .bind(asset_id)
                .fetch_optional(&self.db)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("asset {}", asset_id)))
    }

    /// Fetch an asset by content hash, if present.
    pub async fn get_by_hash(&self, hash: &str) -> Result<Option<RawAssetRow>> {
        let row: Option<RawAssetRow> =
            sqlx::query_as("SELECT * FROM raw_assets WHERE content_hash = ?")
                .bind(hash)
                .fetch_optional(&self.db)
                .await?;
        Ok(row)
    }
}
