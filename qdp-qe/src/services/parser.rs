//! Document Parser Layer
//!
//! **[QDP-PR-010]** Parsers are versioned, pluggable extractors that turn a
//! raw asset's bytes into labeled numeric facts. Results are keyed by
//! (asset_id, parser_version): re-running the same parser version over the
//! same asset is a no-op, while a bumped version produces a fresh parse
//! without disturbing the old one.
//!
//! **[QDP-PR-020]** A parse failure is recorded as an ERROR row with the
//! failure detail. It never aborts a batch; downstream stages simply see no
//! normalized record for that document.

use qdp_common::db::models::{ParseStatus, RawAssetRow};
use qdp_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};

/// One labeled numeric fact as extracted, before any normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFact {
    /// Label exactly as the source document spells it
    pub label: String,
    pub value: f64,
    /// Explicit unit if the source declared one (e.g. INR, INR_CRORE, PCT)
    pub unit: Option<String>,
}

/// Output of a successful parse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedContent {
    pub ticker: String,
    pub fiscal_year: i64,
    pub quarter: i64,
    pub facts: Vec<RawFact>,
}

/// A versioned document extractor
pub trait DocumentParser: Send + Sync {
    /// Version string stored with every parse this extractor produces
    fn parser_version(&self) -> &str;

    fn parse(&self, asset: &RawAssetRow) -> Result<ParsedContent>;
}

/// Result of running a parser over an asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutcome {
    pub doc_id: i64,
    pub status: ParseStatus,
    /// True when an existing OK parse was reused without re-running
    pub reused: bool,
}

/// Runs parsers and owns the `parsed_documents` relation
pub struct ParserRunner {
    db: Pool<Sqlite>,
}

impl ParserRunner {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// Run `parser` over `asset`, upserting on (asset_id, parser_version).
    ///
    /// An existing OK parse at the same version is returned as-is. An
    /// existing ERROR row is retried in place, so a fixed upstream asset or
    /// transient failure does not leave a permanently poisoned parse.
    pub async fn run(
        &self,
        asset: &RawAssetRow,
        parser: &dyn DocumentParser,
    ) -> Result<ParseOutcome> {
        let version = parser.parser_version();

        let existing: Option<(i64, String)> = sqlx::query_as(
            "SELECT doc_id, parse_status FROM parsed_documents
             WHERE asset_id = ? AND parser_version = ?",
        )
        .bind(asset.asset_id)
        .bind(version)
        .fetch_optional(&self.db)
        .await?;

        if let Some((doc_id, status)) = &existing {
            if ParseStatus::parse(status)? == ParseStatus::Ok {
                tracing::debug!(doc_id, asset_id = asset.asset_id, version,
                    "Parse already present at this version, skipping");
                return Ok(ParseOutcome {
                    doc_id: *doc_id,
                    status: ParseStatus::Ok,
                    reused: true,
                });
            }
        }

        let (status, content, error_detail) = match parser.parse(asset) {
            Ok(parsed) => {
                let json = serde_json::to_string(&parsed)
                    .map_err(|e| Error::Internal(format!("Serializing parse result: {}", e)))?;
                (ParseStatus::Ok, Some(json), None)
            }
            Err(e) => {
                tracing::warn!(asset_id = asset.asset_id, version, error = %e,
                    "Parse failed, recording ERROR document");
                (ParseStatus::Error, None, Some(e.to_string()))
            }
        };

        sqlx::query(
            r#"
            INSERT INTO parsed_documents (asset_id, parser_version, parse_status, error_detail, content)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(asset_id, parser_version) DO UPDATE SET
                parse_status = excluded.parse_status,
                error_detail = excluded.error_detail,
                content = excluded.content,
                parsed_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(asset.asset_id)
        .bind(version)
        .bind(status.as_str())
        .bind(&error_detail)
        .bind(&content)
        .execute(&self.db)
        .await?;

        let doc_id: i64 = sqlx::query_scalar(
            "SELECT doc_id FROM parsed_documents WHERE asset_id = ? AND parser_version = ?",
        )
        .bind(asset.asset_id)
        .bind(version)
        .fetch_one(&self.db)
        .await?;

        tracing::info!(doc_id, asset_id = asset.asset_id, version,
            status = status.as_str(), "Recorded parse");

        Ok(ParseOutcome {
            doc_id,
            status,
            reused: false,
        })
    }

    /// Load the facts of an OK parse
    pub async fn get_content(&self, doc_id: i64) -> Result<ParsedContent> {
        let row: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT parse_status, content FROM parsed_documents WHERE doc_id = ?",
        )
        .bind(doc_id)
        .fetch_optional(&self.db)
        .await?;

        let (status, content) =
            row.ok_or_else(|| Error::NotFound(format!("parsed document {}", doc_id)))?;

        if ParseStatus::parse(&status)? != ParseStatus::Ok {
            return Err(Error::InvalidInput(format!(
                "document {} has no usable parse (status {})",
                doc_id, status
            )));
        }

        let json = content
            .ok_or_else(|| Error::Internal(format!("OK parse {} missing content", doc_id)))?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Internal(format!("Corrupt parse content for doc {}: {}", doc_id, e)))
    }
}

#[derive(Debug, Deserialize)]
struct JsonFiling {
    ticker: String,
    fiscal_year: i64,
    quarter: i64,
    facts: serde_json::Map<String, serde_json::Value>,
}

/// Parser for structured JSON filings (third-party API and filing feeds)
pub struct StructuredJsonParser;

impl DocumentParser for StructuredJsonParser {
    fn parser_version(&self) -> &str {
        "json-1.0"
    }

    fn parse(&self, asset: &RawAssetRow) -> Result<ParsedContent> {
        let filing: JsonFiling = serde_json::from_slice(&asset.content)
            .map_err(|e| Error::InvalidInput(format!("Malformed JSON filing: {}", e)))?;

        if !(1..=4).contains(&filing.quarter) {
            return Err(Error::InvalidInput(format!(
                "Invalid quarter in filing: {}",
                filing.quarter
            )));
        }

        let mut facts = Vec::with_capacity(filing.facts.len());
        for (label, value) in &filing.facts {
            // A fact is either a bare number or {"value": n, "unit": "..."}
            let (value, unit) = match value {
                serde_json::Value::Object(obj) => {
                    let v = obj.get("value").and_then(|v| v.as_f64()).ok_or_else(|| {
                        Error::InvalidInput(format!("Fact '{}' missing numeric value", label))
                    })?;
                    let u = obj.get("unit").and_then(|u| u.as_str()).map(String::from);
                    (v, u)
                }
                other => {
                    let v = other.as_f64().ok_or_else(|| {
                        Error::InvalidInput(format!("Non-numeric value for fact '{}'", label))
                    })?;
                    (v, None)
                }
            };
            facts.push(RawFact {
                label: label.clone(),
                value,
                unit,
            });
        }

        Ok(ParsedContent {
            ticker: filing.ticker,
            fiscal_year: filing.fiscal_year,
            quarter: filing.quarter,
            facts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::asset_store::AssetStore;
    use qdp_common::db::models::SourceType;
    use sqlx::SqlitePool;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        qdp_common::db::create_schema(&pool).await.unwrap();
        pool
    }

    async fn stored_asset(pool: &SqlitePool, bytes: &[u8]) -> RawAssetRow {
        let store = AssetStore::new(pool.clone());
        let id = store
            .put(bytes, SourceType::ThirdPartyApi, None, None)
            .await
            .unwrap()
            .asset_id();
        store.get(id).await.unwrap()
    }

    const GOOD_FILING: &[u8] = br#"{
        "ticker": "ACME",
        "fiscal_year": 2025,
        "quarter": 1,
        "facts": {"Revenue from Operations": 1000.0, "Net Profit": 150.0}
    }"#;

    #[tokio::test]
    async fn test_parse_and_reuse_at_same_version() {
        let pool = setup_test_db().await;
        let runner = ParserRunner::new(pool.clone());
        let asset = stored_asset(&pool, GOOD_FILING).await;

        let first = runner.run(&asset, &StructuredJsonParser).await.unwrap();
        assert_eq!(first.status, ParseStatus::Ok);
        assert!(!first.reused);

        let second = runner.run(&asset, &StructuredJsonParser).await.unwrap();
        assert_eq!(second.doc_id, first.doc_id);
        assert!(second.reused);

        let content = runner.get_content(first.doc_id).await.unwrap();
        assert_eq!(content.ticker, "ACME");
        assert_eq!(content.facts.len(), 2);
    }

    #[tokio::test]
    async fn test_version_bump_creates_new_parse() {
        struct V2;
        impl DocumentParser for V2 {
            fn parser_version(&self) -> &str {
                "json-2.0"
            }
            fn parse(&self, asset: &RawAssetRow) -> Result<ParsedContent> {
                StructuredJsonParser.parse(asset)
            }
        }

        let pool = setup_test_db().await;
        let runner = ParserRunner::new(pool.clone());
        let asset = stored_asset(&pool, GOOD_FILING).await;

        let v1 = runner.run(&asset, &StructuredJsonParser).await.unwrap();
        let v2 = runner.run(&asset, &V2).await.unwrap();
        assert_ne!(v1.doc_id, v2.doc_id);

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM parsed_documents WHERE asset_id = ?")
                .bind(asset.asset_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_parse_failure_recorded_and_retryable() {
        let pool = setup_test_db().await;
        let runner = ParserRunner::new(pool.clone());
        let asset = stored_asset(&pool, b"not json at all").await;

        let outcome = runner.run(&asset, &StructuredJsonParser).await.unwrap();
        assert_eq!(outcome.status, ParseStatus::Error);

        let detail: Option<String> =
            sqlx::query_scalar("SELECT error_detail FROM parsed_documents WHERE doc_id = ?")
                .bind(outcome.doc_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(detail.unwrap().contains("Malformed JSON"));

        // An ERROR row is retried in place, not skipped
        let retry = runner.run(&asset, &StructuredJsonParser).await.unwrap();
        assert_eq!(retry.doc_id, outcome.doc_id);
        assert!(!retry.reused);

        // And its content is not loadable
        assert!(runner.get_content(outcome.doc_id).await.is_err());
    }
}
