//! End-to-end pipeline integration tests
//! Test File: pipeline_integration.rs
//! Requirements: QDP-AS-050 (Pipeline Sweep), QDP-RC-010 (Reconciliation),
//! QDP-TR-010 (Triage), QDP-GR-010 (Golden Versioning)

use std::collections::BTreeMap;

use qdp_common::db::models::SourceType;
use qdp_common::db::settings::QualityThresholds;
use qdp_qe::reconcile::{GoldenStore, Triage};
use qdp_qe::services::{AssetStore, ParserRunner, Pipeline, StructuredJsonParser};
use sqlx::SqlitePool;

async fn test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    qdp_common::db::create_schema(&pool).await.unwrap();
    sqlx::query(
        "INSERT INTO companies (ticker, company_name, industry)
         VALUES ('ACME', 'Acme Industries', 'MANUFACTURING')",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool
}

/// Q1 FY2025 filing with all required statement fields
fn filing(revenue: f64) -> String {
    format!(
        r#"{{"ticker": "ACME", "fiscal_year": 2025, "quarter": 1, "facts": {{
            "revenue": {{"value": {revenue}, "unit": "INR"}},
            "net_income": {{"value": 150.0, "unit": "INR"}},
            "total_assets": {{"value": 5000.0, "unit": "INR"}},
            "total_liabilities": {{"value": 3000.0, "unit": "INR"}},
            "total_equity": {{"value": 2000.0, "unit": "INR"}}
        }}}}"#
    )
}

async fn ingest(pool: &SqlitePool, source: SourceType, body: &str) {
    let store = AssetStore::new(pool.clone());
    let asset_id = store
        .put(body.as_bytes(), source, None, None)
        .await
        .unwrap()
        .asset_id();
    let asset = store.get(asset_id).await.unwrap();
    ParserRunner::new(pool.clone())
        .run(&asset, &StructuredJsonParser)
        .await
        .unwrap();
}

async fn triage_state(pool: &SqlitePool) -> String {
    sqlx::query_scalar("SELECT triage_state FROM reconciled_records WHERE ticker = 'ACME'")
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn golden_versions(pool: &SqlitePool) -> Vec<i64> {
    sqlx::query_scalar(
        "SELECT version FROM golden_records WHERE ticker = 'ACME' ORDER BY version",
    )
    .fetch_all(pool)
    .await
    .unwrap()
}

/// Two sources agree within tolerance: one sweep carries them to golden v1
/// with the precedence winner's value.
#[tokio::test]
async fn agreeing_sources_promote_version_one() {
    // Given: API and OCR filings 5% apart
    let pool = test_db().await;
    ingest(&pool, SourceType::ThirdPartyApi, &filing(1000.0)).await;
    ingest(&pool, SourceType::OcrExtracted, &filing(1040.0)).await;

    // When: one pipeline sweep runs
    let pipeline = Pipeline::new(pool.clone(), QualityThresholds::default());
    pipeline.run_once().await.unwrap();

    // Then: key is promoted at version 1, OCR value wins (higher currency
    // precedence)
    assert_eq!(triage_state(&pool).await, "PROMOTED");
    assert_eq!(golden_versions(&pool).await, vec![1]);
    let revenue: Option<f64> = sqlx::query_scalar(
        "SELECT revenue FROM golden_records WHERE ticker = 'ACME' AND version = 1",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(revenue, Some(1040.0));
}

/// A restating source beyond tolerance escalates instead of silently
/// overwriting, and no new golden version appears until resolution.
#[tokio::test]
async fn restatement_escalates_and_resolution_promotes_v2() {
    // Given: a promoted key from two agreeing sources
    let pool = test_db().await;
    ingest(&pool, SourceType::ThirdPartyApi, &filing(1000.0)).await;
    ingest(&pool, SourceType::OcrExtracted, &filing(1040.0)).await;
    let pipeline = Pipeline::new(pool.clone(), QualityThresholds::default());
    pipeline.run_once().await.unwrap();
    assert_eq!(golden_versions(&pool).await, vec![1]);

    // When: a structured filing restates revenue at 1300
    ingest(&pool, SourceType::StructuredFiling, &filing(1300.0)).await;
    pipeline.run_once().await.unwrap();

    // Then: the key escalates; v1 stands alone and untouched
    assert_eq!(triage_state(&pool).await, "ESCALATED");
    assert_eq!(golden_versions(&pool).await, vec![1]);
    let pending: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM escalations WHERE status = 'PENDING'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(pending, 1);

    // When: an analyst resolves with manually verified values
    let triage = Triage::new(pool.clone(), QualityThresholds::default());
    let escalation_id = triage.pending_escalations().await.unwrap()[0].escalation_id;
    let values: BTreeMap<String, f64> = [
        ("revenue".to_string(), 1300.0),
        ("net_income".to_string(), 150.0),
        ("total_assets".to_string(), 5000.0),
        ("total_liabilities".to_string(), 3000.0),
        ("total_equity".to_string(), 2000.0),
    ]
    .into();
    triage
        .resolve(escalation_id, &values, "analyst@qdp")
        .await
        .unwrap();

    // Then: the next sweep promotes version 2 with the verified value
    pipeline.run_once().await.unwrap();
    assert_eq!(golden_versions(&pool).await, vec![1, 2]);
    assert_eq!(triage_state(&pool).await, "PROMOTED");

    let (revenue, source): (Option<f64>, String) = sqlx::query_as(
        "SELECT revenue, source_type FROM golden_records
         WHERE ticker = 'ACME' AND version = 2",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(revenue, Some(1300.0));
    assert_eq!(source, "MANUALLY_VERIFIED");

    // And version 1 still carries its original value
    let v1: Option<f64> = sqlx::query_scalar(
        "SELECT revenue FROM golden_records WHERE ticker = 'ACME' AND version = 1",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(v1, Some(1040.0));
}

/// A resolution whose values fail the accounting identity must not close
/// the escalation; the disputed key stays out of the golden table.
#[tokio::test]
async fn failed_resolution_keeps_key_escalated_and_unpromoted() {
    let pool = test_db().await;
    ingest(&pool, SourceType::ThirdPartyApi, &filing(1000.0)).await;
    ingest(&pool, SourceType::OcrExtracted, &filing(1300.0)).await;

    let pipeline = Pipeline::new(pool.clone(), QualityThresholds::default());
    pipeline.run_once().await.unwrap();
    assert_eq!(triage_state(&pool).await, "ESCALATED");

    // Manual values with assets 5000 against liabilities + equity 2500
    let triage = Triage::new(pool.clone(), QualityThresholds::default());
    let escalation_id = triage.pending_escalations().await.unwrap()[0].escalation_id;
    let values: BTreeMap<String, f64> = [
        ("revenue".to_string(), 1300.0),
        ("net_income".to_string(), 150.0),
        ("total_assets".to_string(), 5000.0),
        ("total_liabilities".to_string(), 1500.0),
        ("total_equity".to_string(), 1000.0),
    ]
    .into();
    assert!(triage.resolve(escalation_id, &values, "analyst@qdp").await.is_err());

    // Further sweeps promote nothing; the dispute is still open
    pipeline.run_once().await.unwrap();
    assert_eq!(triage_state(&pool).await, "ESCALATED");
    assert_eq!(golden_versions(&pool).await, Vec::<i64>::new());
    let pending: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM escalations WHERE status = 'PENDING'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(pending, 1);
}

/// An unmapped label stays out of the canonical fields no matter how many
/// documents repeat it; only a review decision can move it.
#[tokio::test]
async fn unmapped_label_never_becomes_canonical() {
    let pool = test_db().await;
    for quarter in 1..=3 {
        let body = format!(
            r#"{{"ticker": "ACME", "fiscal_year": 2025, "quarter": {quarter}, "facts": {{
                "revenue": {{"value": 1000.0, "unit": "INR"}},
                "net_income": {{"value": 150.0, "unit": "INR"}},
                "total_assets": {{"value": 5000.0, "unit": "INR"}},
                "total_liabilities": {{"value": 3000.0, "unit": "INR"}},
                "total_equity": {{"value": 2000.0, "unit": "INR"}},
                "Mystery Metric": {{"value": 7.0, "unit": "INR"}}
            }}}}"#
        );
        ingest(&pool, SourceType::ThirdPartyApi, &body).await;
    }

    Pipeline::new(pool.clone(), QualityThresholds::default())
        .run_once()
        .await
        .unwrap();

    // Canonical fields never contain the unknown label, satellites always do
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT canonical_fields, satellite_facts FROM normalized_records")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(rows.len(), 3);
    for (canonical, satellites) in rows {
        assert!(!canonical.contains("Mystery Metric"));
        assert!(satellites.contains("Mystery Metric"));
    }

    // And no mapping row was invented for it (not similar to any canonical
    // field)
    let mappings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM label_mappings")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(mappings, 0);
}

/// Promotion from a resolved escalation uses the dedicated promote path as
/// well; version numbering is shared with sweep promotions.
#[tokio::test]
async fn direct_promote_after_resolution_continues_numbering() {
    let pool = test_db().await;
    ingest(&pool, SourceType::ThirdPartyApi, &filing(1000.0)).await;
    ingest(&pool, SourceType::OcrExtracted, &filing(1300.0)).await;

    let pipeline = Pipeline::new(pool.clone(), QualityThresholds::default());
    pipeline.run_once().await.unwrap();
    assert_eq!(triage_state(&pool).await, "ESCALATED");

    let triage = Triage::new(pool.clone(), QualityThresholds::default());
    let escalation_id = triage.pending_escalations().await.unwrap()[0].escalation_id;
    let values: BTreeMap<String, f64> = [
        ("revenue".to_string(), 1150.0),
        ("net_income".to_string(), 150.0),
        ("total_assets".to_string(), 5000.0),
        ("total_liabilities".to_string(), 3000.0),
        ("total_equity".to_string(), 2000.0),
    ]
    .into();
    triage
        .resolve(escalation_id, &values, "analyst@qdp")
        .await
        .unwrap();
    assert_eq!(triage_state(&pool).await, "RESOLVED");

    let store = GoldenStore::new(pool.clone(), QualityThresholds::default());
    let version = store
        .promote("ACME", chrono::NaiveDate::from_ymd_opt(2025, 6, 30).unwrap())
        .await
        .unwrap();
    assert_eq!(version, 1);
    assert_eq!(triage_state(&pool).await, "PROMOTED");
}
