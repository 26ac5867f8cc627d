//! Database initialization
//!
//! **[QDP-DB-010]** Automatic database creation with the full set of pipeline
//! relations on first run. All migrations are idempotent
//! (`CREATE TABLE IF NOT EXISTS`), so startup is safe to repeat.
//!
//! The relations mirror the pipeline stages: ingestion ledger → raw assets →
//! parsed documents → normalized records → validation runs → reconciled
//! records → golden records, plus the label-mapping cache, escalation queue,
//! company master, and key/value settings.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL mode: concurrent readers with one writer, needed because pipeline
    // stages for independent entities run in parallel
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;
    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Create all pipeline relations (idempotent).
///
/// Also used directly by tests against an in-memory pool.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_companies_table(pool).await?;
    create_ingestion_jobs_table(pool).await?;
    create_raw_assets_table(pool).await?;
    create_job_asset_link_table(pool).await?;
    create_parsed_documents_table(pool).await?;
    create_normalized_records_table(pool).await?;
    create_label_mappings_table(pool).await?;
    create_validation_runs_table(pool).await?;
    create_reconciled_records_table(pool).await?;
    create_golden_records_table(pool).await?;
    create_golden_record_satellites_table(pool).await?;
    create_escalations_table(pool).await?;
    Ok(())
}

/// Create settings table (key/value ambient configuration)
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Company master: ticker directory with flattened industry classification.
/// Supplies the industry key for label mappings and the sector rule set.
async fn create_companies_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS companies (
            ticker TEXT PRIMARY KEY,
            company_name TEXT NOT NULL,
            industry TEXT NOT NULL,
            sector TEXT,
            listing_status TEXT NOT NULL DEFAULT 'LISTED'
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Ingestion job ledger: the manifest of expected fetches **[QDP-JL-010]**
///
/// The identity tuple is unique; jobs are never deleted (audit trail).
async fn create_ingestion_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_jobs (
            job_id TEXT PRIMARY KEY,
            ticker TEXT NOT NULL,
            fiscal_year INTEGER NOT NULL,
            quarter INTEGER NOT NULL,
            source_type TEXT NOT NULL,
            consolidation_status TEXT NOT NULL,
            script_version TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            failure_reason TEXT,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_attempted_at TIMESTAMP,
            UNIQUE(ticker, fiscal_year, quarter, source_type,
                   consolidation_status, script_version)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Content-addressed raw asset store **[QDP-AS-010]**
///
/// `content_hash` is the identity; `first_seen_at` is set exactly once by
/// the insert that wins the hash.
async fn create_raw_assets_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_assets (
            asset_id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_hash TEXT NOT NULL UNIQUE,
            source_type TEXT NOT NULL,
            storage_location TEXT,
            source_last_modified TIMESTAMP,
            content BLOB NOT NULL,
            first_seen_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Job → asset link: at most one asset per job, many jobs may share an asset
async fn create_job_asset_link_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_asset_link (
            job_id TEXT PRIMARY KEY REFERENCES ingestion_jobs(job_id),
            asset_id INTEGER NOT NULL REFERENCES raw_assets(asset_id),
            linked_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Parsed documents: structured raw facts per (asset, parser version)
/// **[QDP-PR-010]** The UNIQUE pair makes re-parsing idempotent.
async fn create_parsed_documents_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parsed_documents (
            doc_id INTEGER PRIMARY KEY AUTOINCREMENT,
            asset_id INTEGER NOT NULL REFERENCES raw_assets(asset_id),
            parser_version TEXT NOT NULL,
            parse_status TEXT NOT NULL,
            error_detail TEXT,
            content TEXT,
            parsed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(asset_id, parser_version)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Normalized records: canonical fields + satellite bag per parsed document,
/// with the three-phase review state **[QDP-NR-010]**
async fn create_normalized_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS normalized_records (
            doc_id INTEGER PRIMARY KEY REFERENCES parsed_documents(doc_id),
            ticker TEXT NOT NULL,
            fiscal_date DATE NOT NULL,
            source_type TEXT NOT NULL,
            canonical_fields TEXT NOT NULL DEFAULT '{}',
            satellite_facts TEXT NOT NULL DEFAULT '{}',
            statement_normalized INTEGER NOT NULL DEFAULT 0,
            unit_review_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (unit_review_status IN
                       ('PENDING','AUTO_APPROVED','PENDING_REVIEW','APPROVED')),
            label_review_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (label_review_status IN
                       ('PENDING','AUTO_APPROVED','PENDING_REVIEW','APPROVED')),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_normalized_ticker_date
         ON normalized_records(ticker, fiscal_date)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Label mapping cache: the system's long-term human-verified memory
/// **[QDP-NR-020]** Rows reach APPROVED only through the review surface.
async fn create_label_mappings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS label_mappings (
            raw_label TEXT NOT NULL,
            industry TEXT NOT NULL,
            normalized_label TEXT,
            status TEXT NOT NULL
                CHECK (status IN ('APPROVED','PENDING_REVIEW','REJECTED')),
            source_context TEXT,
            reviewed_by TEXT,
            last_reviewed_at TIMESTAMP,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (raw_label, industry)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Validation runs: the per-document state machine for the 5-stage quality
/// pipeline **[QDP-VE-010]**
async fn create_validation_runs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS validation_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            doc_id INTEGER NOT NULL UNIQUE REFERENCES normalized_records(doc_id),
            stage_1_status TEXT NOT NULL DEFAULT 'PENDING',
            stage_2_status TEXT NOT NULL DEFAULT 'PENDING',
            stage_3_status TEXT NOT NULL DEFAULT 'PENDING',
            stage_4_status TEXT NOT NULL DEFAULT 'PENDING',
            stage_5_status TEXT NOT NULL DEFAULT 'PENDING',
            stage_1_version TEXT,
            stage_2_version TEXT,
            stage_3_version TEXT,
            stage_4_version TEXT,
            stage_5_version TEXT,
            failure_reason TEXT,
            details TEXT,
            quality_score REAL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Reconciled records: one per (ticker, fiscal date), recomputed from
/// scratch whenever a new source arrives **[QDP-RC-010]**
async fn create_reconciled_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reconciled_records (
            ticker TEXT NOT NULL,
            fiscal_date DATE NOT NULL,
            fields TEXT NOT NULL DEFAULT '{}',
            risk_score REAL NOT NULL DEFAULT 0.0,
            source_count INTEGER NOT NULL DEFAULT 0,
            last_input_doc_id INTEGER NOT NULL DEFAULT 0,
            triage_state TEXT NOT NULL DEFAULT 'UNSCORED'
                CHECK (triage_state IN
                       ('UNSCORED','LOW_RISK','HIGH_RISK','ESCALATED',
                        'RESOLVED','UNRESOLVED','PROMOTED')),
            reconciled_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (ticker, fiscal_date)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Golden records: final, versioned, append-only fact table **[QDP-GR-010]**
///
/// A restatement inserts version N+1; existing versions are never updated.
async fn create_golden_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS golden_records (
            golden_id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticker TEXT NOT NULL,
            fiscal_date DATE NOT NULL,
            version INTEGER NOT NULL,
            source_type TEXT NOT NULL,
            primary_asset_id INTEGER REFERENCES raw_assets(asset_id),
            revenue REAL,
            operating_expenses REAL,
            ebitda REAL,
            net_income REAL,
            total_assets REAL,
            total_liabilities REAL,
            total_equity REAL,
            operating_cash_flow REAL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(ticker, fiscal_date, version)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Satellite bag: open-ended industry-specific facts, one-to-one with a
/// golden record
async fn create_golden_record_satellites_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS golden_record_satellites (
            golden_id INTEGER PRIMARY KEY REFERENCES golden_records(golden_id),
            kpi_data TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Escalation queue for the expensive-extraction tier **[QDP-TR-020]**
async fn create_escalations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS escalations (
            escalation_id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticker TEXT NOT NULL,
            fiscal_date DATE NOT NULL,
            reason TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (status IN ('PENDING','RESOLVED','ABANDONED')),
            requested_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            resolved_at TIMESTAMP,
            resolved_by TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Seed default settings (INSERT OR IGNORE, never overwrites operator edits)
///
/// Thresholds are configuration inputs with documented defaults, not
/// hardcoded constants.
pub async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    let defaults: &[(&str, &str)] = &[
        // Stage 2: relative tolerance for accounting identity checks
        ("identity_tolerance", "0.01"),
        // Stage 4: historical outlier detection
        ("outlier_sigma_threshold", "5.0"),
        ("outlier_window_periods", "8"),
        ("outlier_min_history", "6"),
        // Reconciliation: relative agreement tolerance across sources
        ("reconcile_tolerance", "0.05"),
        // Triage: risk scores below this cutoff are LOW_RISK
        ("risk_low_cutoff", "0.25"),
        // Normalization: Jaro-Winkler similarity needed to suggest a mapping
        ("label_suggest_threshold", "0.85"),
        // Ledger: FETCH_FAILED jobs beyond this count are not retried
        ("ingest_max_attempts", "3"),
        // HTTP listen port for qdp-qe
        ("qe_http_port", "5741"),
    ];

    for (key, value) in defaults {
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await?;
    }

    Ok(())
}
