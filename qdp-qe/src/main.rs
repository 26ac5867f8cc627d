//! qdp-qe - Quality Engine service
//!
//! **Module Identity:**
//! - Name: qdp-qe (Quality Engine)
//! - Default port: 5741
//!
//! **[QDP-AS-010]** Owns the tiered ingestion pipeline: raw asset intake,
//! parsing, normalization with human-in-the-loop review, five-stage
//! validation, cross-source reconciliation, and golden record promotion.
//! External fetchers deliver documents against the job ledger; this service
//! does everything after the bytes arrive.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use qdp_common::db::settings::{get_http_port, QualityThresholds};
use qdp_qe::services::Pipeline;
use qdp_qe::AppState;

#[derive(Parser, Debug)]
#[command(name = "qdp-qe", about = "Quant Data Platform quality engine")]
struct Args {
    /// Root folder holding the database (overrides env and config file)
    #[arg(long)]
    root_folder: Option<String>,

    /// Seconds between pipeline sweeps
    #[arg(long, default_value_t = 30)]
    sweep_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    info!("Starting qdp-qe (Quality Engine) service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let toml_config = qdp_common::config::TomlConfig::load();
    let root_folder =
        qdp_common::config::resolve_root_folder(args.root_folder.as_deref(), &toml_config);
    let db_path = qdp_common::config::database_path(&root_folder)?;
    info!("Database: {}", db_path.display());

    let db_pool = qdp_common::db::init_database(&db_path).await?;
    info!("Database connection established");

    let port = match toml_config.port {
        Some(port) => port,
        None => get_http_port(&db_pool).await?,
    };

    // Background sweep: advances normalization, validation, reconciliation,
    // triage, and promotion for whatever work is pending
    let sweep_db = db_pool.clone();
    let sweep_interval = Duration::from_secs(args.sweep_interval.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let thresholds = match QualityThresholds::load(&sweep_db).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to load thresholds, skipping sweep");
                    continue;
                }
            };
            if let Err(e) = Pipeline::new(sweep_db.clone(), thresholds).run_once().await {
                tracing::error!(error = %e, "Pipeline sweep failed");
            }
        }
    });

    let state = AppState::new(db_pool);
    let app = qdp_qe::build_router(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!("Listening on http://127.0.0.1:{}", port);
    info!("Health check: http://127.0.0.1:{}/health", port);

    axum::serve(listener, app).await?;

    Ok(())
}
