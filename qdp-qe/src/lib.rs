//! qdp-qe library interface
//!
//! Exposes the quality engine's services and API surface for integration
//! testing.

pub mod api;
pub mod error;
pub mod reconcile;
pub mod services;
pub mod validation;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool **[QDP-DB-010]**
    pub db: SqlitePool,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::overview_routes())
        .merge(api::review_routes())
        .merge(api::escalation_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
