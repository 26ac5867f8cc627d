//! HTTP API handlers for qdp-qe
//!
//! **[QDP-API-010]** Review and observability surface over the quality
//! engine: health, the read-side overview projection, the label and unit
//! review queues, and the escalation queue.

pub mod escalations;
pub mod health;
pub mod overview;
pub mod review;

pub use escalations::escalation_routes;
pub use health::health_routes;
pub use overview::overview_routes;
pub use review::review_routes;
