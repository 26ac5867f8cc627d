//! Five-stage validation pipeline
//!
//! Stage order is fixed: shape, identity, sector, outlier, scoring. Each
//! stage carries a version constant; bumping a version resets that stage
//! and all later stages to PENDING on the next run (waterfall reset), so
//! improved checks re-apply to history without touching earlier results.

pub mod engine;
pub mod stages;

pub use engine::ValidationEngine;
