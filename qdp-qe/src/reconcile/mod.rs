//! Cross-source reconciliation, triage, and golden record promotion
//!
//! The write path ends here: independent source records for the same
//! (ticker, fiscal date) are merged by precedence, scored for disagreement
//! risk, routed through the triage state machine, and finally promoted into
//! the append-only golden fact table.

pub mod golden;
pub mod reconciler;
pub mod triage;

pub use golden::GoldenStore;
pub use reconciler::Reconciler;
pub use triage::Triage;
