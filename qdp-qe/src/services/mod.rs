//! Quality engine services
//!
//! Each service owns one stage of the ingestion pipeline, from raw bytes
//! through normalization and review. Validation, reconciliation, and golden
//! record promotion live in their own top-level modules.

pub mod asset_store;
pub mod job_ledger;
pub mod normalizer;
pub mod parser;
pub mod pipeline;
pub mod review_queue;

pub use asset_store::{AssetStore, PutOutcome};
pub use job_ledger::{AttemptOutcome, JobIdentity, JobLedger};
pub use normalizer::{NormalizationOutcome, Normalizer};
pub use parser::{DocumentParser, ParsedContent, ParserRunner, RawFact, StructuredJsonParser};
pub use pipeline::Pipeline;
pub use review_queue::ReviewQueue;
