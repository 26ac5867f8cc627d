//! Database access layer
//!
//! Initialization, pipeline relations, settings access, and row models.

pub mod init;
pub mod models;
pub mod settings;

pub use init::{create_schema, init_database};
