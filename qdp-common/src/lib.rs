//! # QDP Common Library
//!
//! Shared code for the QDP data-platform services including:
//! - Database initialization and pipeline relations
//! - Domain enums and row models
//! - Settings access and quality thresholds
//! - Configuration loading
//! - Content hashing utilities

pub mod config;
pub mod db;
pub mod error;
pub mod hashing;

pub use error::{Error, Result};
