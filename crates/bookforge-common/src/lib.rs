//! Bookforge-Common: shared types, constants, and utilities.
//!
//! This crate provides common functionality used across bookforge:
//!
//! - **Typed IDs**: Type-safe UUID wrappers for work items and fan-out groups
//! - **Core Types**: Conversion kinds, job statuses, job keys and completions
//! - **Failure Reasons**: The persisted `error_message` taxonomy for jobs
//! - **Configuration**: JSON-backed application settings
//! - **Error Handling**: Common error types and result aliases
//!
//! # Examples
//!
//! ```
//! use bookforge_common::{ConversionKind, JobKey, JobStatus};
//!
//! let key = JobKey::new("book.aax", ConversionKind::FullConvert);
//! assert_eq!(key.kind.as_str(), "full-convert");
//! assert!(JobStatus::Converting.is_active());
//! ```

pub mod config;
pub mod error;
pub mod failure;
pub mod ids;
pub mod types;

pub use error::{Error, Result};
pub use failure::JobFailure;
pub use ids::*;
pub use types::*;
