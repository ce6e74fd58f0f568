//! Bookforge - audiobook conversion job orchestration
//!
//! This library crate exposes the job engine and the audiobook job bodies
//! for the CLI and for integration testing.

pub mod app;
pub mod conversion;
pub mod jobs;
