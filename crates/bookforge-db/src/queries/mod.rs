//! Database query modules.

pub mod conversion_jobs;
pub mod fanout;
