//! bookforge-db: persistence layer.
//!
//! SQLite-backed storage with connection pooling, embedded migrations, typed
//! row models, and query modules for conversion job records and the
//! distributed fan-out queue.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
