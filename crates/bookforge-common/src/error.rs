//! Unified error type for bookforge.
//!
//! All crates funnel their infrastructure failures into [`Error`]. Job-level
//! failure reasons that end up in a job record live in [`crate::JobFailure`]
//! instead; those are data, not control flow.

/// Unified error type covering infrastructure failure modes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation conflicts with the current state (e.g. shutdown in progress).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffmpeg, ffprobe) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Validation(format!("invalid JSON: {e}"))
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
