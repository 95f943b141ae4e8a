//! Error types for refinery-core

use thiserror::Error;

/// Core error type for merge queue operations
#[derive(Debug, Error)]
pub enum Error {
    /// Referenced merge request does not exist
    #[error("merge request not found: {0}")]
    NotFound(String),

    /// An unexpired claim by another worker exists
    #[error("merge request {id} is already claimed by {holder}")]
    AlreadyClaimed {
        /// Merge request id
        id: String,
        /// Worker currently holding the lease
        holder: String,
    },

    /// I/O or serialization failure on the record store or event log
    #[error("storage error: {0}")]
    Storage(String),

    /// Version control tool failure unrelated to conflicts
    #[error("backend error: {0}")]
    Backend(String),

    /// Malformed configuration, fatal at startup
    #[error("config error: {0}")]
    Config(String),

    /// Issue tracker command failed
    #[error("tracker error: {0}")]
    Tracker(String),
}

impl Error {
    /// Exit code for CLI reporting.
    ///
    /// - 1: configuration or user error
    /// - 2: backend, tracker or storage failure
    /// - 3: not found
    /// - 4: lease contention
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Storage(_) | Self::Backend(_) | Self::Tracker(_) => 2,
            Self::NotFound(_) => 3,
            Self::AlreadyClaimed { .. } => 4,
        }
    }

    /// Whether retrying the same operation on a later cycle can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Backend(_) | Self::Tracker(_) | Self::AlreadyClaimed { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("malformed record: {err}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("failed to parse config: {err}"))
    }
}

/// Result type alias for refinery-core operations
pub type Result<T> = std::result::Result<T, Error>;
