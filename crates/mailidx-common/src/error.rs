//! Error types for mailidx

use thiserror::Error;

/// Main error type for mailidx
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The physical index could not be created or opened.
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    /// The backend rejected a document write.
    #[error("Register error: {0}")]
    Register(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Old-flag lookup outside of a rebuild that found a prior index.
    #[error("No old index available")]
    NoOldIndex,

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Too many clients")]
    TooManyClients,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for mailidx
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::IndexUnavailable(_) => "INDEX_UNAVAILABLE",
            Error::Register(_) => "REGISTER_ERROR",
            Error::NotImplemented(_) => "NOT_IMPLEMENTED",
            Error::NoOldIndex => "NO_OLD_INDEX",
            Error::InvalidQuery(_) => "INVALID_QUERY",
            Error::TooManyClients => "TOO_MANY_CLIENTS",
            Error::Cancelled => "CANCELLED",
            Error::Protocol(_) => "PROTOCOL_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this is the expected outcome of a shutdown cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
