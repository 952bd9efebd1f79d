use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when interacting with the strand store.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The strand does not exist (never created, reaped, or self-deleted).
    #[error("Strand not found: {id}")]
    StrandNotFound {
        /// The id that was looked up.
        id: Uuid,
    },

    /// The page does not exist.
    #[error("Page not found: {id}")]
    PageNotFound {
        /// The id that was looked up.
        id: Uuid,
    },

    /// A row with this id already exists.
    #[error("Strand already exists: {id}")]
    AlreadyExists {
        /// The conflicting id.
        id: Uuid,
    },

    /// A conditional update guarded by a lease token matched no row.
    /// The lease expired or was taken over by another worker.
    #[error("Lease mismatch for strand: {id}")]
    LeaseMismatch {
        /// The strand whose lease no longer matches.
        id: Uuid,
    },

    /// Attempted to transition a strand that already exited.
    #[error("Strand {id} is terminal and cannot transition")]
    Terminal {
        /// The terminal strand.
        id: Uuid,
    },

    /// Failed to connect to the database.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Failed to serialize or deserialize a stack, frame or value.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid or unsupported configuration.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Catch-all for other database errors.
    #[error("Database error: {0}")]
    Database(String),
}

impl StorageError {
    /// Returns a helpful suggestion for resolving this error.
    #[must_use]
    pub const fn suggestion(&self) -> &'static str {
        match self {
            Self::StrandNotFound { .. } => {
                "The strand may have completed and been reaped, or never existed. \
                 Check the id with: skein list"
            }
            Self::PageNotFound { .. } => {
                "The page id is unknown. List pages with: skein pages list --all"
            }
            Self::AlreadyExists { .. } => {
                "A strand with this id already exists. Strand ids are usually the id \
                 of the resource they manage, so only one workflow may own it at a time."
            }
            Self::LeaseMismatch { .. } => {
                "The lease expired while the strand was executing and another worker \
                 took it over. Labels must finish well within the lease TTL; split \
                 long-running steps into several labels."
            }
            Self::Terminal { .. } => {
                "The strand already exited. Only reaping may touch a terminal strand."
            }
            Self::ConnectionError(_) => {
                "Check that DATABASE_URL is correct and the database is reachable. \
                 For local development, ensure Postgres is started \
                 (e.g., docker compose up -d)."
            }
            Self::SerializationError(_) => {
                "A stored stack or value could not be decoded. This usually \
                 indicates a payload schema mismatch between prog versions."
            }
            Self::ConfigurationError(_) => {
                "Check your configuration settings with: skein config validate"
            }
            Self::Database(_) => {
                "An unexpected database error occurred. Check the error message for \
                 details and verify the schema is up to date."
            }
        }
    }

    /// Returns a richly formatted error message with context and suggestions.
    #[must_use]
    pub fn display_rich(&self) -> String {
        format!("Error: {}\n\nSuggestion:\n  {}", self, self.suggestion())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(e) => Self::ConnectionError(e.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Self::ConnectionError(err.to_string())
            }
            sqlx::Error::Configuration(e) => Self::ConfigurationError(e.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::SerializationError(err.to_string())
            }
            other => Self::Database(other.to_string()),
        }
    }
}
