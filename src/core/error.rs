use crate::client::upstream::UpstreamError;
use thiserror::Error;

/// Centralized error types for the application
///
/// All errors in the application are converted to this enum for consistent
/// error handling. Uses `thiserror` for automatic conversion and display
/// formatting.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database connection pool errors
    #[error("Database pool error: {0}")]
    DatabasePool(#[from] r2d2::Error),

    /// Upstream messaging service errors
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// ZIP packaging errors
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// User supplied bad parameters; surfaced as 4xx, no state change
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The stored credentials for a user are no longer valid
    #[error("Authentication required")]
    AuthRequired,

    /// Anyhow errors (for general error handling)
    #[error("Application error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Returns the error category used in log lines and API responses.
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Database(_) | AppError::DatabasePool(_) => "database",
            AppError::Upstream(_) => "upstream",
            AppError::Io(_) => "io",
            AppError::Json(_) => "serialization",
            AppError::Zip(_) => "archive",
            AppError::InvalidInput(_) => "validation",
            AppError::AuthRequired => "auth",
            AppError::Anyhow(_) => "other",
        }
    }

    /// True when the caller should be routed to re-authentication.
    pub fn is_auth_expired(&self) -> bool {
        matches!(
            self,
            AppError::AuthRequired | AppError::Upstream(UpstreamError::AuthKeyUnregistered)
        )
    }
}
