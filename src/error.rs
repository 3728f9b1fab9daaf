use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    /// Malformed descriptor or an invalid join graph. Raised while building
    /// the schema or planning a query, before anything reaches the database.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A value does not fit the operation it was given to.
    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl QueryError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        QueryError::Configuration(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        QueryError::Shape(msg.into())
    }
}
