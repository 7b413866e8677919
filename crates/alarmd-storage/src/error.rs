/// Errors that can occur within the storage layer.
///
/// The engine's collaborator traits return `anyhow::Result`; the helpers in
/// this crate return [`Result`] and are converted at the trait boundary.
///
/// # Examples
///
/// ```rust
/// use alarmd_storage::error::StorageError;
///
/// let err = StorageError::NotFound {
///     entity: "alert",
///     id: "ALERT-42".to_string(),
/// };
/// assert!(err.to_string().contains("alert"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A required record was not found in the database.
    #[error("Storage: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: String },

    /// An underlying database error.
    #[error("Storage: database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// JSON serialization or deserialization failure (labels, rules, teams).
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A column held a value the domain type does not accept.
    #[error("Storage: invalid value {value:?} in column '{column}'")]
    InvalidValue { column: &'static str, value: String },

    #[error("Storage: {0}")]
    Other(#[from] anyhow::Error),
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
