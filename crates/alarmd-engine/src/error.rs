/// Errors raised inside the engine.
///
/// Collaborator traits return `anyhow::Result` so that any backend can plug
/// in; those errors are carried through [`EngineError::Collaborator`].
///
/// # Examples
///
/// ```rust
/// use alarmd_engine::error::EngineError;
///
/// let err = EngineError::InvalidTimeString("5weeks".to_string());
/// assert!(err.to_string().contains("5weeks"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A duration string such as `"5min"` could not be parsed.
    #[error("Engine: invalid time string '{0}'")]
    InvalidTimeString(String),

    /// The in-memory aggregation database failed.
    #[error("Engine: aggregation error: {0}")]
    Aggregation(#[from] rusqlite::Error),

    #[error("Engine: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An alert vanished between listing and locking.
    #[error("Engine: alert not found (id={0})")]
    AlertNotFound(String),

    /// Failure reported by a store, event source or strategy source.
    #[error("Engine: {0}")]
    Collaborator(#[from] anyhow::Error),
}

/// Convenience `Result` alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
