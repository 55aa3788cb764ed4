use thiserror::Error;

/// Errors from repository and artifact store adapters.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// A write-once key already exists, or a conditional update lost.
    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Conflict("acme/run/outline/output".to_string());
        assert_eq!(err.to_string(), "conflict: acme/run/outline/output");
        assert_eq!(RepositoryError::NotFound.to_string(), "entity not found");
    }
}
