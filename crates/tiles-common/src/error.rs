//! Error types shared across the tile services.

use thiserror::Error;

/// Result type alias using TileError.
pub type TileResult<T> = Result<T, TileError>;

/// Primary error type for tile, cube and query operations.
#[derive(Debug, Error)]
pub enum TileError {
    // === Request errors ===
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    // === Collaborator errors ===
    #[error("Upstream service error: {0}")]
    Upstream(String),

    #[error("Rendering failed: {0}")]
    Render(String),

    #[error("Database error: {0}")]
    Database(String),

    // === Storage errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cache error: {0}")]
    Cache(String),

    // === Infrastructure errors ===
    #[error("Request timeout")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TileError {
    /// Numeric error code embedded in the JSON error envelope.
    pub fn error_code(&self) -> u32 {
        match self {
            TileError::Validation(_) => 2,
            TileError::NotFound(_) => 85,
            TileError::Upstream(_) => 3,
            TileError::Render(_) => 5,
            _ => 100,
        }
    }

    /// HTTP status for the error envelope.
    ///
    /// Mutation endpoints surface every client-visible failure as 400 with
    /// a message and code; only infrastructure failures become 5xx.
    pub fn http_status(&self) -> u16 {
        match self {
            TileError::Validation(_)
            | TileError::NotFound(_)
            | TileError::Upstream(_)
            | TileError::Render(_) => 400,
            TileError::Timeout => 504,
            _ => 500,
        }
    }
}

impl From<std::io::Error> for TileError {
    fn from(err: std::io::Error) -> Self {
        TileError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for TileError {
    fn from(err: serde_json::Error) -> Self {
        TileError::Internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TileError::Validation("x".into()).http_status(), 400);
        assert_eq!(TileError::NotFound("x".into()).http_status(), 400);
        assert_eq!(TileError::Cache("x".into()).http_status(), 500);
        assert_eq!(TileError::Timeout.http_status(), 504);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TileError::Validation("x".into()).error_code(), 2);
        assert_eq!(TileError::NotFound("x".into()).error_code(), 85);
    }
}
