//! Crate-level error type.
//!
//! Every fallible write path returns [`StoreResult`].  Read paths on
//! [`crate::PatternStore`] swallow these after logging and hand back an empty
//! value instead.

use thiserror::Error;

/// Errors surfaced by the pattern store and its backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Caller input failed validation (empty key, out-of-range score, ...).
    #[error("invalid input: {0}")]
    Validation(String),

    /// The anonymization check still found sensitive content after
    /// sanitizing.  Deliberately carries no payload.
    #[error("payload rejected by anonymization check ({matcher})")]
    Rejected { matcher: &'static str },

    #[error("no pattern '{pattern_type}' stored for {repo}")]
    NotFound { repo: String, pattern_type: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database stayed locked through every retry attempt.
    #[error("database locked after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("redis error: {0}")]
    Redis(String),

    /// The configured backend cannot be reached or was compiled out.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Shorthand for building a validation error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }

    /// Returns `true` for caller mistakes, as opposed to storage faults.
    pub fn is_validation(&self) -> bool {
        matches!(self, StoreError::Validation(_) | StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_message_names_matcher_only() {
        let e = StoreError::Rejected { matcher: "email" };
        assert_eq!(e.to_string(), "payload rejected by anonymization check (email)");
    }

    #[test]
    fn test_is_validation() {
        assert!(StoreError::invalid("x").is_validation());
        assert!(StoreError::NotFound { repo: "/r".into(), pattern_type: "t".into() }.is_validation());
        assert!(!StoreError::Redis("down".into()).is_validation());
    }

    #[test]
    fn test_json_error_converts() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let e: StoreError = err.into();
        assert!(matches!(e, StoreError::Json(_)));
    }
}
