//! Error types for lock managers
//!
//! `LockAlreadyTaken` and `UnlockNotPermitted` are the two ownership outcomes
//! every backend must report identically, so callers can swap the in-process
//! manager for a distributed one without changing their error handling.

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by `LockManager` implementations
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    /// A valid lock on the key is held under a different token
    #[error("lock '{key}' is already taken")]
    LockAlreadyTaken { key: String },

    /// Release was attempted with a token that does not own the lock
    #[error("unlock of '{key}' not permitted: token does not match the holder")]
    UnlockNotPermitted { key: String },

    /// The request was rejected before touching any lock state
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backing store could not be reached or answered with an error
    #[error("lock backend error: {0}")]
    Backend(#[source] BoxError),
}

impl LockError {
    pub fn already_taken(key: impl Into<String>) -> Self {
        Self::LockAlreadyTaken { key: key.into() }
    }

    pub fn unlock_not_permitted(key: impl Into<String>) -> Self {
        Self::UnlockNotPermitted { key: key.into() }
    }

    pub fn backend<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Backend(err.into())
    }

    /// True when another owner holds the lock; worth retrying later.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::LockAlreadyTaken { .. })
    }

    /// True when the caller presented the wrong token.
    pub fn is_ownership_violation(&self) -> bool {
        matches!(self, Self::UnlockNotPermitted { .. })
    }
}

/// Result alias for lock operations
pub type Result<T> = std::result::Result<T, LockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            LockError::already_taken("job-1").to_string(),
            "lock 'job-1' is already taken"
        );
        assert_eq!(
            LockError::unlock_not_permitted("job-1").to_string(),
            "unlock of 'job-1' not permitted: token does not match the holder"
        );
        assert_eq!(
            LockError::InvalidArgument("key must not be empty".to_string()).to_string(),
            "invalid argument: key must not be empty"
        );
    }

    #[test]
    fn test_classification() {
        assert!(LockError::already_taken("k").is_contention());
        assert!(!LockError::already_taken("k").is_ownership_violation());
        assert!(LockError::unlock_not_permitted("k").is_ownership_violation());
        assert!(!LockError::unlock_not_permitted("k").is_contention());
    }

    #[test]
    fn test_backend_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = LockError::backend(io);
        assert!(err.to_string().starts_with("lock backend error"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_converts_into_anyhow() {
        let err: anyhow::Error = LockError::already_taken("k").into();
        assert!(err.downcast_ref::<LockError>().is_some_and(LockError::is_contention));
    }
}
