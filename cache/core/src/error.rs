//! Error types for cache operations.

use std::fmt;

/// Errors that can occur during cache operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// No item slot available to store the item.
    OutOfMemory,

    /// The key is too long (max 250 bytes).
    KeyTooLong,

    /// The key is empty.
    EmptyKey,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::KeyTooLong => write!(f, "key too long (max 250 bytes)"),
            Self::EmptyKey => write!(f, "empty key"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", CacheError::OutOfMemory), "out of memory");
        assert_eq!(
            format!("{}", CacheError::KeyTooLong),
            "key too long (max 250 bytes)"
        );
        assert_eq!(format!("{}", CacheError::EmptyKey), "empty key");
    }

    #[test]
    fn test_error_is_error_trait() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<CacheError>();
    }
}
