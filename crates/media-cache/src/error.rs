use reqwest::StatusCode;
use std::io;
use std::sync::Arc;

/// Errors produced by the media cache.
///
/// The type is `Clone` because a single negotiation outcome is handed to
/// every caller waiting on the same download.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CacheError {
    #[error("Server returned status code {0}")]
    Status(StatusCode),

    #[error("Server did not send a content length")]
    MissingContentLength,

    #[error("Resource of {0} bytes is too large to be cached")]
    TooLarge(u64),

    #[error("Resource changed upstream: expected {expected} bytes, server reports {actual}")]
    ResourceChanged { expected: u64, actual: u64 },

    #[error("Waiting for data was interrupted: {0}")]
    Interrupted(String),

    #[error("Network error: {source}")]
    Network {
        #[from]
        source: Arc<reqwest::Error>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: Arc<io::Error>,
    },

    #[error("Invalid URL: {0}")]
    Url(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Whether the failure belongs to a single download attempt and may
    /// succeed when the resource is accessed again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Status(_)
                | CacheError::MissingContentLength
                | CacheError::ResourceChanged { .. }
                | CacheError::Interrupted(_)
                | CacheError::Network { .. }
        )
    }
}

// Manual conversions because of the Arc wrapping.
impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Network {
            source: Arc::new(err),
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Io {
            source: Arc::new(err),
        }
    }
}

impl From<CacheError> for io::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Io { source } => match Arc::try_unwrap(source) {
                Ok(inner) => inner,
                Err(shared) => io::Error::new(shared.kind(), shared.to_string()),
            },
            CacheError::Interrupted(_) => io::Error::new(io::ErrorKind::Interrupted, err),
            CacheError::Status(StatusCode::NOT_FOUND) => io::Error::new(io::ErrorKind::NotFound, err),
            CacheError::Status(StatusCode::FORBIDDEN) => {
                io::Error::new(io::ErrorKind::PermissionDenied, err)
            }
            other => io::Error::other(other),
        }
    }
}

/// Result of a cache operation
pub type CacheResult<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let err: io::Error = CacheError::Interrupted("entry reset".into()).into();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);

        let err: io::Error = CacheError::Status(StatusCode::NOT_FOUND).into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let err: io::Error = CacheError::MissingContentLength.into();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn test_io_error_roundtrips_kind() {
        let original = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let err: io::Error = CacheError::from(original).into();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_retryable() {
        assert!(CacheError::Status(StatusCode::NOT_FOUND).is_retryable());
        assert!(CacheError::Interrupted("x".into()).is_retryable());
        assert!(!CacheError::TooLarge(u64::MAX).is_retryable());
        assert!(!CacheError::Config("bad".into()).is_retryable());
    }
}
