//! Error types for bagcache
//!
//! This module defines the error taxonomy shared by the identity resolver,
//! the handle pool and configuration loading.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for bagcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for bagcache
#[derive(Debug, Error)]
pub enum Error {
    // Identity errors
    #[error("bag not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error(
        "ambiguous bag directory {}: expected exactly one data file, found {}",
        path.display(),
        candidates.len()
    )]
    AmbiguousBag {
        path: PathBuf,
        /// Candidate data files, sorted lexicographically
        candidates: Vec<PathBuf>,
    },

    // Resource lifecycle errors
    #[error("failed to open bag {}: {source}", path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to close bag {}: {source}", path.display())]
    CloseFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bag handle has been retired: {}", path.display())]
    Retired { path: PathBuf },

    // Ambient errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a retryable error
    ///
    /// Nothing in the cache is transient: a failed open is reported once and
    /// the caller decides what to do next.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        false
    }

    /// Path the error refers to, if any
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::NotFound { path }
            | Self::AmbiguousBag { path, .. }
            | Self::OpenFailed { path, .. }
            | Self::CloseFailed { path, .. }
            | Self::Retired { path } => Some(path),
            Self::Io(_) | Self::Configuration(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        let err = Error::NotFound {
            path: PathBuf::from("/data/run.mcap"),
        };
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "bag not found: /data/run.mcap");
    }

    #[test]
    fn test_error_ambiguous_message() {
        let err = Error::AmbiguousBag {
            path: PathBuf::from("/data/run"),
            candidates: vec![
                PathBuf::from("/data/run/a.db3"),
                PathBuf::from("/data/run/b.db3"),
            ],
        };
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("found 2"));
        assert_eq!(err.path(), Some(std::path::Path::new("/data/run")));
    }

    #[test]
    fn test_error_open_failed_keeps_source() {
        let err = Error::OpenFailed {
            path: PathBuf::from("/data/run.bag"),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "bad magic"),
        };
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("bad magic"));
    }

    #[test]
    fn test_error_without_path() {
        assert!(Error::configuration("max_open must be positive").path().is_none());
    }
}
