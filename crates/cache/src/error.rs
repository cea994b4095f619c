//! Error types for the analysis cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
///
/// None of these escape the public [`CacheManager`](crate::CacheManager)
/// surface; the manager logs them and degrades to a cache miss. They are
/// returned by the lower-level key strategies, storage codecs and settings
/// loader.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed: {}", path.display())]
    #[diagnostic(
        code(organizer::cache::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error
        path: Box<Path>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(organizer::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// The file a key was requested for does not exist
    #[error("File not found: {}", path.display())]
    #[diagnostic(
        code(organizer::cache::not_found),
        help("The file may have been moved or deleted since it was scanned")
    )]
    NotFound {
        /// The path that vanished
        path: Box<Path>,
    },

    /// The persisted cache document could not be decoded
    #[error("Corrupt cache document at {}: {message}", path.display())]
    #[diagnostic(
        code(organizer::cache::corrupt),
        help("The cache file will be replaced on the next save")
    )]
    CorruptStorage {
        /// Location of the unreadable document
        path: Box<Path>,
        /// Decoder message
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(organizer::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: path.as_ref().into(),
            operation: operation.into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(path: impl AsRef<Path>) -> Self {
        Self::NotFound {
            path: path.as_ref().into(),
        }
    }

    /// Create a corrupt storage error
    #[must_use]
    pub fn corrupt_storage(path: impl AsRef<Path>, msg: impl Into<String>) -> Self {
        Self::CorruptStorage {
            path: path.as_ref().into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Map a filesystem error, turning `ErrorKind::NotFound` into [`Error::NotFound`]
    #[must_use]
    pub(crate) fn from_fs(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::not_found(path)
        } else {
            Self::io(source, path, operation)
        }
    }

    /// Returns true if this error means the file is gone
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_fs_maps_not_found() {
        let err = Error::from_fs(
            std::io::Error::from(std::io::ErrorKind::NotFound),
            "/missing.wav",
            "metadata",
        );
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "File not found: /missing.wav");
    }

    #[test]
    fn from_fs_keeps_other_io_errors() {
        let err = Error::from_fs(
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            "/locked.wav",
            "open",
        );
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "I/O open failed: /locked.wav");
    }

    #[test]
    fn corrupt_storage_message_includes_path() {
        let err = Error::corrupt_storage("/cache/analysis.json", "expected value");
        assert!(err.to_string().contains("/cache/analysis.json"));
        assert!(err.to_string().contains("expected value"));
    }

    #[test]
    fn io_error_keeps_path_and_operation() {
        let err = Error::io(
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            "/cache/analysis.bin",
            "rename",
        );
        assert!(matches!(
            &err,
            Error::Io { path, operation, .. }
                if **path == *Path::new("/cache/analysis.bin") && operation == "rename"
        ));
        assert_eq!(err.to_string(), "I/O rename failed: /cache/analysis.bin");
    }
}
