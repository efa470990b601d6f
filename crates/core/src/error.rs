//! Error taxonomy shared by all strata crates
//!
//! Lookup misses are not errors: operations return `Ok(None)` for a
//! legitimate absence and reserve `Err` for I/O failures, corrupt persisted
//! state, and invariant violations.

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the storage layer
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during a storage operation
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(strata::io),
        help("Check file permissions and ensure the build root is writable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "rename", "link")
        operation: String,
    },

    /// A persisted structure failed to parse or references absent objects
    #[error("corrupt entry: {what}{}", path.as_ref().map_or(String::new(), |p| format!(" ({})", p.display())))]
    #[diagnostic(
        code(strata::corrupt),
        help("The entry is treated as absent; it may be dropped and recomputed")
    )]
    Corrupt {
        /// Description of the corruption
        what: String,
        /// Path of the corrupt entry, if available
        path: Option<Box<Path>>,
    },

    /// A store request would break recursive satisfiability or symlink rules
    #[error("invariant violation: {message}")]
    #[diagnostic(code(strata::invariant))]
    InvariantViolation {
        /// Description of the violated invariant
        message: String,
    },

    /// A call crossed hash protocols without going through the rehash bridge
    #[error("hash protocol mismatch: expected {expected}, got {actual}")]
    #[diagnostic(
        code(strata::protocol_mismatch),
        help("Digests from one protocol must be rehashed before use in the other")
    )]
    ProtocolMismatch {
        /// Protocol the storage is configured for
        expected: String,
        /// Protocol carried by the offending digest
        actual: String,
    },

    /// Invalid digest hash string
    #[error("invalid digest: {message}")]
    #[diagnostic(code(strata::invalid_digest))]
    InvalidDigest {
        /// Description of the malformed hash
        message: String,
    },

    /// Serialization or deserialization of a persisted descriptor failed
    #[error("serialization error: {message}")]
    #[diagnostic(code(strata::serialization))]
    Serialization {
        /// Description of the serialization issue
        message: String,
    },

    /// Advisory lock acquisition or release failed
    #[error("lock {operation} failed: {}", path.display())]
    #[diagnostic(
        code(strata::lock),
        help("Another process may hold the build root in an unexpected state")
    )]
    Lock {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path of the lock file
        path: Box<Path>,
        /// Operation that failed ("shared", "exclusive", "release")
        operation: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a corruption error with path context
    #[must_use]
    pub fn corrupt(what: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::Corrupt {
            what: what.into(),
            path: Some(path.as_ref().into()),
        }
    }

    /// Create a corruption error without path context
    #[must_use]
    pub fn corrupt_no_path(what: impl Into<String>) -> Self {
        Self::Corrupt {
            what: what.into(),
            path: None,
        }
    }

    /// Create an invariant violation error
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Create a protocol mismatch error
    #[must_use]
    pub fn protocol_mismatch(
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::ProtocolMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an invalid digest error
    #[must_use]
    pub fn invalid_digest(message: impl Into<String>) -> Self {
        Self::InvalidDigest {
            message: message.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a lock error
    #[must_use]
    pub fn lock(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Lock {
            source,
            path: path.as_ref().into(),
            operation: operation.into(),
        }
    }
}
