//! Error types for the MarFS core
//!
//! One taxonomy is shared by every crate in the workspace. Engine
//! operations return these directly; the VFS boundary (an external
//! collaborator) is responsible for translating them into errno values.
//!
//! The categories:
//!
//! - **Config**: structural validation failures at load time. Fatal at
//!   startup, never produced afterwards.
//! - **NotMarfs / NotFound**: paths outside any mount, unknown namespaces,
//!   missing reference entries. Surfaced to the caller, not logged as
//!   errors.
//! - **Transient**: short reads, partial content, network hiccups.
//!   Retryable for reads on the same byte range; fatal for writes.
//! - **Integrity**: xattr parse failures, chunk-info mismatches, holes
//!   where data was expected. Fatal for the operation.
//! - **VersionMismatch**: a persisted record carries a config version the
//!   running config does not match.
//! - **QuotaExceeded**: preflight rejection during file creation.
//! - **Permission**: POSIX checks plus the per-namespace MarFS masks.
//! - **Fatal**: a worker rank can no longer continue; the manager treats
//!   the rank as terminated.

use std::io;
use thiserror::Error;

use crate::tag::ConfigVersion;

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Which quota bound was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// File-count quota
    Files,
    /// Byte-space quota
    Space,
}

/// Error taxonomy for MarFS operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration load/validation failure
    #[error("config error: {0}")]
    Config(String),

    /// Path does not fall under any MarFS mount
    #[error("not a MarFS path: {0}")]
    NotMarfs(String),

    /// Namespace, reference entry, or object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O error from the metadata filesystem or object store
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transient I/O condition (short read, partial content, timeout)
    #[error("transient I/O failure: {0}")]
    Transient(String),

    /// Persisted state fails internal consistency checks
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// A persisted record was written under an incompatible config version
    #[error("config version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version the running config carries
        expected: ConfigVersion,
        /// Version found in the persisted record
        found: ConfigVersion,
    },

    /// Namespace quota would be exceeded by the operation
    #[error("quota exceeded for namespace {namespace} ({kind:?})")]
    QuotaExceeded {
        /// Namespace id string
        namespace: String,
        /// Which bound was hit
        kind: QuotaKind,
    },

    /// Permission denied by POSIX bits or MarFS namespace masks
    #[error("permission denied: {0}")]
    Permission(String),

    /// A rank-fatal condition; the worker cannot continue
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// True for conditions worth retrying on the same byte range.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// True when the owning worker rank must terminate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// True for the two not-an-error lookup outcomes.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotMarfs(_) | Error::NotFound(_))
    }

    /// Shorthand for an integrity failure with a formatted message.
    pub fn integrity(msg: impl Into<String>) -> Self {
        Error::Integrity(msg.into())
    }

    /// Shorthand for a config failure with a formatted message.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
