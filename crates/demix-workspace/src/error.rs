//! # Design
//!
//! - Constant error messages; context travels in fields.
//! - Job ids are carried as strings so errors stay independent of id validation.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for workspace operations.
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

/// Errors produced while managing job workspaces.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// IO failures while interacting with the filesystem.
    #[error("workspace io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Ledger parsing or serialisation failures.
    #[error("workspace ledger failure")]
    Json {
        /// Operation that triggered the JSON failure.
        operation: &'static str,
        /// Path of the ledger.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
    /// Something already exists where a new workspace was to be created.
    #[error("workspace already allocated")]
    AlreadyAllocated {
        /// Job identifier whose directory collided.
        job_id: String,
        /// Path that already exists.
        path: PathBuf,
    },
    /// No unused identifier was found within the retry budget.
    #[error("job id space exhausted")]
    IdSpaceExhausted {
        /// Number of candidates that were tried.
        attempts: u32,
    },
    /// A string did not have the shape of a job identifier.
    #[error("invalid job id")]
    InvalidJobId {
        /// Offending value.
        value: String,
    },
    /// Caller-supplied input was rejected.
    #[error("invalid workspace input")]
    InvalidInput {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// The expected engine output directory does not exist.
    #[error("engine output directory missing")]
    MissingOutput {
        /// Directory that was expected.
        path: PathBuf,
    },
}

impl WorkspaceError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: serde_json::Error,
    ) -> Self {
        Self::Json {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_input(
        field: &'static str,
        reason: &'static str,
        value: Option<String>,
    ) -> Self {
        Self::InvalidInput {
            field,
            reason,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn messages_are_constant_and_sources_preserved() {
        let err = WorkspaceError::io("allocate.create_dir", "/tmp/x", io::Error::other("boom"));
        assert_eq!(err.to_string(), "workspace io failure");
        assert!(err.source().is_some());

        let err = WorkspaceError::AlreadyAllocated {
            job_id: "00000000000000ff".into(),
            path: PathBuf::from("/tmp/jobs/00000000000000ff"),
        };
        assert_eq!(err.to_string(), "workspace already allocated");
        assert!(err.source().is_none());

        let err = WorkspaceError::invalid_input("filename", "empty", None);
        assert_eq!(err.to_string(), "invalid workspace input");
    }
}
