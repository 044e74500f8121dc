//! # Design
//!
//! - `JobError` is what callers of the orchestrator see; every variant names the job
//!   (when one had been assigned) and the lifecycle stage that failed.
//! - `AppError` covers bootstrap wiring only.
//! - `CacheError` never escapes a job; the orchestrator logs it and carries on.
//! - Messages are constant; context travels in fields and sources are preserved.

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use demix_engine::EngineError;
use demix_workspace::{JobStatus, ReclaimFailure, WorkspaceError};
use thiserror::Error;

/// Result alias for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Result alias for bootstrap operations.
pub type AppResult<T> = Result<T, AppError>;

/// Result alias for result cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Failures surfaced by the job orchestrator.
#[derive(Debug, Error)]
pub enum JobError {
    /// No workspace could be allocated: id collision, exhausted ids, or permissions.
    #[error("workspace allocation failed")]
    Allocation {
        /// Candidate job id, when one had been drawn.
        job_id: Option<String>,
        /// Lifecycle stage.
        stage: &'static str,
        /// Underlying workspace error.
        source: WorkspaceError,
    },
    /// The separation engine could not be spawned or exited unsuccessfully.
    #[error("separation engine failed")]
    EngineFailure {
        /// Job identifier.
        job_id: String,
        /// Lifecycle stage.
        stage: &'static str,
        /// Underlying engine error with exit code and diagnostics.
        source: EngineError,
    },
    /// The engine reported success but its output directory does not exist.
    #[error("engine output missing")]
    MissingOutput {
        /// Job identifier.
        job_id: String,
        /// Lifecycle stage.
        stage: &'static str,
        /// Directory that was expected.
        path: PathBuf,
    },
    /// Some workspace entries survived reclamation.
    #[error("workspace reclamation incomplete")]
    Reclamation {
        /// Job identifier.
        job_id: String,
        /// Lifecycle stage.
        stage: &'static str,
        /// Entries that could not be removed.
        failures: Vec<ReclaimFailure>,
    },
    /// The submitted input was rejected before any work started.
    #[error("input rejected")]
    InvalidInput {
        /// Job identifier, when one had been assigned.
        job_id: Option<String>,
        /// Lifecycle stage.
        stage: &'static str,
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the rejection.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// Writing the input into the workspace failed.
    #[error("input staging failed")]
    Staging {
        /// Job identifier.
        job_id: String,
        /// Lifecycle stage.
        stage: &'static str,
        /// Underlying workspace error.
        source: WorkspaceError,
    },
    /// The job is not known to this orchestrator.
    #[error("unknown job")]
    UnknownJob {
        /// Job identifier.
        job_id: String,
    },
    /// The requested operation is not legal in the job's current state.
    #[error("invalid job state transition")]
    InvalidTransition {
        /// Job identifier.
        job_id: String,
        /// Operation that was refused.
        operation: &'static str,
        /// State the job was in.
        status: JobStatus,
    },
    /// Downloads are still reading the job's outputs.
    #[error("job outputs in use")]
    OutputsInUse {
        /// Job identifier.
        job_id: String,
        /// Number of open downloads.
        leases: usize,
    },
    /// A stem index outside the collected outputs was requested.
    #[error("stem index out of range")]
    OutputIndex {
        /// Job identifier.
        job_id: String,
        /// Requested index.
        index: usize,
        /// Number of collected stems.
        available: usize,
    },
    /// Filesystem or task failures outside the categories above.
    #[error("job io failure")]
    Io {
        /// Job identifier, when one had been assigned.
        job_id: Option<String>,
        /// Lifecycle stage.
        stage: &'static str,
        /// Path involved, when known.
        path: Option<PathBuf>,
        /// Underlying IO error.
        source: io::Error,
    },
}

impl JobError {
    /// Job the error belongs to, if one had been assigned.
    #[must_use]
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Allocation { job_id, .. }
            | Self::InvalidInput { job_id, .. }
            | Self::Io { job_id, .. } => job_id.as_deref(),
            Self::EngineFailure { job_id, .. }
            | Self::MissingOutput { job_id, .. }
            | Self::Reclamation { job_id, .. }
            | Self::Staging { job_id, .. }
            | Self::UnknownJob { job_id }
            | Self::InvalidTransition { job_id, .. }
            | Self::OutputsInUse { job_id, .. }
            | Self::OutputIndex { job_id, .. } => Some(job_id.as_str()),
        }
    }

    /// Lifecycle stage that failed.
    #[must_use]
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::Allocation { stage, .. }
            | Self::EngineFailure { stage, .. }
            | Self::MissingOutput { stage, .. }
            | Self::Reclamation { stage, .. }
            | Self::InvalidInput { stage, .. }
            | Self::Staging { stage, .. }
            | Self::Io { stage, .. } => *stage,
            Self::UnknownJob { .. } => "lookup",
            Self::InvalidTransition { operation, .. } => *operation,
            Self::OutputsInUse { .. } => "release",
            Self::OutputIndex { .. } => "download",
        }
    }

    /// Whether the error was caused by the caller rather than the system.
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. }
                | Self::UnknownJob { .. }
                | Self::InvalidTransition { .. }
                | Self::OutputsInUse { .. }
                | Self::OutputIndex { .. }
        )
    }

    pub(crate) const fn invalid_input(
        job_id: Option<String>,
        field: &'static str,
        reason: &'static str,
        value: Option<String>,
    ) -> Self {
        Self::InvalidInput {
            job_id,
            stage: "validate",
            field,
            reason,
            value,
        }
    }

    pub(crate) fn io(
        job_id: &str,
        stage: &'static str,
        path: Option<PathBuf>,
        source: io::Error,
    ) -> Self {
        Self::Io {
            job_id: Some(job_id.to_string()),
            stage,
            path,
            source,
        }
    }

    /// Map a workspace error raised outside allocation and staging.
    pub(crate) fn workspace(job_id: &str, stage: &'static str, source: WorkspaceError) -> Self {
        match source {
            WorkspaceError::MissingOutput { path } => Self::MissingOutput {
                job_id: job_id.to_string(),
                stage,
                path,
            },
            WorkspaceError::InvalidInput {
                field,
                reason,
                value,
            } => Self::InvalidInput {
                job_id: Some(job_id.to_string()),
                stage,
                field,
                reason,
                value,
            },
            WorkspaceError::Io {
                path, source: err, ..
            } => Self::io(job_id, stage, Some(path), err),
            other => Self::io(job_id, stage, None, io::Error::other(other)),
        }
    }
}

/// Render an error and its source chain on one line.
#[must_use]
pub fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(next) = source {
        rendered.push_str(": ");
        rendered.push_str(&next.to_string());
        source = next.source();
    }
    rendered
}

/// Result cache failures. Logged by the orchestrator and never fatal to a job.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure inside the cache root.
    #[error("cache io failure")]
    Io {
        /// Operation that failed.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// An entry manifest could not be read or written.
    #[error("cache manifest failure")]
    Manifest {
        /// Operation that failed.
        operation: &'static str,
        /// Manifest path.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

impl CacheError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn manifest(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: serde_json::Error,
    ) -> Self {
        Self::Manifest {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Application bootstrap failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration loading failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: demix_config::ConfigError,
    },
    /// Telemetry setup failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: demix_telemetry::TelemetryError,
    },
    /// The workspace root could not be prepared.
    #[error("workspace operation failed")]
    Workspace {
        /// Operation identifier.
        operation: &'static str,
        /// Source workspace error.
        source: WorkspaceError,
    },
}

impl AppError {
    pub(crate) const fn config(operation: &'static str, source: demix_config::ConfigError) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: demix_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn workspace(operation: &'static str, source: WorkspaceError) -> Self {
        Self::Workspace { operation, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn job_errors_carry_id_and_stage() {
        let err = JobError::EngineFailure {
            job_id: "00000000000000aa".into(),
            stage: "invoke",
            source: EngineError::Failed {
                exit_code: Some(2),
                diagnostics: "bad model".into(),
            },
        };
        assert_eq!(err.to_string(), "separation engine failed");
        assert_eq!(err.job_id(), Some("00000000000000aa"));
        assert_eq!(err.stage(), "invoke");
        assert!(err.source().is_some());
        assert!(!err.is_caller_error());
    }

    #[test]
    fn workspace_missing_output_maps_to_missing_output() {
        let err = JobError::workspace(
            "00000000000000ab",
            "collect",
            WorkspaceError::MissingOutput {
                path: PathBuf::from("/tmp/out"),
            },
        );
        assert!(matches!(
            err,
            JobError::MissingOutput { stage: "collect", .. }
        ));
    }

    #[test]
    fn describe_walks_the_source_chain() {
        let err = JobError::io(
            "00000000000000ac",
            "download",
            None,
            io::Error::other("disk on fire"),
        );
        assert_eq!(describe(&err), "job io failure: disk on fire");
    }

    #[test]
    fn lifecycle_misuse_is_a_caller_error() {
        let err = JobError::OutputsInUse {
            job_id: "00000000000000ad".into(),
            leases: 1,
        };
        assert!(err.is_caller_error());
        assert_eq!(err.stage(), "release");
    }
}
