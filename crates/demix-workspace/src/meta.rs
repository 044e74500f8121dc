//! The per-job `job.json` ledger.
//!
//! # Design
//! - Rewritten at every lifecycle transition so an operator (or the reaper after a
//!   crash) can tell how old a workspace is and what it was doing.
//! - Writes go through a sibling temporary file and a rename so readers never see
//!   a torn document.

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use demix_config::{Device, OutputFormat};
use serde::{Deserialize, Serialize};

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::identity::JobId;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Workspace allocated and input written.
    Staged,
    /// Engine invocation in progress.
    Running,
    /// Outputs collected.
    Completed,
    /// A step failed; no outputs are available.
    Failed,
}

impl JobStatus {
    /// Lowercase label used in logs, metrics, and the ledger.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further state transitions are permitted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Staged, Self::Running | Self::Completed | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Lifecycle steps recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Workspace directory creation.
    Allocate,
    /// Input bytes written into the workspace.
    Stage,
    /// Separation engine run (or cache restore).
    Invoke,
    /// Output discovery.
    Collect,
    /// Workspace reclamation.
    Release,
}

impl StepKind {
    /// Stable label for logs, metrics, and the ledger.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allocate => "allocate",
            Self::Stage => "stage",
            Self::Invoke => "invoke",
            Self::Collect => "collect",
            Self::Release => "release",
        }
    }
}

impl Display for StepKind {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step began.
    Started,
    /// Step finished successfully.
    Completed,
    /// Step failed.
    Failed,
    /// Step was not needed.
    Skipped,
}

impl StepStatus {
    /// Stable label for metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step label.
    pub name: String,
    /// Latest status.
    pub status: StepStatus,
    /// Free-form detail (error text, counts).
    pub detail: Option<String>,
    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
}

/// Persistent description of a job, stored as `job.json` in its workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLedger {
    /// Owning job.
    pub job_id: JobId,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Engine model.
    pub model: String,
    /// Compute device.
    pub device: Device,
    /// Stem encoding.
    pub output_format: OutputFormat,
    /// Name supplied with the upload.
    pub original_filename: String,
    /// Staged input location once written.
    #[serde(default)]
    pub input_path: Option<PathBuf>,
    /// Whether the outputs came from the result cache.
    #[serde(default)]
    pub cached: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Step history.
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    /// Collected stem names.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Last failure message.
    #[serde(default)]
    pub error: Option<String>,
}

impl JobLedger {
    /// Fresh ledger for a job that has just been accepted.
    #[must_use]
    pub fn new(
        job_id: JobId,
        model: impl Into<String>,
        device: Device,
        output_format: OutputFormat,
        original_filename: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            status: JobStatus::Staged,
            model: model.into(),
            device,
            output_format,
            original_filename: original_filename.into(),
            input_path: None,
            cached: false,
            created_at: now,
            updated_at: now,
            steps: Vec::new(),
            outputs: Vec::new(),
            error: None,
        }
    }

    /// Status recorded for `step`, if the step has run.
    #[must_use]
    pub fn step_status(&self, step: StepKind) -> Option<StepStatus> {
        self.steps
            .iter()
            .find(|record| record.name == step.as_str())
            .map(|record| record.status)
    }

    /// Record a step transition; returns whether anything changed.
    pub fn update_step(&mut self, step: StepKind, status: StepStatus, detail: Option<String>) -> bool {
        let now = Utc::now();
        let mut updated = false;
        if let Some(record) = self
            .steps
            .iter_mut()
            .find(|record| record.name == step.as_str())
        {
            if record.status != status || record.detail != detail {
                record.status = status;
                record.detail = detail;
                record.updated_at = now;
                updated = true;
            }
        } else {
            self.steps.push(StepRecord {
                name: step.as_str().to_string(),
                status,
                detail,
                updated_at: now,
            });
            updated = true;
        }
        if updated {
            self.updated_at = now;
        }
        updated
    }

    /// Move to `status` and bump the modification time.
    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Read a ledger from disk.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid ledger.
pub fn load_ledger(path: &Path) -> WorkspaceResult<JobLedger> {
    let raw =
        fs::read_to_string(path).map_err(|source| WorkspaceError::io("ledger.read", path, source))?;
    serde_json::from_str(&raw).map_err(|source| WorkspaceError::json("ledger.parse", path, source))
}

/// Write a ledger to disk, replacing any previous version.
///
/// # Errors
///
/// Returns an error if the ledger cannot be serialised or written.
pub fn persist_ledger(path: &Path, ledger: &JobLedger) -> WorkspaceResult<()> {
    let serialised = serde_json::to_string_pretty(ledger)
        .map_err(|source| WorkspaceError::json("ledger.serialize", path, source))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serialised).map_err(|source| WorkspaceError::io("ledger.write", &tmp, source))?;
    fs::rename(&tmp, path).map_err(|source| WorkspaceError::io("ledger.rename", path, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn ledger() -> JobLedger {
        JobLedger::new(
            JobId::from_u64(7),
            "mdx_extra",
            Device::Cpu,
            OutputFormat::Mp3,
            "song.wav",
        )
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use JobStatus::{Completed, Failed, Running, Staged};
        assert!(Staged.can_transition_to(Running));
        assert!(Staged.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Staged));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(Completed.is_terminal() && Failed.is_terminal());
        assert!(!Staged.is_terminal() && !Running.is_terminal());
    }

    #[test]
    fn update_step_reports_changes_only() {
        let mut ledger = ledger();
        assert!(ledger.update_step(StepKind::Stage, StepStatus::Started, None));
        assert!(!ledger.update_step(StepKind::Stage, StepStatus::Started, None));
        assert!(ledger.update_step(StepKind::Stage, StepStatus::Completed, Some("4 bytes".into())));
        assert_eq!(ledger.step_status(StepKind::Stage), Some(StepStatus::Completed));
        assert_eq!(ledger.step_status(StepKind::Invoke), None);
        assert_eq!(ledger.steps.len(), 1);
    }

    #[test]
    fn ledger_persists_and_reloads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("job.json");
        let mut ledger = ledger();
        ledger.update_step(StepKind::Allocate, StepStatus::Completed, None);
        ledger.set_status(JobStatus::Running);
        persist_ledger(&path, &ledger)?;

        let loaded = load_ledger(&path)?;
        assert_eq!(loaded, ledger);
        assert!(!path.with_extension("json.tmp").exists());
        Ok(())
    }

    #[test]
    fn corrupt_ledger_reports_json_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("job.json");
        fs::write(&path, "{not json")?;
        assert!(matches!(
            load_ledger(&path),
            Err(WorkspaceError::Json {
                operation: "ledger.parse",
                ..
            })
        ));
        Ok(())
    }
}
