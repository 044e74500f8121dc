//! Request and view types exchanged with the orchestrator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use demix_config::{Device, OutputFormat};
use demix_workspace::{JobId, JobLedger, JobStatus, StemFile, StepRecord};
use serde::Serialize;
use tokio::fs::File;

/// A mix submitted for separation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    /// Original filename as supplied by the caller; only its base name is used.
    pub filename: String,
    /// Raw audio bytes.
    pub bytes: Vec<u8>,
    /// Model override; the configured default when `None`.
    pub model: Option<String>,
    /// Device override.
    pub device: Option<Device>,
    /// Output format override.
    pub format: Option<OutputFormat>,
}

impl SubmitRequest {
    /// Request using the configured engine settings.
    #[must_use]
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
            model: None,
            device: None,
            format: None,
        }
    }

    /// Run with `model` instead of the default.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Run on `device` instead of the default.
    #[must_use]
    pub const fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Produce `format` instead of the default.
    #[must_use]
    pub const fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    /// Job identifier.
    pub id: JobId,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Model the job ran with.
    pub model: String,
    /// Device the job ran on.
    pub device: Device,
    /// Stem format.
    pub output_format: OutputFormat,
    /// Caller-supplied filename.
    pub original_filename: String,
    /// Whether the stems came from the result cache.
    pub cached: bool,
    /// Collected stems, empty until the job completes.
    pub stems: Vec<StemFile>,
    /// Last failure message.
    pub error: Option<String>,
    /// Step history.
    pub steps: Vec<StepRecord>,
    /// Downloads currently holding a lease.
    pub open_downloads: usize,
    /// Whether the job's workspace still exists.
    pub workspace_retained: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub(crate) fn from_ledger(
        ledger: &JobLedger,
        stems: &[StemFile],
        open_downloads: usize,
        workspace_retained: bool,
    ) -> Self {
        Self {
            id: ledger.job_id.clone(),
            status: ledger.status,
            model: ledger.model.clone(),
            device: ledger.device,
            output_format: ledger.output_format,
            original_filename: ledger.original_filename.clone(),
            cached: ledger.cached,
            stems: stems.to_vec(),
            error: ledger.error.clone(),
            steps: ledger.steps.clone(),
            open_downloads,
            workspace_retained,
            created_at: ledger.created_at,
            updated_at: ledger.updated_at,
        }
    }

    /// Stem file names in collection order.
    #[must_use]
    pub fn stem_names(&self) -> Vec<&str> {
        self.stems.iter().map(|stem| stem.name.as_str()).collect()
    }
}

/// Marks a job's outputs as being read. Release is refused while any lease is alive.
#[derive(Debug, Clone)]
pub struct OutputLease {
    _token: Arc<()>,
}

impl OutputLease {
    pub(crate) const fn new(token: Arc<()>) -> Self {
        Self { _token: token }
    }
}

/// An open stem ready to stream.
#[derive(Debug)]
pub struct StemDownload {
    /// Stem file name.
    pub name: String,
    /// Media type for the stem.
    pub media_type: &'static str,
    /// Size in bytes.
    pub len: u64,
    /// Open file handle positioned at the start.
    pub file: File,
    /// Lease held for as long as the download is alive.
    pub lease: OutputLease,
}

pub(crate) fn open_leases(token: &Arc<()>) -> usize {
    Arc::strong_count(token).saturating_sub(1)
}
