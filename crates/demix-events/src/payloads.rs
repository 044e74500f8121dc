//! Event payload types describing job lifecycle transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned to each event emitted by the bus.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Typed lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Input bytes were written into a freshly allocated workspace.
    JobStaged {
        /// Job identifier.
        job_id: String,
        /// Original filename supplied by the caller.
        filename: String,
        /// Model the job will run with.
        model: String,
    },
    /// The separation engine was invoked for the job.
    JobRunning {
        /// Job identifier.
        job_id: String,
    },
    /// Stems were collected and are ready for download.
    JobCompleted {
        /// Job identifier.
        job_id: String,
        /// Stem file names in collection order.
        stems: Vec<String>,
        /// Whether the stems were restored from the result cache.
        cached: bool,
    },
    /// The job reached the failed state.
    JobFailed {
        /// Job identifier.
        job_id: String,
        /// Lifecycle step that failed.
        step: String,
        /// Human-readable failure summary.
        message: String,
    },
    /// The job's workspace was reclaimed.
    JobReleased {
        /// Job identifier.
        job_id: String,
        /// Whether every entry of the workspace was removed.
        complete: bool,
    },
    /// A cached result satisfied the job without running the engine.
    CacheHit {
        /// Job identifier.
        job_id: String,
        /// Cache key that matched.
        key: String,
    },
    /// Aggregated health state changed.
    HealthChanged {
        /// Components currently reporting degraded health.
        degraded: Vec<String>,
    },
}

impl Event {
    /// Machine-friendly discriminator for log fields and metrics labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JobStaged { .. } => "job_staged",
            Self::JobRunning { .. } => "job_running",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
            Self::JobReleased { .. } => "job_released",
            Self::CacheHit { .. } => "cache_hit",
            Self::HealthChanged { .. } => "health_changed",
        }
    }

    /// Job the event refers to, if any.
    #[must_use]
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobStaged { job_id, .. }
            | Self::JobRunning { job_id }
            | Self::JobCompleted { job_id, .. }
            | Self::JobFailed { job_id, .. }
            | Self::JobReleased { job_id, .. }
            | Self::CacheHit { job_id, .. } => Some(job_id),
            Self::HealthChanged { .. } => None,
        }
    }
}

/// Metadata wrapper around events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Sequential identifier.
    pub id: EventId,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    pub event: Event,
}
