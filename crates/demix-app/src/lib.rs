#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Job isolation and lifecycle orchestration for stem separation.
//!
//! Layout: `orchestrator.rs` (job state machine), `cache.rs` (result cache),
//! `reaper.rs` (abandoned workspace sweeps), `bootstrap.rs` (service wiring),
//! `job.rs` (request and view types), `error.rs` (error taxonomy).

pub mod bootstrap;
pub mod cache;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod reaper;

pub use bootstrap::{AppContext, init_telemetry, load_config};
pub use cache::{CacheKey, CachedResult, ResultCache};
pub use error::{AppError, AppResult, CacheError, CacheResult, JobError, JobResult, describe};
pub use job::{JobSnapshot, OutputLease, StemDownload, SubmitRequest};
pub use orchestrator::{JobOrchestrator, JobSettings};
pub use reaper::{ReapReport, spawn_reaper};

pub use demix_workspace::{JobId, JobStatus, ReclaimOutcome, ReclaimReport, StemFile};
