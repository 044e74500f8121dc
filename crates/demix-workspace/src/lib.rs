//! Job-scoped workspace management for separation jobs.
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

//! Every job owns exactly one directory, `<root>/<job id>`, and nothing in this
//! crate ever touches a path outside the directory of the job it was asked about.
//!
//! Layout: `identity.rs` (job ids), `manager.rs` (allocate/reclaim/list),
//! `staging.rs` (input writes), `meta.rs` (the `job.json` ledger),
//! `collect.rs` (stem discovery).

pub mod collect;
pub mod error;
pub mod identity;
pub mod manager;
pub mod meta;
pub mod staging;

pub use collect::{StemFile, collect_stems};
pub use error::{WorkspaceError, WorkspaceResult};
pub use identity::{DEFAULT_MAX_ATTEMPTS, IdSource, IdentityGenerator, JobId, RandomIdSource};
pub use manager::{
    AllocatedWorkspace, ReclaimFailure, ReclaimOutcome, ReclaimReport, Workspace,
    WorkspaceManager,
};
pub use meta::{JobLedger, JobStatus, StepKind, StepRecord, StepStatus, load_ledger, persist_ledger};
pub use staging::{sanitize_filename, stage_input};
