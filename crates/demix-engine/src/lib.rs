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

//! Separation engine abstraction and the process-backed demucs adapter.
//!
//! The engine is a black box: it receives an input file, a model name and a device,
//! and writes stems under an output root. This crate only knows how to launch it
//! and how to interpret its exit status.

pub mod demucs;
pub mod error;
pub mod invoker;

use std::path::PathBuf;

use async_trait::async_trait;
use demix_config::{Device, OutputFormat};

pub use demucs::DemucsEngine;
pub use error::{EngineError, EngineResult};
pub use invoker::EngineInvoker;

/// Everything an engine needs to process one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRequest {
    /// Staged input file.
    pub input_path: PathBuf,
    /// Directory the engine writes `<model>/<input stem>/` under.
    pub output_root: PathBuf,
    /// Working directory for the engine process (the job workspace).
    pub working_dir: PathBuf,
    /// Model identifier, passed through untouched.
    pub model: String,
    /// Compute device.
    pub device: Device,
    /// Stem encoding.
    pub format: OutputFormat,
}

/// A separation backend.
#[async_trait]
pub trait SeparationEngine: Send + Sync {
    /// Run the engine once for `request`, returning when it has exited.
    async fn separate(&self, request: &EngineRequest) -> EngineResult<()>;
}
