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

//! File-backed configuration for the demix job orchestration layer.
//!
//! Layout: `model.rs` (typed config sections), `loader.rs` (YAML + environment
//! overrides), `validate.rs` (field validation), `defaults.rs` (default values).

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, EnvSource, ProcessEnv};
pub use model::{
    CacheConfig, DemixConfig, Device, EngineConfig, InputConfig, LogFormatSetting,
    OutputFormat, RetentionConfig, RetentionPolicy, TelemetryConfig, WorkspaceConfig,
};
