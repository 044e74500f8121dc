//! Default values applied when a configuration file omits a field.
//!
//! # Design
//! - Centralize defaults so the YAML shape and the in-code `Default` impls agree.
//! - Keep time-based defaults explicit for auditability.

/// Default workspace root, relative to the process working directory.
pub const WORKSPACE_ROOT: &str = ".demix/jobs";
/// Idle time after which a terminal or orphaned workspace is considered abandoned.
pub const ABANDON_AFTER_SECS: u64 = 3_600;
/// Interval between reaper sweeps.
pub const REAP_INTERVAL_SECS: u64 = 300;
/// Program used to launch the separation engine.
pub const ENGINE_PROGRAM: &str = "python3";
/// Arguments placed before the per-job engine arguments.
pub const ENGINE_ARGS: &[&str] = &["-m", "demucs.separate"];
/// Separation model identifier handed to the engine.
pub const ENGINE_MODEL: &str = "mdx_extra";
/// Accepted upload extensions: one compressed, one uncompressed, one lossless.
pub const ACCEPTED_EXTENSIONS: &[&str] = &["mp3", "wav", "flac"];
/// Upper bound on a single upload (256 MiB).
pub const MAX_INPUT_BYTES: u64 = 256 * 1024 * 1024;
/// Default result cache root.
pub const CACHE_ROOT: &str = ".demix/cache";
/// Default result cache time-to-live.
pub const CACHE_TTL_SECS: u64 = 86_400;
/// Default maximum number of cached results.
pub const CACHE_MAX_ENTRIES: usize = 64;
/// Default log level when neither the file nor `RUST_LOG` provide one.
pub const LOG_LEVEL: &str = "info";
