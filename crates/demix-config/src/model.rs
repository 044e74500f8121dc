//! Typed configuration models.
//!
//! # Design
//! - Pure data carriers deserialised from YAML; every section has a default.
//! - Enumerations shared with the engine and orchestrator live here so one crate
//!   owns their textual representation.

use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::ConfigError;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DemixConfig {
    /// Per-job workspace allocation and reclamation.
    pub workspace: WorkspaceConfig,
    /// External separation engine invocation.
    pub engine: EngineConfig,
    /// Upload acceptance rules.
    pub input: InputConfig,
    /// What happens to a failed job's workspace.
    pub retention: RetentionConfig,
    /// Content-addressed result cache.
    pub cache: CacheConfig,
    /// Logging output.
    pub telemetry: TelemetryConfig,
}

/// Workspace namespace settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    /// Parent directory under which job-scoped subtrees are allocated.
    pub root: PathBuf,
    /// Idle seconds before a terminal or orphaned workspace may be reaped.
    pub abandon_after_secs: u64,
    /// Seconds between reaper sweeps.
    pub reap_interval_secs: u64,
}

impl WorkspaceConfig {
    /// Idle threshold as a [`Duration`].
    #[must_use]
    pub const fn abandon_after(&self) -> Duration {
        Duration::from_secs(self.abandon_after_secs)
    }

    /// Reaper sweep interval as a [`Duration`].
    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(defaults::WORKSPACE_ROOT),
            abandon_after_secs: defaults::ABANDON_AFTER_SECS,
            reap_interval_secs: defaults::REAP_INTERVAL_SECS,
        }
    }
}

/// Separation engine invocation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Program to execute.
    pub program: String,
    /// Arguments placed before the per-job arguments.
    pub args: Vec<String>,
    /// Default model identifier.
    pub model: String,
    /// Default compute device.
    pub device: Device,
    /// Encoding of the produced stems.
    pub output_format: OutputFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: defaults::ENGINE_PROGRAM.to_string(),
            args: defaults::ENGINE_ARGS
                .iter()
                .map(|arg| (*arg).to_string())
                .collect(),
            model: defaults::ENGINE_MODEL.to_string(),
            device: Device::Cpu,
            output_format: OutputFormat::Mp3,
        }
    }
}

/// Upload acceptance rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    /// Lowercase extensions (without the dot) accepted for uploads.
    pub accepted_extensions: Vec<String>,
    /// Largest accepted upload in bytes.
    pub max_input_bytes: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            accepted_extensions: defaults::ACCEPTED_EXTENSIONS
                .iter()
                .map(|ext| (*ext).to_string())
                .collect(),
            max_input_bytes: defaults::MAX_INPUT_BYTES,
        }
    }
}

/// Retention behaviour for failed jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    /// Whether a failed job's workspace is reclaimed immediately or kept.
    pub on_failure: RetentionPolicy,
}

/// Policy applied to a workspace when its job fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Reclaim the workspace as soon as the failure is recorded.
    #[default]
    Reclaim,
    /// Keep the workspace until an explicit release or the reaper.
    Retain,
}

/// Result cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Toggle for the result cache.
    pub enabled: bool,
    /// Directory holding cached stems.
    pub root: PathBuf,
    /// Seconds a cached result stays valid.
    pub ttl_secs: u64,
    /// Maximum number of cached results before the oldest are evicted.
    pub max_entries: usize,
}

impl CacheConfig {
    /// Time-to-live as a [`Duration`].
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from(defaults::CACHE_ROOT),
            ttl_secs: defaults::CACHE_TTL_SECS,
            max_entries: defaults::CACHE_MAX_ENTRIES,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Log level directive used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormatSetting,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::LOG_LEVEL.to_string(),
            log_format: LogFormatSetting::Pretty,
        }
    }
}

/// Log output format as written in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormatSetting {
    /// Human-readable output.
    #[default]
    Pretty,
    /// Structured JSON output.
    Json,
}

/// Compute device handed to the separation engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Run inference on the CPU.
    #[default]
    Cpu,
    /// Run inference on the GPU.
    Gpu,
}

impl Device {
    /// Configuration spelling of the device.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }

    /// Value passed to the engine's `--device` flag.
    #[must_use]
    pub const fn engine_arg(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "cuda",
        }
    }
}

impl Display for Device {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" | "cuda" => Ok(Self::Gpu),
            _ => Err(ConfigError::invalid(
                "engine",
                "device",
                Some(value.to_string()),
                "unknown_device",
            )),
        }
    }
}

/// Encoding of the stems written by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// MPEG-1 Layer III.
    #[default]
    Mp3,
    /// Uncompressed RIFF WAVE.
    Wav,
    /// Free Lossless Audio Codec.
    Flac,
}

impl OutputFormat {
    /// File extension of produced stems, without the dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Flac => "flac",
        }
    }

    /// Media type used when streaming a stem to a caller.
    #[must_use]
    pub const fn media_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Wav => "audio/wav",
            Self::Flac => "audio/flac",
        }
    }

    /// Engine flag selecting this encoding; wav is the engine default.
    #[must_use]
    pub const fn engine_flag(self) -> Option<&'static str> {
        match self {
            Self::Mp3 => Some("--mp3"),
            Self::Wav => None,
            Self::Flac => Some("--flac"),
        }
    }
}

impl Display for OutputFormat {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "wav" => Ok(Self::Wav),
            "flac" => Ok(Self::Flac),
            _ => Err(ConfigError::invalid(
                "engine",
                "output_format",
                Some(value.to_string()),
                "unknown_format",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_parses_aliases_and_maps_engine_arg() {
        assert_eq!("GPU".parse::<Device>().ok(), Some(Device::Gpu));
        assert_eq!("cuda".parse::<Device>().ok(), Some(Device::Gpu));
        assert_eq!(Device::Gpu.engine_arg(), "cuda");
        assert_eq!(Device::Cpu.engine_arg(), "cpu");
        assert!("tpu".parse::<Device>().is_err());
    }

    #[test]
    fn output_format_reports_extension_and_media_type() {
        assert_eq!(OutputFormat::Mp3.media_type(), "audio/mpeg");
        assert_eq!(OutputFormat::Flac.extension(), "flac");
        assert_eq!(OutputFormat::Wav.engine_flag(), None);
        assert_eq!("FLAC".parse::<OutputFormat>().ok(), Some(OutputFormat::Flac));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = DemixConfig::default();
        assert_eq!(config.engine.model, "mdx_extra");
        assert_eq!(config.engine.args, vec!["-m", "demucs.separate"]);
        assert_eq!(config.input.accepted_extensions, vec!["mp3", "wav", "flac"]);
        assert_eq!(config.retention.on_failure, RetentionPolicy::Reclaim);
        assert_eq!(config.workspace.abandon_after(), Duration::from_secs(3_600));
    }
}
