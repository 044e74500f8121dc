//! Configuration loading: YAML file, then environment overrides, then validation.
//!
//! # Design
//! - A missing file path means "use defaults"; a path that cannot be read is an error.
//! - Environment access goes through [`EnvSource`] so overrides are testable without
//!   touching the process environment.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::model::DemixConfig;
use crate::validate::validate;

/// Override for the workspace root.
pub const ENV_WORKSPACE_ROOT: &str = "DEMIX_WORKSPACE_ROOT";
/// Override for the engine program.
pub const ENV_ENGINE_PROGRAM: &str = "DEMIX_ENGINE_PROGRAM";
/// Override for the default model.
pub const ENV_MODEL: &str = "DEMIX_MODEL";
/// Override for the default device.
pub const ENV_DEVICE: &str = "DEMIX_DEVICE";
/// Override for the cache root.
pub const ENV_CACHE_ROOT: &str = "DEMIX_CACHE_ROOT";
/// Override for the log level.
pub const ENV_LOG_LEVEL: &str = "DEMIX_LOG_LEVEL";

/// Source of environment variables.
pub trait EnvSource {
    /// Return the value of `name`, if set and valid UTF-8.
    fn var(&self, name: &str) -> Option<String>;
}

/// [`EnvSource`] backed by the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl<F> EnvSource for F
where
    F: Fn(&str) -> Option<String>,
{
    fn var(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// Loads a [`DemixConfig`] from an optional YAML file.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Loader reading from `path` when provided, defaults otherwise.
    #[must_use]
    pub const fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Path of the configuration file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load using the process environment for overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if validation fails.
    pub fn load(&self) -> ConfigResult<DemixConfig> {
        self.load_with_env(&ProcessEnv)
    }

    /// Load using the supplied environment for overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if validation fails.
    pub fn load_with_env(&self, env: &impl EnvSource) -> ConfigResult<DemixConfig> {
        let mut config = match &self.path {
            Some(path) => parse_file(path)?,
            None => DemixConfig::default(),
        };
        apply_env_overrides(&mut config, env)?;
        validate(&mut config)?;
        debug!(
            path = ?self.path,
            workspace_root = %config.workspace.root.display(),
            model = %config.engine.model,
            device = %config.engine.device,
            "configuration loaded"
        );
        Ok(config)
    }
}

/// Parse a YAML document into a configuration without applying overrides.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] if the document does not match the schema.
pub fn parse_str(path: &Path, raw: &str) -> ConfigResult<DemixConfig> {
    if raw.trim().is_empty() {
        return Ok(DemixConfig::default());
    }
    serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Render the effective configuration as YAML.
///
/// # Errors
///
/// Returns [`ConfigError::Render`] if serialisation fails.
pub fn render_yaml(config: &DemixConfig) -> ConfigResult<String> {
    serde_yaml::to_string(config).map_err(|source| ConfigError::Render { source })
}

fn parse_file(path: &Path) -> ConfigResult<DemixConfig> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(path, &raw)
}

fn apply_env_overrides(config: &mut DemixConfig, env: &impl EnvSource) -> ConfigResult<()> {
    if let Some(root) = non_empty(env.var(ENV_WORKSPACE_ROOT)) {
        config.workspace.root = PathBuf::from(root);
    }
    if let Some(program) = non_empty(env.var(ENV_ENGINE_PROGRAM)) {
        config.engine.program = program;
    }
    if let Some(model) = non_empty(env.var(ENV_MODEL)) {
        config.engine.model = model;
    }
    if let Some(device) = non_empty(env.var(ENV_DEVICE)) {
        config.engine.device = device.parse()?;
    }
    if let Some(root) = non_empty(env.var(ENV_CACHE_ROOT)) {
        config.cache.root = PathBuf::from(root);
    }
    if let Some(level) = non_empty(env.var(ENV_LOG_LEVEL)) {
        config.telemetry.log_level = level;
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Device, LogFormatSetting, OutputFormat, RetentionPolicy};
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl EnvSource {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn parse_str_reads_partial_documents() -> ConfigResult<()> {
        let raw = "engine:\n  model: htdemucs\n  device: gpu\n  output_format: flac\nretention:\n  on_failure: retain\ntelemetry:\n  log_format: json\n";
        let config = parse_str(Path::new("inline.yaml"), raw)?;
        assert_eq!(config.engine.model, "htdemucs");
        assert_eq!(config.engine.device, Device::Gpu);
        assert_eq!(config.engine.output_format, OutputFormat::Flac);
        assert_eq!(config.retention.on_failure, RetentionPolicy::Retain);
        assert_eq!(config.telemetry.log_format, LogFormatSetting::Json);
        assert_eq!(config.engine.program, "python3");
        Ok(())
    }

    #[test]
    fn parse_str_rejects_unknown_fields() {
        let err = parse_str(Path::new("bad.yaml"), "engine:\n  modle: typo\n").err();
        assert!(matches!(err, Some(ConfigError::Parse { .. })));
    }

    #[test]
    fn empty_document_yields_defaults() -> ConfigResult<()> {
        let config = parse_str(Path::new("empty.yaml"), "\n")?;
        assert_eq!(config, DemixConfig::default());
        Ok(())
    }

    #[test]
    fn env_overrides_take_precedence() -> ConfigResult<()> {
        let env = env_from(&[
            (ENV_WORKSPACE_ROOT, "/srv/demix/jobs"),
            (ENV_MODEL, "htdemucs_ft"),
            (ENV_DEVICE, "cuda"),
            (ENV_LOG_LEVEL, "debug"),
            (ENV_ENGINE_PROGRAM, "  "),
        ]);
        let config = ConfigLoader::new(None).load_with_env(&env)?;
        assert_eq!(config.workspace.root, PathBuf::from("/srv/demix/jobs"));
        assert_eq!(config.engine.model, "htdemucs_ft");
        assert_eq!(config.engine.device, Device::Gpu);
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.engine.program, "python3");
        Ok(())
    }

    #[test]
    fn invalid_device_override_is_reported() {
        let env = env_from(&[(ENV_DEVICE, "abacus")]);
        let err = ConfigLoader::new(None).load_with_env(&env).err();
        assert!(matches!(
            err,
            Some(ConfigError::InvalidField {
                field: "device",
                ..
            })
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let loader = ConfigLoader::new(Some(PathBuf::from("/definitely/missing/demix.yaml")));
        let err = loader.load_with_env(&env_from(&[])).err();
        assert!(matches!(err, Some(ConfigError::Read { .. })));
    }

    #[test]
    fn render_round_trips_through_parse() -> ConfigResult<()> {
        let config = DemixConfig::default();
        let rendered = render_yaml(&config)?;
        assert!(rendered.contains("mdx_extra"));
        let parsed = parse_str(Path::new("rendered.yaml"), &rendered)?;
        assert_eq!(parsed, config);
        Ok(())
    }
}
