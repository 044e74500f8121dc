//! Validation and normalisation of a loaded configuration document.

use crate::error::{ConfigError, ConfigResult};
use crate::model::DemixConfig;

/// Normalise and validate the configuration in place.
///
/// Extensions are lowercased, stripped of a leading dot, and de-duplicated
/// while keeping their first-seen order.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] for the first field that fails validation.
pub fn validate(config: &mut DemixConfig) -> ConfigResult<()> {
    if config.workspace.root.as_os_str().is_empty() {
        return Err(ConfigError::invalid("workspace", "root", None, "empty"));
    }
    if config.workspace.reap_interval_secs == 0 {
        return Err(ConfigError::invalid(
            "workspace",
            "reap_interval_secs",
            Some("0".to_string()),
            "zero",
        ));
    }

    if config.engine.program.trim().is_empty() {
        return Err(ConfigError::invalid(
            "engine",
            "program",
            Some(config.engine.program.clone()),
            "empty",
        ));
    }
    validate_model(&config.engine.model)?;

    let mut extensions: Vec<String> = Vec::with_capacity(config.input.accepted_extensions.len());
    for raw in &config.input.accepted_extensions {
        let normalised = raw.trim().trim_start_matches('.').to_ascii_lowercase();
        if normalised.is_empty() || !normalised.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::invalid(
                "input",
                "accepted_extensions",
                Some(raw.clone()),
                "invalid_extension",
            ));
        }
        if !extensions.contains(&normalised) {
            extensions.push(normalised);
        }
    }
    if extensions.is_empty() {
        return Err(ConfigError::invalid(
            "input",
            "accepted_extensions",
            None,
            "empty",
        ));
    }
    config.input.accepted_extensions = extensions;

    if config.input.max_input_bytes == 0 {
        return Err(ConfigError::invalid(
            "input",
            "max_input_bytes",
            Some("0".to_string()),
            "zero",
        ));
    }

    if config.cache.enabled {
        if config.cache.root.as_os_str().is_empty() {
            return Err(ConfigError::invalid("cache", "root", None, "empty"));
        }
        if config.cache.max_entries == 0 {
            return Err(ConfigError::invalid(
                "cache",
                "max_entries",
                Some("0".to_string()),
                "zero",
            ));
        }
    }

    if config.telemetry.log_level.trim().is_empty() {
        return Err(ConfigError::invalid(
            "telemetry",
            "log_level",
            None,
            "empty",
        ));
    }

    Ok(())
}

/// Model identifiers become a directory name under the engine output root.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] if the model is empty or is not a
/// single path component.
pub fn validate_model(model: &str) -> ConfigResult<()> {
    let trimmed = model.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::invalid(
            "engine",
            "model",
            Some(model.to_string()),
            "empty",
        ));
    }
    if trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\'])
        || trimmed != model
    {
        return Err(ConfigError::invalid(
            "engine",
            "model",
            Some(model.to_string()),
            "not_a_path_component",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn field_of(err: &ConfigError) -> Option<(&'static str, &'static str)> {
        match err {
            ConfigError::InvalidField {
                section, field, ..
            } => Some((*section, *field)),
            _ => None,
        }
    }

    #[test]
    fn defaults_validate() {
        let mut config = DemixConfig::default();
        assert!(validate(&mut config).is_ok());
    }

    #[test]
    fn extensions_are_normalised_and_deduplicated() -> ConfigResult<()> {
        let mut config = DemixConfig::default();
        config.input.accepted_extensions =
            vec![".WAV".into(), "mp3".into(), "wav".into(), " Flac ".into()];
        validate(&mut config)?;
        assert_eq!(config.input.accepted_extensions, vec!["wav", "mp3", "flac"]);
        Ok(())
    }

    #[test]
    fn rejects_empty_sections() {
        let mut config = DemixConfig::default();
        config.workspace.root = PathBuf::new();
        let err = validate(&mut config).err();
        assert_eq!(err.as_ref().and_then(field_of), Some(("workspace", "root")));

        let mut config = DemixConfig::default();
        config.engine.model = String::new();
        let err = validate(&mut config).err();
        assert_eq!(err.as_ref().and_then(field_of), Some(("engine", "model")));

        let mut config = DemixConfig::default();
        config.input.accepted_extensions.clear();
        let err = validate(&mut config).err();
        assert_eq!(
            err.as_ref().and_then(field_of),
            Some(("input", "accepted_extensions"))
        );
    }

    #[test]
    fn model_must_be_a_single_component() {
        assert!(validate_model("htdemucs").is_ok());
        assert!(validate_model("../escape").is_err());
        assert!(validate_model("a/b").is_err());
        assert!(validate_model("..").is_err());
        assert!(validate_model(" padded").is_err());
    }

    #[test]
    fn disabled_cache_skips_cache_checks() {
        let mut config = DemixConfig::default();
        config.cache.enabled = false;
        config.cache.max_entries = 0;
        assert!(validate(&mut config).is_ok());
    }
}
