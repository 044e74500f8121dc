use demix_config::DemixConfig;
use demix_config::loader::render_yaml;

use crate::cli::OutputFormat;
use crate::client::{CliError, CliResult};

pub(crate) fn handle_config_show(config: &DemixConfig, format: OutputFormat) -> CliResult<()> {
    let text = match format {
        OutputFormat::Json => serde_json::to_string_pretty(config).map_err(CliError::failure)?,
        OutputFormat::Table => render_yaml(config).map_err(CliError::failure)?,
    };
    println!("{}", text.trim_end());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_config_renders_in_both_formats() {
        let config = DemixConfig::default();
        assert!(handle_config_show(&config, OutputFormat::Table).is_ok());
        assert!(handle_config_show(&config, OutputFormat::Json).is_ok());
    }
}
