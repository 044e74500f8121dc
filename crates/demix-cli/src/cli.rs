//! Argument parsing, telemetry setup, and command dispatch.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use demix_app::{AppContext, init_telemetry, load_config};
use demix_config::{DemixConfig, Device, LogFormatSetting, OutputFormat as StemFormat};
use demix_telemetry::InvocationGuard;
use tracing::debug;

use crate::client::{CliError, CliResult};
use crate::commands::cache::{handle_cache_clear, handle_cache_purge};
use crate::commands::config::handle_config_show;
use crate::commands::reap::handle_reap;
use crate::commands::separate::handle_separate;

/// Parses CLI arguments, executes the requested command, and reports failures on
/// stderr. Returns the process exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {}", err.display_message());
            err.exit_code()
        }
    }
}

async fn dispatch(cli: Cli) -> CliResult<()> {
    let mut config = load_config(cli.config.clone())?;
    apply_log_overrides(&mut config, &cli);
    init_telemetry(&config.telemetry).map_err(CliError::from)?;
    let invocation = InvocationGuard::enter("cli");
    let label = command_label(&cli.command);
    invocation.record_command(label);
    debug!(command = label, "dispatching command");

    match cli.command {
        Command::Separate(args) => {
            let ctx = AppContext::from_config(config)?;
            handle_separate(&ctx, args, cli.output).await
        }
        Command::Reap(args) => {
            let ctx = AppContext::from_config(config)?;
            handle_reap(&ctx, &args, cli.output).await
        }
        Command::Cache(cache) => match cache {
            CacheCommand::Purge => handle_cache_purge(&config, cli.output).await,
            CacheCommand::Clear => handle_cache_clear(&config, cli.output).await,
        },
        Command::Config(ConfigCommand::Show) => handle_config_show(&config, cli.output),
    }
}

fn apply_log_overrides(config: &mut DemixConfig, cli: &Cli) {
    if let Some(level) = &cli.log_level {
        config.telemetry.log_level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.telemetry.log_format = match format {
            LogFormatArg::Pretty => LogFormatSetting::Pretty,
            LogFormatArg::Json => LogFormatSetting::Json,
        };
    }
}

const fn command_label(command: &Command) -> &'static str {
    match command {
        Command::Separate(_) => "separate",
        Command::Reap(_) => "reap",
        Command::Cache(CacheCommand::Purge) => "cache_purge",
        Command::Cache(CacheCommand::Clear) => "cache_clear",
        Command::Config(ConfigCommand::Show) => "config_show",
    }
}

#[derive(Parser)]
#[command(name = "demix", about = "Separate audio mixes into stems in isolated job workspaces")]
pub(crate) struct Cli {
    #[arg(long, global = true, env = "DEMIX_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    #[arg(long, global = true, help = "Override the configured log level")]
    pub(crate) log_level: Option<String>,
    #[arg(long, global = true, value_enum)]
    pub(crate) log_format: Option<LogFormatArg>,
    #[arg(
        long = "output",
        global = true,
        value_enum,
        default_value_t = OutputFormat::Table,
        help = "Select output format for commands that render structured data"
    )]
    pub(crate) output: OutputFormat,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Separate one audio file into stems.
    Separate(SeparateArgs),
    /// Reclaim workspaces left behind by earlier runs.
    Reap(ReapArgs),
    /// Maintain the result cache.
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
pub(crate) enum CacheCommand {
    /// Remove expired entries.
    Purge,
    /// Remove every entry.
    Clear,
}

#[derive(Subcommand)]
pub(crate) enum ConfigCommand {
    /// Print the effective configuration.
    Show,
}

#[derive(Args)]
pub(crate) struct SeparateArgs {
    /// Audio file to separate.
    pub(crate) input: PathBuf,
    #[arg(long)]
    pub(crate) model: Option<String>,
    #[arg(long)]
    pub(crate) device: Option<Device>,
    #[arg(long)]
    pub(crate) format: Option<StemFormat>,
    /// Directory receiving the stems; defaults to `stems/<input name>`.
    #[arg(long)]
    pub(crate) out: Option<PathBuf>,
    /// Keep the job workspace instead of releasing it.
    #[arg(long)]
    pub(crate) keep: bool,
}

#[derive(Args)]
pub(crate) struct ReapArgs {
    /// Idle threshold; defaults to the configured `abandon_after_secs`.
    #[arg(long)]
    pub(crate) older_than_secs: Option<u64>,
    /// Keep sweeping at the configured interval until interrupted.
    #[arg(long)]
    pub(crate) watch: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Table,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormatArg {
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn separate_parses_engine_overrides() -> Result<(), clap::Error> {
        let cli = Cli::try_parse_from([
            "demix",
            "--output",
            "json",
            "separate",
            "song.flac",
            "--model",
            "htdemucs",
            "--device",
            "gpu",
            "--format",
            "wav",
            "--keep",
        ])?;
        assert_eq!(cli.output, OutputFormat::Json);
        let Command::Separate(args) = cli.command else {
            panic!("expected separate command");
        };
        assert_eq!(args.input, PathBuf::from("song.flac"));
        assert_eq!(args.model.as_deref(), Some("htdemucs"));
        assert_eq!(args.device, Some(Device::Gpu));
        assert_eq!(args.format, Some(StemFormat::Wav));
        assert!(args.keep);
        assert!(args.out.is_none());
        Ok(())
    }

    #[test]
    fn unknown_device_is_rejected_by_the_parser() {
        let parsed = Cli::try_parse_from(["demix", "separate", "a.wav", "--device", "tpu"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn log_overrides_replace_configured_values() -> Result<(), clap::Error> {
        let cli = Cli::try_parse_from([
            "demix",
            "--log-level",
            "debug",
            "--log-format",
            "json",
            "config",
            "show",
        ])?;
        let mut config = DemixConfig::default();
        apply_log_overrides(&mut config, &cli);
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.telemetry.log_format, LogFormatSetting::Json);
        assert_eq!(command_label(&cli.command), "config_show");
        Ok(())
    }
}
