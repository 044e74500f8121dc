//! Output renderers and formatting helpers for CLI commands.

use std::path::PathBuf;

use anyhow::anyhow;
use demix_app::{JobSnapshot, ReapReport, ReclaimOutcome};
use serde::Serialize;

use crate::cli::OutputFormat;
use crate::client::{CliError, CliResult};

/// Stem written to the caller's output directory.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CopiedStem {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) bytes: u64,
}

#[derive(Serialize)]
struct SeparationSummary<'a> {
    job: &'a JobSnapshot,
    copied: &'a [CopiedStem],
    released: bool,
}

#[derive(Serialize)]
struct CacheSummary<'a> {
    action: &'a str,
    removed: usize,
}

fn print_json(value: &impl Serialize) -> CliResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::failure(anyhow!("failed to format JSON: {err}")))?;
    println!("{text}");
    Ok(())
}

pub(crate) fn render_separation(
    job: &JobSnapshot,
    copied: &[CopiedStem],
    released: bool,
    format: OutputFormat,
) -> CliResult<()> {
    match format {
        OutputFormat::Json => print_json(&SeparationSummary {
            job,
            copied,
            released,
        })?,
        OutputFormat::Table => {
            println!("job: {}", job.id);
            println!("model: {} ({}, {})", job.model, job.device, job.output_format);
            println!("cached: {}", job.cached);
            println!("{:<16} {:>12} PATH", "STEM", "SIZE");
            for stem in copied {
                println!(
                    "{:<16} {:>12} {}",
                    stem.name,
                    format_bytes(stem.bytes),
                    stem.path.display()
                );
            }
            if copied.is_empty() {
                println!("(engine produced no stems)");
            }
            if !released {
                println!("workspace kept: {}", job.id);
            }
        }
    }
    Ok(())
}

pub(crate) fn render_reap_report(report: &ReapReport, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => print_json(report)?,
        OutputFormat::Table => {
            println!(
                "reclaimed: {} (orphans: {}, errors: {})",
                report.reclaimed.len(),
                report.orphans,
                report.errors
            );
            for reclaimed in &report.reclaimed {
                println!(
                    "  {} {:<8} files={} dirs={}",
                    reclaimed.job_id,
                    outcome_to_str(reclaimed.outcome),
                    reclaimed.files_removed,
                    reclaimed.dirs_removed
                );
                for failure in &reclaimed.failures {
                    println!("    left behind {}: {}", failure.path.display(), failure.error);
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn render_cache_count(
    action: &str,
    removed: usize,
    format: OutputFormat,
) -> CliResult<()> {
    match format {
        OutputFormat::Json => print_json(&CacheSummary { action, removed }),
        OutputFormat::Table => {
            println!("{action}: {removed} cache entries removed");
            Ok(())
        }
    }
}

#[must_use]
pub(crate) const fn outcome_to_str(outcome: ReclaimOutcome) -> &'static str {
    match outcome {
        ReclaimOutcome::Reclaimed => "reclaimed",
        ReclaimOutcome::NotAllocated => "absent",
        ReclaimOutcome::Partial => "partial",
    }
}

#[must_use]
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;
    let value = bytes_to_f64(bytes);
    if value >= MIB {
        format!("{:.2} MiB", value / MIB)
    } else if value >= KIB {
        format!("{:.2} KiB", value / KIB)
    } else {
        format!("{bytes} B")
    }
}

fn bytes_to_f64(value: u64) -> f64 {
    let high = u32::try_from(value >> 32).unwrap_or(u32::MAX);
    let low = u32::try_from(value & 0xFFFF_FFFF).unwrap_or(u32::MAX);
    f64::from(high) * 4_294_967_296.0 + f64::from(low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_picks_units() {
        assert_eq!(format_bytes(9), "9 B");
        assert_eq!(format_bytes(2_048), "2.00 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
    }

    #[test]
    fn reap_report_renders_in_both_formats() {
        let report = ReapReport::default();
        assert!(render_reap_report(&report, OutputFormat::Table).is_ok());
        assert!(render_reap_report(&report, OutputFormat::Json).is_ok());
        assert_eq!(outcome_to_str(ReclaimOutcome::NotAllocated), "absent");
    }
}
