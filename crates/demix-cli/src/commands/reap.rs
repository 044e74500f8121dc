use std::future::Future;
use std::time::Duration;

use anyhow::{Context, anyhow};
use demix_app::AppContext;
use tracing::info;

use crate::cli::{OutputFormat, ReapArgs};
use crate::client::{CliError, CliResult};
use crate::output::render_reap_report;

pub(crate) async fn handle_reap(
    ctx: &AppContext,
    args: &ReapArgs,
    format: OutputFormat,
) -> CliResult<()> {
    let max_age = args
        .older_than_secs
        .map_or_else(|| ctx.config.workspace.abandon_after(), Duration::from_secs);
    if args.watch {
        return watch_until(ctx, max_age, async {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")
        })
        .await;
    }

    let report = ctx.orchestrator.reap_abandoned(max_age).await?;
    render_reap_report(&report, format)?;
    if report.is_clean() {
        Ok(())
    } else {
        Err(CliError::failure(anyhow!(
            "{} workspaces could not be fully reclaimed",
            report.errors
                + report
                    .reclaimed
                    .iter()
                    .filter(|reclaimed| !reclaimed.is_complete())
                    .count()
        )))
    }
}

/// Run the periodic reaper until `shutdown` resolves.
async fn watch_until(
    ctx: &AppContext,
    max_age: Duration,
    shutdown: impl Future<Output = anyhow::Result<()>>,
) -> CliResult<()> {
    let mut reaper = ctx.spawn_reaper(max_age);
    info!(
        interval_secs = ctx.config.workspace.reap_interval().as_secs(),
        max_age_secs = max_age.as_secs(),
        "reaper watching workspaces"
    );
    let outcome = tokio::select! {
        stopped = shutdown => stopped,
        joined = &mut reaper => Err(anyhow!("reaper stopped unexpectedly: {joined:?}")),
    };
    reaper.abort();
    info!("reaper stopped");
    outcome.map_err(CliError::failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use demix_app::JobId;
    use demix_test_support::fixtures::{scratch_dir, test_config};
    use demix_test_support::mocks::StubEngine;
    use demix_workspace::IdentityGenerator;
    use std::sync::Arc;

    #[tokio::test]
    async fn reap_reclaims_leftover_workspaces() -> Result<()> {
        let dir = scratch_dir()?;
        let ctx = AppContext::with_engine(
            test_config(dir.path()),
            Arc::new(StubEngine::drums_and_vocals()),
            IdentityGenerator::random(),
        )?;
        let leftover = ctx
            .config
            .workspace
            .root
            .join(JobId::from_u64(0x5eed).as_str());
        std::fs::create_dir_all(leftover.join("separated"))?;
        tokio::time::sleep(Duration::from_millis(25)).await;

        let keep = ReapArgs {
            older_than_secs: None,
            watch: false,
        };
        assert!(handle_reap(&ctx, &keep, OutputFormat::Table).await.is_ok());
        assert!(leftover.is_dir());

        let now = ReapArgs {
            older_than_secs: Some(0),
            watch: false,
        };
        assert!(handle_reap(&ctx, &now, OutputFormat::Json).await.is_ok());
        assert!(!leftover.exists());
        Ok(())
    }

    #[tokio::test]
    async fn watch_sweeps_until_shutdown() -> Result<()> {
        let dir = scratch_dir()?;
        let ctx = AppContext::with_engine(
            test_config(dir.path()),
            Arc::new(StubEngine::drums_and_vocals()),
            IdentityGenerator::random(),
        )?;
        let leftover = ctx
            .config
            .workspace
            .root
            .join(JobId::from_u64(0xa11).as_str());
        std::fs::create_dir_all(leftover.join("input"))?;
        let watched = leftover.clone();

        let result = watch_until(&ctx, Duration::ZERO, async move {
            tokio::time::timeout(Duration::from_secs(5), async {
                while watched.exists() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .context("leftover workspace was never reaped")
        })
        .await;
        assert!(result.is_ok());
        assert!(!leftover.exists());
        Ok(())
    }
}
