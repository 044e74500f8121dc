use std::path::{Path, PathBuf};

use anyhow::Context;
use demix_app::{AppContext, JobSnapshot, SubmitRequest};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::cli::{OutputFormat, SeparateArgs};
use crate::client::{CliError, CliResult};
use crate::output::{CopiedStem, render_separation};

const DEFAULT_OUT_ROOT: &str = "stems";

pub(crate) async fn handle_separate(
    ctx: &AppContext,
    args: SeparateArgs,
    format: OutputFormat,
) -> CliResult<()> {
    let filename = args
        .input
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            CliError::validation(format!("{} does not name a file", args.input.display()))
        })?
        .to_string();
    let bytes = fs::read(&args.input)
        .await
        .with_context(|| format!("failed to read {}", args.input.display()))
        .map_err(CliError::failure)?;

    let mut request = SubmitRequest::new(filename, bytes);
    if let Some(model) = args.model {
        request = request.with_model(model);
    }
    if let Some(device) = args.device {
        request = request.with_device(device);
    }
    if let Some(stem_format) = args.format {
        request = request.with_format(stem_format);
    }

    let job = ctx.orchestrator.submit(request).await?;
    let out_dir = args.out.unwrap_or_else(|| default_out_dir(&args.input));
    let copied = copy_stems(ctx, &job, &out_dir).await;

    let released = if args.keep {
        info!(job_id = %job.id, "workspace kept on request");
        false
    } else {
        match ctx.orchestrator.release(&job.id).await {
            Ok(_) => true,
            Err(err) if copied.is_err() => {
                warn!(job_id = %job.id, error = %err, "release after failed copy also failed");
                false
            }
            Err(err) => return Err(err.into()),
        }
    };

    let copied = copied?;
    render_separation(&job, &copied, released, format)
}

async fn copy_stems(
    ctx: &AppContext,
    job: &JobSnapshot,
    out_dir: &Path,
) -> CliResult<Vec<CopiedStem>> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("failed to create {}", out_dir.display()))
        .map_err(CliError::failure)?;

    let mut copied = Vec::with_capacity(job.stems.len());
    for index in 0..job.stems.len() {
        let mut download = ctx.orchestrator.open_output(&job.id, index).await?;
        let path = out_dir.join(&download.name);
        let mut target = fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))
            .map_err(CliError::failure)?;
        let bytes = tokio::io::copy(&mut download.file, &mut target)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
            .map_err(CliError::failure)?;
        target
            .flush()
            .await
            .with_context(|| format!("failed to flush {}", path.display()))
            .map_err(CliError::failure)?;
        copied.push(CopiedStem {
            name: download.name,
            path,
            bytes,
        });
    }
    Ok(copied)
}

fn default_out_dir(input: &Path) -> PathBuf {
    let name = input
        .file_stem()
        .map_or_else(|| "input".into(), ToOwned::to_owned);
    Path::new(DEFAULT_OUT_ROOT).join(name)
}
