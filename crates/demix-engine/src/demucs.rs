//! Process-backed adapter for the demucs command-line separator.
//!
//! # Design
//! - The command line mirrors what `python3 -m demucs.separate` expects; the prefix
//!   (`program` plus `args`) comes from configuration so a wrapper script or a
//!   different launcher can be substituted.
//! - The child is spawned with `kill_on_drop`, so abandoning the job future stops
//!   the engine instead of leaving it writing into a reclaimed workspace.

use std::ffi::OsString;
use std::process::Stdio;

use async_trait::async_trait;
use demix_config::EngineConfig;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::{EngineRequest, SeparationEngine};

/// Maximum diagnostic bytes retained from the engine's output.
const DIAGNOSTIC_TAIL_BYTES: usize = 4 * 1024;

/// Runs demucs (or a compatible program) as a child process.
#[derive(Debug, Clone)]
pub struct DemucsEngine {
    program: String,
    prefix_args: Vec<String>,
}

impl DemucsEngine {
    /// Engine launching `program` with `prefix_args` before the per-job arguments.
    #[must_use]
    pub fn new(program: impl Into<String>, prefix_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args,
        }
    }

    /// Engine described by the `engine` configuration section.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    /// Program that will be executed.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full argument vector for `request`.
    #[must_use]
    pub fn build_args(&self, request: &EngineRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.prefix_args.iter().map(OsString::from).collect();
        if let Some(flag) = request.format.engine_flag() {
            args.push(flag.into());
        }
        args.push("-n".into());
        args.push(request.model.clone().into());
        args.push("--device".into());
        args.push(request.device.engine_arg().into());
        args.push("-o".into());
        args.push(request.output_root.clone().into_os_string());
        args.push(request.input_path.clone().into_os_string());
        args
    }
}

#[async_trait]
impl SeparationEngine for DemucsEngine {
    async fn separate(&self, request: &EngineRequest) -> EngineResult<()> {
        let args = self.build_args(request);
        debug!(program = %self.program, args = ?args, "spawning separation engine");

        let child = Command::new(&self.program)
            .args(&args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| EngineError::Wait {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            info!(program = %self.program, model = %request.model, "separation engine finished");
            return Ok(());
        }

        let diagnostics = diagnostic_tail(&output.stderr, &output.stdout);
        let exit_code = output.status.code();
        warn!(
            program = %self.program,
            exit_code = ?exit_code,
            diagnostics = %diagnostics,
            "separation engine failed"
        );
        Err(EngineError::Failed {
            exit_code,
            diagnostics,
        })
    }
}

fn diagnostic_tail(stderr: &[u8], stdout: &[u8]) -> String {
    let source = if stderr.iter().all(u8::is_ascii_whitespace) {
        stdout
    } else {
        stderr
    };
    let start = source.len().saturating_sub(DIAGNOSTIC_TAIL_BYTES);
    String::from_utf8_lossy(&source[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use demix_config::{Device, OutputFormat};
    use std::path::PathBuf;

    fn request(format: OutputFormat) -> EngineRequest {
        EngineRequest {
            input_path: PathBuf::from("/jobs/00000000000000aa/input/00000000000000aa_song.wav"),
            output_root: PathBuf::from("/jobs/00000000000000aa/separated"),
            working_dir: PathBuf::from("/jobs/00000000000000aa"),
            model: "mdx_extra".into(),
            device: Device::Gpu,
            format,
        }
    }

    #[test]
    fn build_args_matches_demucs_cli() {
        let engine = DemucsEngine::from_config(&EngineConfig::default());
        let args: Vec<String> = engine
            .build_args(&request(OutputFormat::Mp3))
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(engine.program(), "python3");
        assert_eq!(
            args,
            vec![
                "-m",
                "demucs.separate",
                "--mp3",
                "-n",
                "mdx_extra",
                "--device",
                "cuda",
                "-o",
                "/jobs/00000000000000aa/separated",
                "/jobs/00000000000000aa/input/00000000000000aa_song.wav",
            ]
        );
    }

    #[test]
    fn wav_output_omits_format_flag() {
        let engine = DemucsEngine::new("demucs", Vec::new());
        let args = engine.build_args(&request(OutputFormat::Wav));
        assert_eq!(
            args.first().map(OsString::as_os_str),
            Some(std::ffi::OsStr::new("-n"))
        );
    }

    #[test]
    fn diagnostics_prefer_stderr_and_keep_the_tail() {
        assert_eq!(diagnostic_tail(b"oops\n", b"progress"), "oops");
        assert_eq!(diagnostic_tail(b"  \n", b"only stdout\n"), "only stdout");
        let long = vec![b'x'; DIAGNOSTIC_TAIL_BYTES + 100];
        assert_eq!(diagnostic_tail(&long, b"").len(), DIAGNOSTIC_TAIL_BYTES);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_reported_with_diagnostics() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = DemucsEngine::new(
            "sh",
            vec!["-c".into(), "echo 'model missing' >&2; exit 3".into(), "engine".into()],
        );
        let mut req = request(OutputFormat::Mp3);
        req.working_dir = dir.path().to_path_buf();
        let err = engine.separate(&req).await.err();
        match err {
            Some(EngineError::Failed {
                exit_code,
                diagnostics,
            }) => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(diagnostics, "model missing");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn engine_runs_in_workspace_with_positional_arguments() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = DemucsEngine::new(
            "sh",
            vec![
                "-c".into(),
                r#"printf '%s\n' "$@" > args.txt"#.into(),
                "engine".into(),
            ],
        );
        let mut req = request(OutputFormat::Flac);
        req.working_dir = dir.path().to_path_buf();
        engine.separate(&req).await?;

        let recorded = std::fs::read_to_string(dir.path().join("args.txt"))?;
        let lines: Vec<&str> = recorded.lines().collect();
        assert_eq!(lines[0], "--flac");
        assert_eq!(lines[2], "mdx_extra");
        let expected_input = req.input_path.to_string_lossy().into_owned();
        assert_eq!(lines.last().copied(), Some(expected_input.as_str()));
        Ok(())
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = DemucsEngine::new("demix-definitely-not-installed", Vec::new());
        let mut req = request(OutputFormat::Mp3);
        req.working_dir = dir.path().to_path_buf();
        assert!(matches!(
            engine.separate(&req).await,
            Err(EngineError::Spawn { .. })
        ));
        Ok(())
    }
}
