//! Writing uploaded bytes into a job workspace.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::manager::Workspace;

/// Reduce a caller-supplied name to a safe base name.
///
/// Directory components are dropped and characters outside `[A-Za-z0-9._ -]` are
/// replaced with `_`.
///
/// # Errors
///
/// Returns [`WorkspaceError::InvalidInput`] when nothing usable remains.
pub fn sanitize_filename(name: &str) -> WorkspaceResult<String> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_' || c == ' ') {
        return Err(WorkspaceError::invalid_input(
            "filename",
            "empty",
            Some(name.to_string()),
        ));
    }
    Ok(cleaned)
}

/// Lowercase extension of `name` when it is in `accepted`.
///
/// # Errors
///
/// Returns [`WorkspaceError::InvalidInput`] when the name has no extension or the
/// extension is not accepted.
pub fn accepted_extension(name: &str, accepted: &[String]) -> WorkspaceResult<String> {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .ok_or_else(|| {
            WorkspaceError::invalid_input("filename", "missing_extension", Some(name.to_string()))
        })?;
    if accepted.iter().any(|candidate| candidate.eq_ignore_ascii_case(&extension)) {
        Ok(extension)
    } else {
        Err(WorkspaceError::invalid_input(
            "filename",
            "unsupported_extension",
            Some(extension),
        ))
    }
}

/// Write `bytes` into the workspace under a job-scoped name and return its path.
///
/// # Errors
///
/// Returns [`WorkspaceError::InvalidInput`] for unusable names, rejected extensions,
/// or empty payloads, and an IO error if the file cannot be created exclusively.
pub fn stage_input(
    workspace: &Workspace,
    filename: &str,
    bytes: &[u8],
    accepted_extensions: &[String],
) -> WorkspaceResult<PathBuf> {
    let sanitized = sanitize_filename(filename)?;
    accepted_extension(&sanitized, accepted_extensions)?;
    if bytes.is_empty() {
        return Err(WorkspaceError::invalid_input("bytes", "empty", None));
    }

    let path = workspace.input_path(&sanitized);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|source| WorkspaceError::io("stage.create", &path, source))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|source: io::Error| WorkspaceError::io("stage.write", &path, source))?;

    debug!(
        job_id = %workspace.id(),
        path = %path.display(),
        bytes = bytes.len(),
        "input staged"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::JobId;
    use crate::manager::WorkspaceManager;
    use anyhow::Result;
    use std::fs;

    fn accepted() -> Vec<String> {
        vec!["mp3".into(), "wav".into()]
    }

    #[test]
    fn sanitize_strips_directories_and_odd_characters() -> Result<()> {
        assert_eq!(sanitize_filename("../../etc/song.wav")?, "song.wav");
        assert_eq!(sanitize_filename("C:\\music\\my song!.mp3")?, "my song_.mp3");
        assert_eq!(sanitize_filename(".hidden.wav")?, "hidden.wav");
        assert!(sanitize_filename("dir/").is_err());
        assert!(sanitize_filename("..").is_err());
        Ok(())
    }

    #[test]
    fn extension_checks_are_case_insensitive() -> Result<()> {
        assert_eq!(accepted_extension("Mix.WAV", &accepted())?, "wav");
        assert!(matches!(
            accepted_extension("mix.ogg", &accepted()),
            Err(WorkspaceError::InvalidInput {
                reason: "unsupported_extension",
                ..
            })
        ));
        assert!(accepted_extension("mix", &accepted()).is_err());
        Ok(())
    }

    #[test]
    fn stage_writes_job_scoped_file_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = WorkspaceManager::new(dir.path())?;
        let workspace = manager.allocate(&JobId::from_u64(0x51))?;

        let path = stage_input(&workspace, "uploads/song.wav", b"RIFF", &accepted())?;
        assert_eq!(path, workspace.input_dir().join("0000000000000051_song.wav"));
        assert_eq!(fs::read(&path)?, b"RIFF");

        let again = stage_input(&workspace, "song.wav", b"RIFF", &accepted());
        assert!(matches!(again, Err(WorkspaceError::Io { operation: "stage.create", .. })));
        Ok(())
    }

    #[test]
    fn stage_rejects_empty_payload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = WorkspaceManager::new(dir.path())?;
        let workspace = manager.allocate(&JobId::from_u64(0x52))?;
        let result = stage_input(&workspace, "song.mp3", b"", &accepted());
        assert!(matches!(
            result,
            Err(WorkspaceError::InvalidInput { field: "bytes", .. })
        ));
        Ok(())
    }
}
