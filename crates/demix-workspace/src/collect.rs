//! Discovery of the stems an engine run produced.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use demix_config::OutputFormat;
use serde::Serialize;
use tracing::debug;

use crate::error::{WorkspaceError, WorkspaceResult};

/// One produced stem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StemFile {
    /// File name, e.g. `vocals.mp3`.
    pub name: String,
    /// Absolute or root-relative location.
    pub path: PathBuf,
    /// Media type for streaming.
    pub media_type: &'static str,
}

/// List regular files in `output_dir` with the extension of `format`, sorted by name.
///
/// An existing but empty directory yields an empty list.
///
/// # Errors
///
/// Returns [`WorkspaceError::MissingOutput`] if `output_dir` does not exist or is not
/// a directory, and an IO error if it cannot be listed.
pub fn collect_stems(output_dir: &Path, format: OutputFormat) -> WorkspaceResult<Vec<StemFile>> {
    match fs::symlink_metadata(output_dir) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(WorkspaceError::MissingOutput {
                path: output_dir.to_path_buf(),
            });
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(WorkspaceError::MissingOutput {
                path: output_dir.to_path_buf(),
            });
        }
        Err(source) => return Err(WorkspaceError::io("collect.stat", output_dir, source)),
    }

    let entries = fs::read_dir(output_dir)
        .map_err(|source| WorkspaceError::io("collect.list", output_dir, source))?;
    let mut stems = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| WorkspaceError::io("collect.entry", output_dir, source))?;
        let file_type = entry
            .file_type()
            .map_err(|source| WorkspaceError::io("collect.file_type", entry.path(), source))?;
        if !file_type.is_file() {
            continue;
        }
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(format.extension()));
        if !matches {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        stems.push(StemFile {
            name,
            path,
            media_type: format.media_type(),
        });
    }
    stems.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(dir = %output_dir.display(), count = stems.len(), "stems collected");
    Ok(stems)
}
