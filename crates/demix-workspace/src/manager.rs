//! Workspace allocation, lookup, and reclamation.
//!
//! # Design
//! - The workspace path is a pure function of the job id; ids are validated to be a
//!   single path component, so two jobs can never resolve to overlapping trees.
//! - Allocation uses a non-recursive `create_dir` on the job directory: anything
//!   already at that path is a collision and is left untouched.
//! - Reclamation walks only the job's own subtree, never follows symlinks, and keeps
//!   going past individual failures, reporting them instead.

use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::identity::JobId;
use crate::meta::{JobStatus, load_ledger};

const LEDGER_FILE: &str = "job.json";
const INPUT_DIR: &str = "input";
const SEPARATED_DIR: &str = "separated";

/// Paths owned by one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    id: JobId,
    dir: PathBuf,
}

impl Workspace {
    /// Owning job.
    #[must_use]
    pub const fn id(&self) -> &JobId {
        &self.id
    }

    /// Root of the job's subtree.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding the staged input.
    #[must_use]
    pub fn input_dir(&self) -> PathBuf {
        self.dir.join(INPUT_DIR)
    }

    /// Output root handed to the engine.
    #[must_use]
    pub fn separated_dir(&self) -> PathBuf {
        self.dir.join(SEPARATED_DIR)
    }

    /// Location of the job ledger.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.dir.join(LEDGER_FILE)
    }

    /// Job-scoped location for an already sanitised input file name.
    #[must_use]
    pub fn input_path(&self, sanitized_name: &str) -> PathBuf {
        self.input_dir()
            .join(format!("{}_{sanitized_name}", self.id))
    }

    /// Directory the engine writes stems into for `input_path` under `model`.
    ///
    /// This is the only place the `<separated>/<model>/<input stem>` convention is
    /// encoded; both engine invocation and cache restoration go through it.
    #[must_use]
    pub fn engine_output_dir(&self, model: &str, input_path: &Path) -> PathBuf {
        let stem = input_path
            .file_stem()
            .map_or_else(|| self.id.to_string().into(), ToOwned::to_owned);
        self.separated_dir().join(model).join(stem)
    }
}

/// Outcome of a reclamation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimOutcome {
    /// The whole subtree was removed.
    Reclaimed,
    /// Nothing existed for the id.
    NotAllocated,
    /// Some entries could not be removed.
    Partial,
}

/// Entry that could not be removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimFailure {
    /// Path that survived.
    pub path: PathBuf,
    /// Error text.
    pub error: String,
}

/// Result of [`WorkspaceManager::reclaim`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Job the report belongs to.
    pub job_id: String,
    /// Overall outcome.
    pub outcome: ReclaimOutcome,
    /// Regular files and links removed.
    pub files_removed: usize,
    /// Directories removed.
    pub dirs_removed: usize,
    /// Entries left behind.
    pub failures: Vec<ReclaimFailure>,
}

impl ReclaimReport {
    fn new(job_id: &JobId) -> Self {
        Self {
            job_id: job_id.to_string(),
            outcome: ReclaimOutcome::Reclaimed,
            files_removed: 0,
            dirs_removed: 0,
            failures: Vec::new(),
        }
    }

    /// Whether every entry was removed (or there was nothing to remove).
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        !matches!(self.outcome, ReclaimOutcome::Partial)
    }

    fn record_failure(&mut self, path: &Path, error: &impl Display) {
        self.failures.push(ReclaimFailure {
            path: path.to_path_buf(),
            error: error.to_string(),
        });
    }
}

/// A job directory found under the workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedWorkspace {
    /// Job that owns the directory.
    pub id: JobId,
    /// Directory path.
    pub path: PathBuf,
    /// Ledger `updated_at`, or the directory mtime when no ledger is readable.
    pub last_activity: DateTime<Utc>,
    /// Status recorded in the ledger, if one was readable.
    pub status: Option<JobStatus>,
}

/// Owner of the workspace root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Manager rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created or is not a directory.
    pub fn new(root: impl Into<PathBuf>) -> WorkspaceResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|source| WorkspaceError::io("workspace.create_root", &root, source))?;
        Ok(Self { root })
    }

    /// Parent directory of all job workspaces.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path derivation for `id` without touching the filesystem.
    #[must_use]
    pub fn workspace(&self, id: &JobId) -> Workspace {
        Workspace {
            id: id.clone(),
            dir: self.root.join(id.as_str()),
        }
    }

    /// Whether anything exists at the workspace path for `id`.
    #[must_use]
    pub fn is_allocated(&self, id: &JobId) -> bool {
        fs::symlink_metadata(self.root.join(id.as_str())).is_ok()
    }

    /// Create a fresh, exclusive subtree for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::AlreadyAllocated`] if anything already exists at
    /// the job path, or an IO error if the directories cannot be created.
    pub fn allocate(&self, id: &JobId) -> WorkspaceResult<Workspace> {
        let workspace = self.workspace(id);
        match fs::create_dir(workspace.dir()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                warn!(
                    job_id = %id,
                    path = %workspace.dir().display(),
                    "refusing to allocate over an existing workspace"
                );
                return Err(WorkspaceError::AlreadyAllocated {
                    job_id: id.to_string(),
                    path: workspace.dir().to_path_buf(),
                });
            }
            Err(source) => {
                return Err(WorkspaceError::io("allocate.create_dir", workspace.dir(), source));
            }
        }

        for sub in [workspace.input_dir(), workspace.separated_dir()] {
            if let Err(source) = fs::create_dir(&sub) {
                self.roll_back(id);
                return Err(WorkspaceError::io("allocate.create_subdir", sub, source));
            }
        }

        debug!(job_id = %id, path = %workspace.dir().display(), "workspace allocated");
        Ok(workspace)
    }

    fn roll_back(&self, id: &JobId) {
        match self.reclaim(id) {
            Ok(report) if report.is_complete() => {}
            Ok(report) => {
                for failure in &report.failures {
                    warn!(
                        job_id = %id,
                        path = %failure.path.display(),
                        error = %failure.error,
                        "partial allocation left an entry behind"
                    );
                }
            }
            Err(err) => {
                warn!(job_id = %id, error = %err, "failed to roll back partial allocation");
            }
        }
    }

    /// Remove exactly the subtree owned by `id`.
    ///
    /// Reclaiming an id with nothing on disk reports [`ReclaimOutcome::NotAllocated`].
    /// Individual deletion failures are collected in the report rather than aborting.
    ///
    /// # Errors
    ///
    /// Returns an error only if the job path itself cannot be inspected.
    pub fn reclaim(&self, id: &JobId) -> WorkspaceResult<ReclaimReport> {
        let dir = self.root.join(id.as_str());
        let mut report = ReclaimReport::new(id);

        let metadata = match fs::symlink_metadata(&dir) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                report.outcome = ReclaimOutcome::NotAllocated;
                debug!(job_id = %id, "nothing to reclaim");
                return Ok(report);
            }
            Err(source) => return Err(WorkspaceError::io("reclaim.stat", &dir, source)),
        };

        if metadata.is_dir() {
            for entry in WalkDir::new(&dir).follow_links(false).contents_first(true) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        let path = err.path().unwrap_or(dir.as_path()).to_path_buf();
                        warn!(
                            error = %err,
                            job_id = %id,
                            path = %path.display(),
                            "failed to traverse workspace during reclaim"
                        );
                        report.record_failure(&path, &err);
                        continue;
                    }
                };
                let removal = if entry.file_type().is_dir() {
                    fs::remove_dir(entry.path()).map(|()| report.dirs_removed += 1)
                } else {
                    fs::remove_file(entry.path()).map(|()| report.files_removed += 1)
                };
                if let Err(err) = removal {
                    warn!(
                        error = %err,
                        job_id = %id,
                        path = %entry.path().display(),
                        "failed to remove workspace entry"
                    );
                    report.record_failure(entry.path(), &err);
                }
            }
        } else {
            match fs::remove_file(&dir) {
                Ok(()) => report.files_removed += 1,
                Err(err) => report.record_failure(&dir, &err),
            }
        }

        if report.failures.is_empty() {
            info!(
                job_id = %id,
                files = report.files_removed,
                dirs = report.dirs_removed,
                "workspace reclaimed"
            );
        } else {
            report.outcome = ReclaimOutcome::Partial;
            warn!(
                job_id = %id,
                failures = report.failures.len(),
                "workspace partially reclaimed"
            );
        }
        Ok(report)
    }

    /// Enumerate job directories under the root.
    ///
    /// Entries whose names are not job ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be listed.
    pub fn list_allocated(&self) -> WorkspaceResult<Vec<AllocatedWorkspace>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|source| WorkspaceError::io("workspace.list", &self.root, source))?;

        let mut found = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, root = %self.root.display(), "failed to read workspace entry");
                    continue;
                }
            };
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| JobId::parse(name).ok())
            else {
                continue;
            };
            let path = entry.path();
            let workspace = self.workspace(&id);
            let (last_activity, status) = match load_ledger(&workspace.ledger_path()) {
                Ok(ledger) => (ledger.updated_at, Some(ledger.status)),
                Err(_) => (directory_mtime(&path), None),
            };
            found.push(AllocatedWorkspace {
                id,
                path,
                last_activity,
                status,
            });
        }
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}

fn directory_mtime(path: &Path) -> DateTime<Utc> {
    fs::symlink_metadata(path)
        .and_then(|metadata| metadata.modified())
        .map_or_else(|_| Utc::now(), DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{JobLedger, persist_ledger};
    use anyhow::Result;
    use demix_config::{Device, OutputFormat};

    fn manager() -> Result<(tempfile::TempDir, WorkspaceManager)> {
        let dir = tempfile::tempdir()?;
        let manager = WorkspaceManager::new(dir.path().join("jobs"))?;
        Ok((dir, manager))
    }

    #[test]
    fn allocate_creates_job_subtree() -> Result<()> {
        let (_dir, manager) = manager()?;
        let id = JobId::from_u64(1);
        let workspace = manager.allocate(&id)?;
        assert!(workspace.input_dir().is_dir());
        assert!(workspace.separated_dir().is_dir());
        assert_eq!(workspace.dir(), manager.root().join("0000000000000001"));
        assert!(manager.is_allocated(&id));
        Ok(())
    }

    #[test]
    fn duplicate_allocation_fails_and_preserves_original() -> Result<()> {
        let (_dir, manager) = manager()?;
        let id = JobId::from_u64(2);
        let workspace = manager.allocate(&id)?;
        let marker = workspace.input_dir().join("keep.wav");
        fs::write(&marker, b"original")?;

        let err = manager.allocate(&id).err();
        assert!(matches!(err, Some(WorkspaceError::AlreadyAllocated { .. })));
        assert_eq!(fs::read(&marker)?, b"original");
        Ok(())
    }

    #[test]
    fn distinct_ids_resolve_to_disjoint_paths() -> Result<()> {
        let (_dir, manager) = manager()?;
        let a = manager.workspace(&JobId::from_u64(10));
        let b = manager.workspace(&JobId::from_u64(11));
        assert_ne!(a.dir(), b.dir());
        assert!(!a.dir().starts_with(b.dir()) && !b.dir().starts_with(a.dir()));
        Ok(())
    }

    #[test]
    fn reclaim_is_idempotent_and_scoped() -> Result<()> {
        let (_dir, manager) = manager()?;
        let a = manager.allocate(&JobId::from_u64(3))?;
        let b = manager.allocate(&JobId::from_u64(4))?;
        fs::write(a.input_dir().join("a.wav"), b"a")?;
        fs::create_dir_all(a.separated_dir().join("mdx_extra/a"))?;
        fs::write(a.separated_dir().join("mdx_extra/a/drums.mp3"), b"d")?;
        fs::write(b.input_dir().join("b.wav"), b"b")?;

        let first = manager.reclaim(a.id())?;
        assert_eq!(first.outcome, ReclaimOutcome::Reclaimed);
        assert_eq!(first.files_removed, 2);
        assert!(first.dirs_removed >= 5);
        assert!(!a.dir().exists());

        let second = manager.reclaim(a.id())?;
        assert_eq!(second.outcome, ReclaimOutcome::NotAllocated);
        assert!(second.is_complete());

        assert_eq!(fs::read(b.input_dir().join("b.wav"))?, b"b");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn reclaim_removes_symlinks_without_following() -> Result<()> {
        let (dir, manager) = manager()?;
        let outside = dir.path().join("outside");
        fs::create_dir(&outside)?;
        fs::write(outside.join("precious.txt"), b"keep")?;

        let workspace = manager.allocate(&JobId::from_u64(5))?;
        std::os::unix::fs::symlink(&outside, workspace.input_dir().join("link"))?;

        let report = manager.reclaim(workspace.id())?;
        assert_eq!(report.outcome, ReclaimOutcome::Reclaimed);
        assert_eq!(fs::read(outside.join("precious.txt"))?, b"keep");
        Ok(())
    }

    #[test]
    fn engine_output_dir_follows_input_stem() -> Result<()> {
        let (_dir, manager) = manager()?;
        let workspace = manager.workspace(&JobId::from_u64(6));
        let input = workspace.input_path("song.wav");
        assert_eq!(
            input.file_name().and_then(|n| n.to_str()),
            Some("0000000000000006_song.wav")
        );
        assert_eq!(
            workspace.engine_output_dir("mdx_extra", &input),
            workspace
                .dir()
                .join("separated/mdx_extra/0000000000000006_song")
        );
        Ok(())
    }

    #[test]
    fn list_allocated_reads_ledgers_and_skips_foreign_entries() -> Result<()> {
        let (_dir, manager) = manager()?;
        let with_ledger = manager.allocate(&JobId::from_u64(8))?;
        let mut ledger = JobLedger::new(
            with_ledger.id().clone(),
            "mdx_extra",
            Device::Cpu,
            OutputFormat::Mp3,
            "x.wav",
        );
        ledger.set_status(JobStatus::Completed);
        persist_ledger(&with_ledger.ledger_path(), &ledger)?;
        let _bare = manager.allocate(&JobId::from_u64(9))?;
        fs::create_dir(manager.root().join("lost+found"))?;

        let listed = manager.list_allocated()?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].status, Some(JobStatus::Completed));
        assert_eq!(listed[0].last_activity, ledger.updated_at);
        assert_eq!(listed[1].status, None);
        Ok(())
    }

    #[test]
    fn roll_back_removes_a_half_built_workspace() -> Result<()> {
        let (_dir, manager) = manager()?;
        let id = JobId::from_u64(12);
        let workspace = manager.workspace(&id);
        fs::create_dir_all(workspace.input_dir())?;

        manager.roll_back(&id);
        assert!(!manager.is_allocated(&id));
        manager.roll_back(&id);
        Ok(())
    }

    /// Strips write permission from a directory until dropped.
    #[cfg(unix)]
    struct ReadOnly(PathBuf);

    #[cfg(unix)]
    impl ReadOnly {
        /// `None` when the process can write regardless, as root can.
        fn lock(path: &Path) -> Result<Option<Self>> {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o555))?;
            let guard = Self(path.to_path_buf());
            let check = path.join(".write-check");
            if fs::write(&check, b"").is_ok() {
                fs::remove_file(&check)?;
                return Ok(None);
            }
            Ok(Some(guard))
        }
    }

    #[cfg(unix)]
    impl Drop for ReadOnly {
        fn drop(&mut self) {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.0, fs::Permissions::from_mode(0o755));
        }
    }

    #[cfg(unix)]
    #[test]
    fn reclaim_continues_past_undeletable_entries() -> Result<()> {
        let (_dir, manager) = manager()?;
        let id = JobId::from_u64(13);
        let workspace = manager.allocate(&id)?;
        let staged = workspace.input_dir().join("keep.wav");
        fs::write(&staged, b"input")?;
        let stuck_dir = workspace.separated_dir().join("mdx_extra");
        fs::create_dir(&stuck_dir)?;
        let stuck = stuck_dir.join("drums.mp3");
        fs::write(&stuck, b"drums")?;

        let Some(guard) = ReadOnly::lock(&stuck_dir)? else {
            return Ok(());
        };
        let report = manager.reclaim(&id)?;
        assert_eq!(report.outcome, ReclaimOutcome::Partial);
        assert!(!report.is_complete());
        assert!(!staged.exists());
        assert!(!workspace.input_dir().exists());
        assert!(report.files_removed >= 1);
        assert!(report.failures.iter().any(|failure| failure.path == stuck));
        assert!(stuck.exists());

        drop(guard);
        let retry = manager.reclaim(&id)?;
        assert_eq!(retry.outcome, ReclaimOutcome::Reclaimed);
        assert!(!manager.is_allocated(&id));
        Ok(())
    }
}
