//! Job orchestrator: owns the registry of live jobs and drives each one through
//! allocate, stage, invoke, collect, and release.
//!
//! # Design
//! - Every job is an independent state machine (`staged -> running -> completed | failed`).
//!   Nothing but the registry map is shared between jobs.
//! - The registry lock is taken for map reads and updates only; staging, engine runs,
//!   collection, cache work and reclamation all happen with it released.
//! - Ids are reserved in the registry before the workspace exists, so a concurrent
//!   submission can never draw the same id.
//! - Filesystem work runs on the blocking pool.
//! - Reclamation happens on explicit `release`, on failure when the retention policy
//!   says so, or from the reaper. It never happens while a download lease is alive.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use demix_config::{DemixConfig, Device, OutputFormat, RetentionPolicy, validate::validate_model};
use demix_engine::EngineInvoker;
use demix_events::{Event, EventBus};
use demix_telemetry::{Metrics, job_span};
use demix_workspace::{
    IdentityGenerator, JobId, JobLedger, JobStatus, ReclaimOutcome, ReclaimReport, StemFile,
    StepKind, StepStatus, Workspace, WorkspaceError, WorkspaceManager, collect_stems,
    persist_ledger, sanitize_filename, stage_input, staging::accepted_extension,
};
use tokio::fs::File;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::cache::{CacheKey, CachedResult, ResultCache};
use crate::error::{CacheResult, JobError, JobResult, describe};
use crate::job::{JobSnapshot, OutputLease, StemDownload, SubmitRequest, open_leases};
use crate::reaper::ReapReport;

const HEALTH_COMPONENT: &str = "separation";

/// Engine defaults and input limits applied to every submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    /// Model used when a request does not name one.
    pub model: String,
    /// Device used when a request does not name one.
    pub device: Device,
    /// Stem format used when a request does not name one.
    pub format: OutputFormat,
    /// Lowercase extensions accepted for uploads.
    pub accepted_extensions: Vec<String>,
    /// Largest accepted upload.
    pub max_input_bytes: u64,
    /// What happens to a failed job's workspace.
    pub on_failure: RetentionPolicy,
}

impl JobSettings {
    /// Settings taken from a validated configuration.
    #[must_use]
    pub fn from_config(config: &DemixConfig) -> Self {
        Self {
            model: config.engine.model.clone(),
            device: config.engine.device,
            format: config.engine.output_format,
            accepted_extensions: config.input.accepted_extensions.clone(),
            max_input_bytes: config.input.max_input_bytes,
            on_failure: config.retention.on_failure,
        }
    }
}

/// Engine settings resolved for one submission.
#[derive(Debug, Clone)]
struct JobPlan {
    filename: String,
    model: String,
    device: Device,
    format: OutputFormat,
}

struct JobEntry {
    ledger: JobLedger,
    workspace: Workspace,
    stems: Vec<StemFile>,
    lease: Arc<()>,
    retained: bool,
    /// Held while the ledger is written. Unregistering paths wait on it before
    /// touching the workspace.
    ledger_write: Arc<AsyncMutex<()>>,
}

impl JobEntry {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::from_ledger(
            &self.ledger,
            &self.stems,
            open_leases(&self.lease),
            self.retained,
        )
    }

    fn is_allocated(&self) -> bool {
        self.ledger.step_status(StepKind::Allocate) == Some(StepStatus::Completed)
    }
}

/// Coordinates job lifecycles over a shared workspace root.
pub struct JobOrchestrator {
    workspaces: WorkspaceManager,
    identity: IdentityGenerator,
    invoker: EngineInvoker,
    cache: Option<Arc<ResultCache>>,
    settings: JobSettings,
    events: EventBus,
    metrics: Metrics,
    registry: RwLock<HashMap<JobId, JobEntry>>,
    health_degraded: Mutex<bool>,
}

impl JobOrchestrator {
    /// Orchestrator over `workspaces`, running jobs through `invoker`.
    #[must_use]
    pub fn new(
        workspaces: WorkspaceManager,
        invoker: EngineInvoker,
        settings: JobSettings,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        Self {
            workspaces,
            identity: IdentityGenerator::random(),
            invoker,
            cache: None,
            settings,
            events,
            metrics,
            registry: RwLock::new(HashMap::new()),
            health_degraded: Mutex::new(false),
        }
    }

    /// Attach a result cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the id generator.
    #[must_use]
    pub fn with_identity(mut self, identity: IdentityGenerator) -> Self {
        self.identity = identity;
        self
    }

    /// Active settings.
    #[must_use]
    pub const fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Workspace manager shared by every job.
    #[must_use]
    pub const fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Attached result cache, if any.
    #[must_use]
    pub const fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    /// Event bus the orchestrator publishes to.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Metrics registry the orchestrator reports to.
    #[must_use]
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Whether the most recent job failed.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        *self.lock_health_flag()
    }

    /// Run one job to completion and return its final snapshot.
    ///
    /// The workspace is kept until [`JobOrchestrator::release`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidInput`] before any filesystem work for rejected
    /// uploads; otherwise the error of the step that failed, after the job has been
    /// marked failed.
    pub async fn submit(&self, request: SubmitRequest) -> JobResult<JobSnapshot> {
        let plan = self.plan(&request)?;
        let SubmitRequest {
            filename, bytes, ..
        } = request;
        let workspace = self.reserve(&filename, &plan).await?;
        let span = job_span(workspace.id().as_str(), &plan.model);
        let bytes = Arc::new(bytes);

        let result = self
            .run_job(&workspace, &plan, bytes)
            .instrument(span.clone())
            .await;
        match result {
            Ok(snapshot) => {
                span.record("status", snapshot.status.as_str());
                Ok(snapshot)
            }
            Err(err) => {
                span.record("status", JobStatus::Failed.as_str());
                self.fail(&workspace, &err).instrument(span).await;
                Err(err)
            }
        }
    }

    /// Run [`JobOrchestrator::submit`] on its own task.
    #[must_use]
    pub fn spawn(self: &Arc<Self>, request: SubmitRequest) -> JoinHandle<JobResult<JobSnapshot>> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.submit(request).await })
    }

    /// Snapshot of one job.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::UnknownJob`] if the id is not registered.
    pub async fn status(&self, id: &JobId) -> JobResult<JobSnapshot> {
        self.registry
            .read()
            .await
            .get(id)
            .map(JobEntry::snapshot)
            .ok_or_else(|| unknown(id))
    }

    /// Snapshots of every registered job, oldest first.
    pub async fn jobs(&self) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<JobSnapshot> = self
            .registry
            .read()
            .await
            .values()
            .map(JobEntry::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Open stem `index` of a completed job for streaming.
    ///
    /// The returned download holds a lease that blocks release until dropped.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::UnknownJob`], [`JobError::InvalidTransition`] for jobs that
    /// have not completed, [`JobError::OutputIndex`] for out-of-range indices, and
    /// [`JobError::Io`] if the stem cannot be opened.
    pub async fn open_output(&self, id: &JobId, index: usize) -> JobResult<StemDownload> {
        let (stem, lease) = {
            let registry = self.registry.read().await;
            let entry = registry.get(id).ok_or_else(|| unknown(id))?;
            if entry.ledger.status != JobStatus::Completed {
                return Err(JobError::InvalidTransition {
                    job_id: id.to_string(),
                    operation: "download",
                    status: entry.ledger.status,
                });
            }
            let stem = entry
                .stems
                .get(index)
                .cloned()
                .ok_or_else(|| JobError::OutputIndex {
                    job_id: id.to_string(),
                    index,
                    available: entry.stems.len(),
                })?;
            (stem, OutputLease::new(Arc::clone(&entry.lease)))
        };

        let file = File::open(&stem.path)
            .await
            .map_err(|source| JobError::io(id.as_str(), "download", Some(stem.path.clone()), source))?;
        let len = file
            .metadata()
            .await
            .map_err(|source| JobError::io(id.as_str(), "download", Some(stem.path.clone()), source))?
            .len();
        debug!(job_id = %id, stem = %stem.name, len, "stem opened for download");
        Ok(StemDownload {
            name: stem.name,
            media_type: stem.media_type,
            len,
            file,
            lease,
        })
    }

    /// Reclaim a job's workspace once its outputs have been consumed.
    ///
    /// Ids unknown to the registry are still reclaimed; reclaiming nothing reports
    /// [`ReclaimOutcome::NotAllocated`].
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidTransition`] for jobs still in flight,
    /// [`JobError::OutputsInUse`] while downloads hold a lease, and
    /// [`JobError::Reclamation`] when some entries could not be removed.
    pub async fn release(&self, id: &JobId) -> JobResult<ReclaimReport> {
        let unregistered = {
            let mut registry = self.registry.write().await;
            let state = registry
                .get(id)
                .map(|entry| (entry.ledger.status, open_leases(&entry.lease)));
            match state {
                Some((status, _)) if !status.is_terminal() => {
                    return Err(JobError::InvalidTransition {
                        job_id: id.to_string(),
                        operation: "release",
                        status,
                    });
                }
                Some((_, leases)) if leases > 0 => {
                    return Err(JobError::OutputsInUse {
                        job_id: id.to_string(),
                        leases,
                    });
                }
                Some(_) => registry.remove(id),
                None => None,
            }
        };
        if let Some(entry) = unregistered {
            drop(entry.ledger_write.lock().await);
        }
        self.refresh_active_jobs().await;

        let report = self.reclaim(id, "release").await?;
        self.metrics.inc_job_step(
            StepKind::Release.as_str(),
            if report.is_complete() {
                StepStatus::Completed.as_str()
            } else {
                StepStatus::Failed.as_str()
            },
        );
        if report.outcome != ReclaimOutcome::NotAllocated {
            self.publish(Event::JobReleased {
                job_id: id.to_string(),
                complete: report.is_complete(),
            });
        }
        if report.is_complete() {
            info!(job_id = %id, outcome = ?report.outcome, "job released");
            Ok(report)
        } else {
            Err(JobError::Reclamation {
                job_id: id.to_string(),
                stage: "release",
                failures: report.failures,
            })
        }
    }

    /// Reclaim terminal jobs idle for longer than `max_age` and orphaned workspaces
    /// with no registry entry. Running jobs and leased outputs are never touched.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Io`] if the workspace root cannot be listed. Failures for
    /// individual workspaces are logged and reported, not returned.
    pub async fn reap_abandoned(&self, max_age: Duration) -> JobResult<ReapReport> {
        let cutoff = cutoff_for(max_age);
        let mut report = ReapReport::default();

        let (idle, pending_writes) = {
            let mut registry = self.registry.write().await;
            let mut idle = Vec::new();
            for (id, entry) in &*registry {
                if entry.ledger.updated_at >= cutoff {
                    continue;
                }
                if !entry.ledger.status.is_terminal() {
                    report.skipped_in_flight += 1;
                } else if open_leases(&entry.lease) > 0 {
                    report.skipped_leased += 1;
                } else {
                    idle.push(id.clone());
                }
            }
            let pending_writes: Vec<Arc<AsyncMutex<()>>> = idle
                .iter()
                .filter_map(|id| registry.remove(id))
                .map(|entry| entry.ledger_write)
                .collect();
            (idle, pending_writes)
        };
        for gate in pending_writes {
            drop(gate.lock().await);
        }
        self.refresh_active_jobs().await;

        for id in &idle {
            self.reap_one(id, &mut report).await;
        }

        let manager = self.workspaces.clone();
        let allocated = blocking("", "reap", move || manager.list_allocated())
            .await?
            .map_err(|source| JobError::Io {
                job_id: None,
                stage: "reap",
                path: Some(self.workspaces.root().to_path_buf()),
                source: io::Error::other(source),
            })?;
        let handled: HashSet<&JobId> = idle.iter().collect();
        let orphans: Vec<JobId> = {
            let registry = self.registry.read().await;
            allocated
                .into_iter()
                .filter(|workspace| workspace.last_activity < cutoff)
                .filter(|workspace| !handled.contains(&workspace.id))
                .filter(|workspace| !registry.contains_key(&workspace.id))
                .map(|workspace| workspace.id)
                .collect()
        };
        for id in &orphans {
            report.orphans += 1;
            self.reap_one(id, &mut report).await;
        }

        if !report.reclaimed.is_empty() {
            info!(
                reclaimed = report.reclaimed.len(),
                orphans = report.orphans,
                skipped_in_flight = report.skipped_in_flight,
                skipped_leased = report.skipped_leased,
                "abandoned workspaces reaped"
            );
        }
        Ok(report)
    }

    async fn reap_one(&self, id: &JobId, report: &mut ReapReport) {
        match self.reclaim(id, "reap").await {
            Ok(reclaimed) => {
                if reclaimed.outcome != ReclaimOutcome::NotAllocated {
                    self.publish(Event::JobReleased {
                        job_id: id.to_string(),
                        complete: reclaimed.is_complete(),
                    });
                }
                report.reclaimed.push(reclaimed);
            }
            Err(err) => {
                warn!(job_id = %id, error = %describe(&err), "failed to reap workspace");
                report.errors += 1;
            }
        }
    }

    fn plan(&self, request: &SubmitRequest) -> JobResult<JobPlan> {
        let filename = sanitize_filename(&request.filename).map_err(rejected)?;
        accepted_extension(&filename, &self.settings.accepted_extensions).map_err(rejected)?;
        if request.bytes.is_empty() {
            return Err(JobError::invalid_input(None, "bytes", "empty", None));
        }
        let len = u64::try_from(request.bytes.len()).unwrap_or(u64::MAX);
        if len > self.settings.max_input_bytes {
            return Err(JobError::invalid_input(
                None,
                "bytes",
                "too_large",
                Some(len.to_string()),
            ));
        }
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.settings.model.clone());
        if validate_model(&model).is_err() {
            return Err(JobError::invalid_input(
                None,
                "model",
                "not_a_path_component",
                Some(model),
            ));
        }
        Ok(JobPlan {
            filename,
            model,
            device: request.device.unwrap_or(self.settings.device),
            format: request.format.unwrap_or(self.settings.format),
        })
    }

    async fn reserve(&self, filename: &str, plan: &JobPlan) -> JobResult<Workspace> {
        let (id, mut registry) = loop {
            let live: HashSet<JobId> = self.registry.read().await.keys().cloned().collect();
            let identity = self.identity.clone();
            let manager = self.workspaces.clone();
            let id = blocking("", "allocate", move || {
                identity.new_id(|candidate| {
                    live.contains(candidate) || manager.is_allocated(candidate)
                })
            })
            .await?
            .map_err(|source| JobError::Allocation {
                job_id: None,
                stage: "allocate",
                source,
            })?;
            // Another submission may have claimed the id while the disk was checked.
            let registry = self.registry.write().await;
            if !registry.contains_key(&id) {
                break (id, registry);
            }
            debug!(job_id = %id, "id claimed concurrently; redrawing");
        };
        let workspace = self.workspaces.workspace(&id);
        let ledger = JobLedger::new(id.clone(), plan.model.clone(), plan.device, plan.format, filename);
        registry.insert(
            id,
            JobEntry {
                ledger,
                workspace: workspace.clone(),
                stems: Vec::new(),
                lease: Arc::new(()),
                retained: false,
                ledger_write: Arc::new(AsyncMutex::new(())),
            },
        );
        drop(registry);
        self.refresh_active_jobs().await;
        Ok(workspace)
    }

    async fn run_job(
        &self,
        workspace: &Workspace,
        plan: &JobPlan,
        bytes: Arc<Vec<u8>>,
    ) -> JobResult<JobSnapshot> {
        let id = workspace.id();
        let job_id = id.as_str();

        let manager = self.workspaces.clone();
        let target = id.clone();
        blocking(job_id, "allocate", move || manager.allocate(&target))
            .await?
            .map_err(|source| JobError::Allocation {
                job_id: Some(job_id.to_string()),
                stage: "allocate",
                source,
            })?;
        self.update(id, |entry| {
            entry.retained = true;
            entry
                .ledger
                .update_step(StepKind::Allocate, StepStatus::Completed, None);
        })
        .await;
        self.metrics
            .inc_job_step(StepKind::Allocate.as_str(), StepStatus::Completed.as_str());
        debug!(path = %workspace.dir().display(), "workspace allocated");

        let target = workspace.clone();
        let filename = plan.filename.clone();
        let accepted = self.settings.accepted_extensions.clone();
        let payload = Arc::clone(&bytes);
        let input_path = blocking(job_id, "stage", move || {
            stage_input(&target, &filename, &payload, &accepted)
        })
        .await?
        .map_err(|source| JobError::Staging {
            job_id: job_id.to_string(),
            stage: "stage",
            source,
        })?;
        let staged_path = input_path.clone();
        self.update(id, move |entry| {
            entry.ledger.input_path = Some(staged_path);
            entry
                .ledger
                .update_step(StepKind::Stage, StepStatus::Completed, None);
        })
        .await;
        self.metrics
            .inc_job_step(StepKind::Stage.as_str(), StepStatus::Completed.as_str());
        self.publish(Event::JobStaged {
            job_id: job_id.to_string(),
            filename: plan.filename.clone(),
            model: plan.model.clone(),
        });

        let output_dir = workspace.engine_output_dir(&plan.model, &input_path);
        let cache_key = self.cache_key(job_id, bytes, plan).await;
        if let Some(hit) = self.restore_cached(job_id, cache_key.as_ref(), &output_dir).await {
            let stems = collect(job_id, &output_dir, plan.format).await?;
            let detail = format!("restored from cache entry {}", hit.key);
            self.update(id, |entry| {
                entry
                    .ledger
                    .update_step(StepKind::Invoke, StepStatus::Skipped, Some(detail));
            })
            .await;
            self.metrics
                .inc_job_step(StepKind::Invoke.as_str(), StepStatus::Skipped.as_str());
            self.publish(Event::CacheHit {
                job_id: job_id.to_string(),
                key: hit.key.to_string(),
            });
            return self.complete(id, stems, true).await;
        }

        self.transition(id, JobStatus::Running).await?;
        self.update(id, |entry| {
            entry
                .ledger
                .update_step(StepKind::Invoke, StepStatus::Started, None);
        })
        .await;
        self.publish(Event::JobRunning {
            job_id: job_id.to_string(),
        });
        info!(device = %plan.device, format = plan.format.extension(), "engine invoked");

        let started = Instant::now();
        let outcome = self
            .invoker
            .run(workspace, &input_path, &plan.model, plan.device, plan.format)
            .await;
        self.metrics.observe_engine_duration(started.elapsed());
        let engine_output = outcome.map_err(|source| JobError::EngineFailure {
            job_id: job_id.to_string(),
            stage: "invoke",
            source,
        })?;
        self.update(id, |entry| {
            entry
                .ledger
                .update_step(StepKind::Invoke, StepStatus::Completed, None);
        })
        .await;
        self.metrics
            .inc_job_step(StepKind::Invoke.as_str(), StepStatus::Completed.as_str());

        let stems = collect(job_id, &engine_output, plan.format).await?;
        if let Some(key) = cache_key {
            self.store_cached(job_id, key, plan, stems.clone()).await;
        }
        self.complete(id, stems, false).await
    }

    async fn complete(
        &self,
        id: &JobId,
        stems: Vec<StemFile>,
        cached: bool,
    ) -> JobResult<JobSnapshot> {
        let names: Vec<String> = stems.iter().map(|stem| stem.name.clone()).collect();
        let detail = format!("{} stems", names.len());
        let outputs = names.clone();
        // Status and outputs change under one lock so no reader sees one without the other.
        let snapshot = self
            .update(id, move |entry| {
                let current = entry.ledger.status;
                if !current.can_transition_to(JobStatus::Completed) {
                    return Err(current);
                }
                entry.ledger.cached = cached;
                entry.ledger.outputs = outputs;
                entry
                    .ledger
                    .update_step(StepKind::Collect, StepStatus::Completed, Some(detail));
                entry.stems = stems;
                entry.ledger.set_status(JobStatus::Completed);
                Ok(entry.snapshot())
            })
            .await
            .ok_or_else(|| unknown(id))?
            .map_err(|status| JobError::InvalidTransition {
                job_id: id.to_string(),
                operation: JobStatus::Completed.as_str(),
                status,
            })?;

        self.metrics
            .inc_job_step(StepKind::Collect.as_str(), StepStatus::Completed.as_str());
        self.metrics.inc_job(JobStatus::Completed.as_str());
        self.mark_recovered();
        self.refresh_active_jobs().await;
        self.publish(Event::JobCompleted {
            job_id: id.to_string(),
            stems: names,
            cached,
        });
        info!(stems = snapshot.stems.len(), cached, "job completed");
        Ok(snapshot)
    }

    async fn fail(&self, workspace: &Workspace, err: &JobError) {
        let id = workspace.id();
        let message = match err {
            JobError::EngineFailure { source, .. } => {
                format!("{}: {}", describe(err), source.diagnostics())
            }
            _ => describe(err),
        };
        let step = step_for_stage(err.stage());
        let allocated = {
            let mut registry = self.registry.write().await;
            let Some(entry) = registry.get_mut(id) else {
                return;
            };
            if entry.is_allocated() {
                entry
                    .ledger
                    .update_step(step, StepStatus::Failed, Some(message.clone()));
                if step == StepKind::Invoke {
                    entry
                        .ledger
                        .update_step(StepKind::Collect, StepStatus::Skipped, None);
                }
                entry.ledger.error = Some(message.clone());
                if entry.ledger.status.can_transition_to(JobStatus::Failed) {
                    entry.ledger.set_status(JobStatus::Failed);
                }
                true
            } else {
                registry.remove(id);
                false
            }
        };

        self.metrics
            .inc_job_step(step.as_str(), StepStatus::Failed.as_str());
        self.metrics.inc_job(JobStatus::Failed.as_str());
        self.mark_degraded(&message);
        self.refresh_active_jobs().await;

        if matches!(err, JobError::MissingOutput { .. }) {
            error!(step = step.as_str(), error = %message, "engine reported success without output");
        } else {
            warn!(step = step.as_str(), error = %message, "job failed");
        }
        if !allocated {
            return;
        }

        self.persist(id).await;
        self.publish(Event::JobFailed {
            job_id: id.to_string(),
            step: step.as_str().to_string(),
            message,
        });

        if self.settings.on_failure == RetentionPolicy::Reclaim {
            match self.reclaim(id, "retention").await {
                Ok(report) => {
                    let complete = report.is_complete();
                    self.update_quiet(id, |entry| entry.retained = !complete).await;
                    debug!(outcome = ?report.outcome, "failed job workspace reclaimed");
                }
                Err(reclaim_err) => {
                    warn!(error = %describe(&reclaim_err), "failed to reclaim failed job workspace");
                }
            }
        }
    }

    async fn transition(&self, id: &JobId, next: JobStatus) -> JobResult<()> {
        let current = self
            .update(id, |entry| {
                let current = entry.ledger.status;
                if current.can_transition_to(next) {
                    entry.ledger.set_status(next);
                }
                current
            })
            .await
            .ok_or_else(|| unknown(id))?;
        if current.can_transition_to(next) {
            self.refresh_active_jobs().await;
            Ok(())
        } else {
            Err(JobError::InvalidTransition {
                job_id: id.to_string(),
                operation: next.as_str(),
                status: current,
            })
        }
    }

    async fn reclaim(&self, id: &JobId, stage: &'static str) -> JobResult<ReclaimReport> {
        let manager = self.workspaces.clone();
        let target = id.clone();
        let report = blocking(id.as_str(), stage, move || manager.reclaim(&target))
            .await?
            .map_err(|source| JobError::workspace(id.as_str(), stage, source))?;
        if !report.is_complete() {
            self.metrics.inc_reclaim_failure();
            warn!(
                job_id = %id,
                stage,
                failures = report.failures.len(),
                "workspace only partially reclaimed"
            );
        }
        Ok(report)
    }

    async fn cache_key(&self, job_id: &str, bytes: Arc<Vec<u8>>, plan: &JobPlan) -> Option<CacheKey> {
        self.cache.as_ref()?;
        let model = plan.model.clone();
        let (device, format) = (plan.device, plan.format);
        match blocking(job_id, "cache", move || {
            CacheKey::compute(&bytes, &model, device, format)
        })
        .await
        {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(error = %describe(&err), "failed to hash input for cache lookup");
                None
            }
        }
    }

    async fn restore_cached(
        &self,
        job_id: &str,
        key: Option<&CacheKey>,
        output_dir: &Path,
    ) -> Option<CachedResult> {
        let (Some(cache), Some(key)) = (self.cache.clone(), key.cloned()) else {
            return None;
        };
        let dest = output_dir.to_path_buf();
        let lookup = blocking(job_id, "cache", move || -> CacheResult<Option<CachedResult>> {
            let hit = cache.lookup(&key)?;
            if let Some(hit) = &hit
                && let Err(err) = cache.restore(hit, &dest)
            {
                discard_partial_restore(&dest);
                if let Err(invalidate_err) = cache.invalidate(&key) {
                    warn!(key = %key, error = %invalidate_err, "failed to invalidate broken cache entry");
                }
                return Err(err);
            }
            Ok(hit)
        })
        .await;

        match lookup {
            Ok(Ok(Some(hit))) => {
                self.metrics.inc_cache_lookup("hit");
                info!(key = %hit.key, "separation result restored from cache");
                Some(hit)
            }
            Ok(Ok(None)) => {
                self.metrics.inc_cache_lookup("miss");
                None
            }
            Ok(Err(err)) => {
                self.metrics.inc_cache_lookup("error");
                warn!(error = %describe(&err), "cache lookup failed; running engine");
                None
            }
            Err(err) => {
                self.metrics.inc_cache_lookup("error");
                warn!(error = %describe(&err), "cache lookup task failed; running engine");
                None
            }
        }
    }

    async fn store_cached(&self, job_id: &str, key: CacheKey, plan: &JobPlan, stems: Vec<StemFile>) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let model = plan.model.clone();
        let format = plan.format;
        let stored = blocking(job_id, "cache", move || {
            cache.store(&key, &model, format, &stems)
        })
        .await;
        match stored {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %describe(&err), "failed to cache separation result"),
            Err(err) => warn!(error = %describe(&err), "cache store task failed"),
        }
    }

    /// Apply `change` to a registered job and rewrite its ledger.
    async fn update<R>(&self, id: &JobId, change: impl FnOnce(&mut JobEntry) -> R) -> Option<R> {
        let result = self.update_quiet(id, change).await;
        if result.is_some() {
            self.persist(id).await;
        }
        result
    }

    async fn update_quiet<R>(
        &self,
        id: &JobId,
        change: impl FnOnce(&mut JobEntry) -> R,
    ) -> Option<R> {
        self.registry.write().await.get_mut(id).map(change)
    }

    async fn persist(&self, id: &JobId) {
        let Some(gate) = self
            .registry
            .read()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.ledger_write))
        else {
            return;
        };
        let _writing = gate.lock().await;
        // Re-read under the gate: a job unregistered meanwhile is not written back.
        let target: Option<(PathBuf, JobLedger)> = self
            .registry
            .read()
            .await
            .get(id)
            .filter(|entry| entry.retained)
            .map(|entry| (entry.workspace.ledger_path(), entry.ledger.clone()));
        let Some((path, ledger)) = target else {
            return;
        };
        match blocking(id.as_str(), "ledger", move || persist_ledger(&path, &ledger)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(job_id = %id, error = %describe(&err), "failed to persist job ledger"),
            Err(err) => warn!(job_id = %id, error = %describe(&err), "ledger persistence task failed"),
        }
    }

    async fn refresh_active_jobs(&self) {
        let active = self
            .registry
            .read()
            .await
            .values()
            .filter(|entry| !entry.ledger.status.is_terminal())
            .count();
        self.metrics
            .set_active_jobs(i64::try_from(active).unwrap_or(i64::MAX));
    }

    fn publish(&self, event: Event) {
        self.metrics.inc_event(event.kind());
        self.events.publish(event);
    }

    fn mark_degraded(&self, detail: &str) {
        let mut guard = self.lock_health_flag();
        if *guard {
            drop(guard);
            warn!(
                component = HEALTH_COMPONENT,
                detail = detail,
                "separation pipeline still degraded"
            );
        } else {
            *guard = true;
            drop(guard);
            warn!(
                component = HEALTH_COMPONENT,
                detail = detail,
                "separation pipeline degraded"
            );
            self.publish(Event::HealthChanged {
                degraded: vec![HEALTH_COMPONENT.to_string()],
            });
        }
    }

    fn mark_recovered(&self) {
        let mut guard = self.lock_health_flag();
        if std::mem::take(&mut *guard) {
            drop(guard);
            self.publish(Event::HealthChanged { degraded: vec![] });
            info!(component = HEALTH_COMPONENT, "separation pipeline recovered");
        }
    }

    fn lock_health_flag(&self) -> MutexGuard<'_, bool> {
        match self.health_degraded.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("health mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

async fn blocking<T, F>(job_id: &str, stage: &'static str, task: F) -> JobResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|source| JobError::Io {
        job_id: (!job_id.is_empty()).then(|| job_id.to_string()),
        stage,
        path: None,
        source: io::Error::other(source),
    })
}

async fn collect(job_id: &str, output_dir: &Path, format: OutputFormat) -> JobResult<Vec<StemFile>> {
    let dir = output_dir.to_path_buf();
    blocking(job_id, "collect", move || collect_stems(&dir, format))
        .await?
        .map_err(|source| JobError::workspace(job_id, "collect", source))
}

fn discard_partial_restore(dir: &Path) {
    if let Err(err) = std::fs::remove_dir_all(dir)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %dir.display(), error = %err, "failed to discard partial cache restore");
    }
}

fn rejected(err: WorkspaceError) -> JobError {
    match err {
        WorkspaceError::InvalidInput {
            field,
            reason,
            value,
        } => JobError::invalid_input(None, field, reason, value),
        other => JobError::Io {
            job_id: None,
            stage: "validate",
            path: None,
            source: io::Error::other(other),
        },
    }
}

fn unknown(id: &JobId) -> JobError {
    JobError::UnknownJob {
        job_id: id.to_string(),
    }
}

fn step_for_stage(stage: &str) -> StepKind {
    match stage {
        "allocate" => StepKind::Allocate,
        "stage" => StepKind::Stage,
        "collect" => StepKind::Collect,
        "release" | "retention" | "reap" => StepKind::Release,
        _ => StepKind::Invoke,
    }
}

fn cutoff_for(max_age: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    TimeDelta::from_std(max_age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_map_to_ledger_steps() {
        assert_eq!(step_for_stage("allocate"), StepKind::Allocate);
        assert_eq!(step_for_stage("stage"), StepKind::Stage);
        assert_eq!(step_for_stage("invoke"), StepKind::Invoke);
        assert_eq!(step_for_stage("collect"), StepKind::Collect);
        assert_eq!(step_for_stage("reap"), StepKind::Release);
    }

    #[test]
    fn cutoff_saturates_for_huge_ages() {
        assert_eq!(cutoff_for(Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert!(cutoff_for(Duration::ZERO) <= Utc::now());
    }

    #[test]
    fn rejected_keeps_validation_context() {
        let err = rejected(WorkspaceError::InvalidInput {
            field: "filename",
            reason: "unsupported_extension",
            value: Some("notes.txt".into()),
        });
        assert!(matches!(
            err,
            JobError::InvalidInput {
                job_id: None,
                field: "filename",
                ..
            }
        ));
    }
}
