//! Wiring of configuration, telemetry, engine, cache and orchestrator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use demix_config::{ConfigLoader, DemixConfig, LogFormatSetting, TelemetryConfig};
use demix_engine::{DemucsEngine, EngineInvoker, SeparationEngine};
use demix_events::EventBus;
use demix_telemetry::{LogFormat, LoggingConfig, Metrics, build_sha};
use demix_workspace::{IdentityGenerator, WorkspaceManager};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::ResultCache;
use crate::error::{AppError, AppResult, describe};
use crate::orchestrator::{JobOrchestrator, JobSettings};
use crate::reaper::spawn_reaper;

/// Load and validate configuration from `path` (defaults when `None`) and the
/// process environment.
///
/// # Errors
///
/// Returns [`AppError::Config`] if the file cannot be read or fails validation.
pub fn load_config(path: Option<PathBuf>) -> AppResult<DemixConfig> {
    ConfigLoader::new(path)
        .load()
        .map_err(|err| AppError::config("config.load", err))
}

/// Install the global tracing subscriber described by `telemetry`.
///
/// # Errors
///
/// Returns [`AppError::Telemetry`] if the log level is not a valid filter or a
/// subscriber is already installed.
pub fn init_telemetry(telemetry: &TelemetryConfig) -> AppResult<()> {
    let format = match telemetry.log_format {
        LogFormatSetting::Json => LogFormat::Json,
        LogFormatSetting::Pretty => LogFormat::Pretty,
    };
    demix_telemetry::init_logging(&LoggingConfig {
        level: &telemetry.log_level,
        format,
        build_sha: build_sha(),
    })
    .map_err(|err| AppError::telemetry("telemetry.init", err))
}

/// Everything a front end needs to run jobs.
pub struct AppContext {
    /// Effective configuration.
    pub config: DemixConfig,
    /// Shared orchestrator.
    pub orchestrator: Arc<JobOrchestrator>,
    /// Lifecycle event bus.
    pub events: EventBus,
    /// Metrics registry.
    pub metrics: Metrics,
}

impl AppContext {
    /// Production wiring: the configured demucs command and random job ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the workspace root cannot be prepared or metrics cannot
    /// be registered.
    pub fn from_config(config: DemixConfig) -> AppResult<Self> {
        let engine = Arc::new(DemucsEngine::from_config(&config.engine));
        Self::with_engine(config, engine, IdentityGenerator::random())
    }

    /// Wiring with an injected engine and id generator.
    ///
    /// A cache that cannot be opened is logged and disabled rather than failing startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the workspace root cannot be prepared or metrics cannot
    /// be registered.
    pub fn with_engine(
        config: DemixConfig,
        engine: Arc<dyn SeparationEngine>,
        identity: IdentityGenerator,
    ) -> AppResult<Self> {
        let workspaces = WorkspaceManager::new(&config.workspace.root)
            .map_err(|err| AppError::workspace("workspace.root", err))?;
        let events = EventBus::new();
        let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;

        let mut orchestrator = JobOrchestrator::new(
            workspaces,
            EngineInvoker::new(engine),
            JobSettings::from_config(&config),
            events.clone(),
            metrics.clone(),
        )
        .with_identity(identity);
        match ResultCache::from_config(&config.cache) {
            Ok(Some(cache)) => orchestrator = orchestrator.with_cache(Arc::new(cache)),
            Ok(None) => info!("result cache disabled"),
            Err(err) => warn!(
                root = %config.cache.root.display(),
                error = %describe(&err),
                "result cache unavailable; continuing without it"
            ),
        }

        info!(
            workspace_root = %config.workspace.root.display(),
            model = %config.engine.model,
            device = %config.engine.device,
            "demix services ready"
        );
        Ok(Self {
            config,
            orchestrator: Arc::new(orchestrator),
            events,
            metrics,
        })
    }

    /// Start the background reaper at the configured interval, reclaiming work
    /// idle for longer than `max_age`.
    #[must_use]
    pub fn spawn_reaper(&self, max_age: Duration) -> JoinHandle<()> {
        spawn_reaper(
            Arc::clone(&self.orchestrator),
            self.config.workspace.reap_interval(),
            max_age,
        )
    }
}
