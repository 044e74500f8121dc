//! Job-scoped engine invocation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use demix_config::{Device, OutputFormat};
use demix_workspace::Workspace;
use tracing::{info, warn};

use crate::error::EngineResult;
use crate::{EngineRequest, SeparationEngine};

/// Drives one engine run per call, scoped to a single workspace.
///
/// The invoker makes no retry decisions; a failure is returned as-is.
#[derive(Clone)]
pub struct EngineInvoker {
    engine: Arc<dyn SeparationEngine>,
}

impl EngineInvoker {
    /// Invoker delegating to `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn SeparationEngine>) -> Self {
        Self { engine }
    }

    /// Run the engine against `input_path` and return the directory its stems land in.
    ///
    /// # Errors
    ///
    /// Propagates the engine's failure unchanged.
    pub async fn run(
        &self,
        workspace: &Workspace,
        input_path: &Path,
        model: &str,
        device: Device,
        format: OutputFormat,
    ) -> EngineResult<PathBuf> {
        let request = EngineRequest {
            input_path: input_path.to_path_buf(),
            output_root: workspace.separated_dir(),
            working_dir: workspace.dir().to_path_buf(),
            model: model.to_string(),
            device,
            format,
        };
        let started = Instant::now();
        let result = self.engine.separate(&request).await;
        let elapsed_ms = started.elapsed().as_millis();
        match result {
            Ok(()) => {
                info!(job_id = %workspace.id(), elapsed_ms, "engine run finished");
                Ok(workspace.engine_output_dir(model, input_path))
            }
            Err(err) => {
                warn!(job_id = %workspace.id(), elapsed_ms, error = %err, "engine run failed");
                Err(err)
            }
        }
    }
}
