//! Engine error types.

use std::io;

use thiserror::Error;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while running the separation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine process could not be started.
    #[error("failed to spawn separation engine")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Waiting for the engine process failed.
    #[error("failed to wait for separation engine")]
    Wait {
        /// Program that was launched.
        program: String,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The engine exited unsuccessfully.
    #[error("separation engine exited unsuccessfully")]
    Failed {
        /// Exit code, absent when the process was killed by a signal.
        exit_code: Option<i32>,
        /// Tail of the engine's stderr (or stdout when stderr was empty).
        diagnostics: String,
    },
}

impl EngineError {
    /// Exit code reported by the engine, if it ran and exited.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { exit_code, .. } => *exit_code,
            Self::Spawn { .. } | Self::Wait { .. } => None,
        }
    }

    /// Engine diagnostics, or the IO error text when the engine never ran.
    #[must_use]
    pub fn diagnostics(&self) -> String {
        match self {
            Self::Failed { diagnostics, .. } => diagnostics.clone(),
            Self::Spawn { source, .. } | Self::Wait { source, .. } => source.to_string(),
        }
    }
}
