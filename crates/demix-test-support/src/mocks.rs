//! Deterministic stand-ins for the engine and id randomness.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use demix_engine::{EngineError, EngineRequest, EngineResult, SeparationEngine};
use demix_workspace::IdSource;
use tokio::sync::Notify;

/// What a [`StubEngine`] does when invoked.
#[derive(Debug, Clone)]
pub enum StubBehavior {
    /// Create the output directory and write one small file per stem name.
    WriteStems(Vec<String>),
    /// Create the output directory but leave it empty.
    EmptyOutput,
    /// Exit successfully without creating any output.
    SkipOutput,
    /// Exit unsuccessfully.
    Fail {
        /// Exit code to report.
        exit_code: i32,
        /// Diagnostics to report.
        diagnostics: String,
    },
}

/// Engine double that writes stems the way demucs lays them out.
pub struct StubEngine {
    behavior: StubBehavior,
    calls: AtomicUsize,
    requests: Mutex<Vec<EngineRequest>>,
    started: Arc<Notify>,
    gate: Option<Arc<Notify>>,
}

impl StubEngine {
    /// Engine that always applies `behavior`.
    #[must_use]
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            started: Arc::new(Notify::new()),
            gate: None,
        }
    }

    /// Engine writing `drums.mp3` and `vocals.mp3`.
    #[must_use]
    pub fn drums_and_vocals() -> Self {
        Self::new(StubBehavior::WriteStems(vec![
            "vocals.mp3".into(),
            "drums.mp3".into(),
        ]))
    }

    /// Engine failing with `exit_code`.
    #[must_use]
    pub fn failing(exit_code: i32) -> Self {
        Self::new(StubBehavior::Fail {
            exit_code,
            diagnostics: format!("stub engine exited with {exit_code}"),
        })
    }

    /// Hold every run until the returned handle is notified.
    #[must_use]
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Notified each time a run starts.
    #[must_use]
    pub fn started(&self) -> Arc<Notify> {
        self.started.clone()
    }

    /// Number of times the engine was invoked.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn output_dir(request: &EngineRequest) -> PathBuf {
        let stem = request
            .input_path
            .file_stem()
            .map(ToOwned::to_owned)
            .unwrap_or_default();
        request.output_root.join(&request.model).join(stem)
    }
}

#[async_trait]
impl SeparationEngine for StubEngine {
    async fn separate(&self, request: &EngineRequest) -> EngineResult<()> {
        // Register with the gate before the call becomes observable so a
        // `notify_waiters` issued after `calls()` reaches a count is never lost.
        let gated = self.gate.as_ref().map(|gate| gate.notified());
        tokio::pin!(gated);
        if let Some(notified) = gated.as_mut().as_pin_mut() {
            notified.enable();
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.started.notify_one();
        if let Some(notified) = gated.as_pin_mut() {
            notified.await;
        }

        let write = |stems: &[String]| -> std::io::Result<()> {
            let dir = Self::output_dir(request);
            fs::create_dir_all(&dir)?;
            for stem in stems {
                fs::write(dir.join(stem), stem.as_bytes())?;
            }
            Ok(())
        };
        let io_failure = |source: std::io::Error| EngineError::Failed {
            exit_code: Some(1),
            diagnostics: source.to_string(),
        };

        match &self.behavior {
            StubBehavior::WriteStems(stems) => write(stems.as_slice()).map_err(io_failure),
            StubBehavior::EmptyOutput => write(&[]).map_err(io_failure),
            StubBehavior::SkipOutput => Ok(()),
            StubBehavior::Fail {
                exit_code,
                diagnostics,
            } => Err(EngineError::Failed {
                exit_code: Some(*exit_code),
                diagnostics: diagnostics.clone(),
            }),
        }
    }
}

/// Id source replaying a fixed sequence, then counting upward from a high base.
pub struct SequenceIdSource {
    tokens: Mutex<VecDeque<u64>>,
    fallback: AtomicU64,
}

impl SequenceIdSource {
    /// Source yielding `tokens` in order.
    #[must_use]
    pub fn new(tokens: impl IntoIterator<Item = u64>) -> Self {
        Self {
            tokens: Mutex::new(tokens.into_iter().collect()),
            fallback: AtomicU64::new(0xf000_0000_0000_0000),
        }
    }
}

impl IdSource for SequenceIdSource {
    fn next_token(&self) -> u64 {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.fetch_add(1, Ordering::SeqCst))
    }
}
