//! Runs: one execution attempt of a model system.
//!
//! Every variant shares the same lifecycle and event surface:
//!
//! ```text
//! Created -> Validating -> RuntimeValidating -> Running -> Completed
//!                 |               |                |
//!                 v               v                v
//!         ValidationError  RuntimeValidationError  RuntimeError
//! ```
//!
//! plus `Cancelled`, reachable from any non-terminal phase after start.
//! Exactly one terminal event is delivered per started run; a run cancelled
//! before it ever started finishes silently.

mod lifecycle;
mod local;
mod worker;

pub use lifecycle::{RunCore, RunListener};
pub use local::LocalRun;
pub(crate) use worker::ModelSystemWorker;
pub use worker::{ERROR_LOG_FILE, RUN_PARAMETERS_FILE};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::OrchestratorConfig;
use crate::error::{ErrorWithPath, RunError};
use crate::model::{ModelSystemBuilder, ModelSystemDocument, ProgressReport};
use crate::remote::RemoteHostRun;
use crate::types::{Colour, RunId, RunName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Created,
    Validating,
    RuntimeValidating,
    Running,
    ValidationError,
    RuntimeValidationError,
    RuntimeError,
    Completed,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ValidationError
                | Self::RuntimeValidationError
                | Self::RuntimeError
                | Self::Completed
                | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Validating => "validating",
            Self::RuntimeValidating => "runtime_validating",
            Self::Running => "running",
            Self::ValidationError => "validation_error",
            Self::RuntimeValidationError => "runtime_validation_error",
            Self::RuntimeError => "runtime_error",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Notifications raised by a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    ValidationStarting,
    /// Validation passed and the model system is executing.
    RunStarted,
    /// Console output or a diagnostic from a remote worker.
    Message(String),
    /// The model system saved an updated copy of itself (document text).
    ModelSystemSaved(String),

    ValidationError(Vec<ErrorWithPath>),
    RuntimeValidationError(Vec<ErrorWithPath>),
    RuntimeError(ErrorWithPath),
    Completed,
    /// Forcefully stopped after it had started. Not an error.
    Cancelled,
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        self.terminal_phase().is_some()
    }

    pub(crate) fn terminal_phase(&self) -> Option<RunPhase> {
        match self {
            Self::ValidationError(_) => Some(RunPhase::ValidationError),
            Self::RuntimeValidationError(_) => Some(RunPhase::RuntimeValidationError),
            Self::RuntimeError(_) => Some(RunPhase::RuntimeError),
            Self::Completed => Some(RunPhase::Completed),
            Self::Cancelled => Some(RunPhase::Cancelled),
            _ => None,
        }
    }
}

/// A unit of work the controller can schedule.
pub trait Run: Send + Sync {
    /// Shared lifecycle state.
    fn core(&self) -> &RunCore;

    fn runs_remotely(&self) -> bool;

    /// Begin execution without blocking. Calling it twice is an error.
    fn start(&self) -> Result<(), RunError>;

    /// Cooperative stop; returns whether the model system agreed.
    fn exit_request(&self) -> bool;

    /// Ask every template in the tree to exit.
    fn deep_exit_request(&self) -> bool;

    /// Unconditional stop. Returns promptly.
    fn terminate_run(&self);

    fn poll_progress(&self) -> f32;

    fn poll_status_message(&self) -> String;

    fn poll_colour(&self) -> Colour;

    /// Named progress reports the model system has published.
    fn poll_progress_reports(&self) -> Vec<ProgressReport> {
        Vec::new()
    }

    fn id(&self) -> RunId {
        self.core().id()
    }

    fn name(&self) -> &RunName {
        self.core().name()
    }

    fn run_directory(&self) -> &Path {
        self.core().run_directory()
    }

    fn phase(&self) -> RunPhase {
        self.core().phase()
    }

    fn subscribe(&self, listener: RunListener) {
        self.core().subscribe(listener)
    }

    /// Block until the run has finished.
    fn wait(&self) {
        self.core().wait()
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        self.core().wait_timeout(timeout)
    }
}

/// Create the run variant the configuration asks for.
///
/// Remote runs need a tokio runtime; this must be called from within one.
pub fn create_run(
    config: Arc<OrchestratorConfig>,
    builder: Arc<dyn ModelSystemBuilder>,
    name: RunName,
    run_directory: impl AsRef<Path>,
    document: ModelSystemDocument,
    overwrite: bool,
) -> Result<Arc<dyn Run>, RunError> {
    let run_directory = run_directory.as_ref();
    if config.run_in_separate_process {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| RunError::NoRuntime(e.to_string()))?;
        let run = RemoteHostRun::new(name, run_directory, document, config, handle)?
            .overwrite(overwrite);
        Ok(Arc::new(run))
    } else {
        let run = LocalRun::new(name, run_directory, document.into_resolved(), builder, config)
            .overwrite(overwrite);
        Ok(Arc::new(run))
    }
}
