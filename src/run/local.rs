use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ModelSystemWorker, Run, RunCore};
use crate::config::OrchestratorConfig;
use crate::error::RunError;
use crate::model::{ModelSystemBuilder, ModelSystemStructure, ProgressReport};
use crate::types::{Colour, RunName};

/// Runs a model system on a dedicated thread inside this process.
pub struct LocalRun {
    worker: Arc<ModelSystemWorker>,
    /// Taken by `start`.
    structure: Mutex<Option<ModelSystemStructure>>,
    overwrite: bool,
}

impl LocalRun {
    pub fn new(
        name: RunName,
        run_directory: impl Into<PathBuf>,
        structure: ModelSystemStructure,
        builder: Arc<dyn ModelSystemBuilder>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let core = Arc::new(RunCore::new(name, run_directory));
        Self {
            worker: Arc::new(ModelSystemWorker::new(core, builder, config)),
            structure: Mutex::new(Some(structure)),
            overwrite: false,
        }
    }

    /// Clear the run directory before writing the parameter snapshot.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

impl Run for LocalRun {
    fn core(&self) -> &RunCore {
        self.worker.core()
    }

    fn runs_remotely(&self) -> bool {
        false
    }

    fn start(&self) -> Result<(), RunError> {
        self.core().try_begin()?;
        let Some(structure) = self.structure.lock().take() else {
            return Err(RunError::AlreadyStarted(self.name().to_string()));
        };
        self.worker.spawn(structure, self.overwrite)
    }

    fn exit_request(&self) -> bool {
        self.worker.exit_request()
    }

    fn deep_exit_request(&self) -> bool {
        self.worker.deep_exit_request()
    }

    fn terminate_run(&self) {
        self.worker.terminate();
    }

    fn poll_progress(&self) -> f32 {
        self.worker.progress()
    }

    fn poll_status_message(&self) -> String {
        self.worker.status()
    }

    fn poll_colour(&self) -> Colour {
        self.worker.colour()
    }

    fn poll_progress_reports(&self) -> Vec<ProgressReport> {
        self.worker.progress_reports()
    }
}
