//! Worker side of a remote run: rebuilds the model system from the text the
//! host sent and executes it in this process.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::config::OrchestratorConfig;
use crate::error::{ErrorWithPath, RunError};
use crate::model::progress::ReportObserver;
use crate::model::{ModelSystemBuilder, ModelSystemDocument, ModelSystemStructure, ProgressReport};
use crate::run::{ModelSystemWorker, Run, RunCore, RunEvent, RunPhase};
use crate::types::{Colour, RunName};

pub struct RemoteClientRun {
    worker: Arc<ModelSystemWorker>,
    /// Decoded model system, or why it could not be decoded. Taken by `start`.
    structure: Mutex<Option<Result<ModelSystemStructure, String>>>,
    overwrite: bool,
}

impl RemoteClientRun {
    pub fn new(
        name: RunName,
        run_directory: impl Into<PathBuf>,
        model_system: &str,
        builder: Arc<dyn ModelSystemBuilder>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let structure = match ModelSystemDocument::from_text(model_system) {
            Ok(document) => Ok(document.into_resolved()),
            Err(e) => {
                warn!("Unable to decode model system for run `{}`: {}", name, e);
                Err(e.to_string())
            }
        };
        let core = Arc::new(RunCore::new(name, run_directory));
        Self {
            worker: Arc::new(ModelSystemWorker::new(core, builder, config)),
            structure: Mutex::new(Some(structure)),
            overwrite: false,
        }
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Forward changes to the model system's named reports as they happen.
    pub(crate) fn observe_reports(&self, observer: ReportObserver) {
        self.worker.reports().observe(observer);
    }
}

impl Run for RemoteClientRun {
    fn core(&self) -> &RunCore {
        self.worker.core()
    }

    fn runs_remotely(&self) -> bool {
        true
    }

    fn start(&self) -> Result<(), RunError> {
        self.core().try_begin()?;
        match self.structure.lock().take() {
            Some(Ok(structure)) => self.worker.spawn(structure, self.overwrite),
            Some(Err(reason)) => {
                let core = self.core();
                core.set_phase(RunPhase::Validating);
                core.emit(RunEvent::ValidationStarting);
                core.finish(RunEvent::RuntimeValidationError(vec![
                    ErrorWithPath::unattributed("Model System Root not found").with_stack_trace(reason),
                ]));
                Ok(())
            }
            None => Err(RunError::AlreadyStarted(self.name().to_string())),
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LinkedParameter, ModuleRegistry};

    fn client(dir: &std::path::Path, text: &str) -> (RemoteClientRun, Arc<Mutex<Vec<RunEvent>>>) {
        let run = RemoteClientRun::new(
            RunName::new("client"),
            dir.join("run"),
            text,
            Arc::new(ModuleRegistry::with_builtins()),
            Arc::new(OrchestratorConfig::default()),
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        run.subscribe(Arc::new(move |e: &RunEvent| sink.lock().push(e.clone())));
        (run, events)
    }

    #[test]
    fn test_undecodable_model_system() {
        let dir = tempfile::tempdir().unwrap();
        let (run, events) = client(dir.path(), "<Root/>");

        run.start().unwrap();
        run.wait();

        let events = events.lock();
        match events.last() {
            Some(RunEvent::RuntimeValidationError(errors)) => {
                assert_eq!(errors[0].message, "Model System Root not found");
                assert!(errors[0].path.is_none());
            }
            other => panic!("unexpected last event: {other:?}"),
        }
    }

    #[test]
    fn test_linked_parameters_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut document = ModelSystemDocument::new(
            ModelSystemStructure::new("Wait", "Delay")
                .with_parameter("Millis", "60000")
                .with_parameter("Fail", ""),
        );
        document.linked_parameters.push(LinkedParameter {
            name: "Failure".into(),
            value: "linked failure".into(),
            references: vec!["Fail".into()],
        });
        document.linked_parameters.push(LinkedParameter {
            name: "Quick".into(),
            value: "1".into(),
            references: vec!["Millis".into()],
        });
        let (run, events) = client(dir.path(), &document.to_text().unwrap());

        run.start().unwrap();
        run.wait();

        match events.lock().last() {
            Some(RunEvent::RuntimeError(error)) => assert_eq!(error.message, "linked failure"),
            other => panic!("unexpected last event: {other:?}"),
        }
    }
}
