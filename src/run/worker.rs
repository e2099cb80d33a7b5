//! The in-process execution pipeline shared by local runs and remote
//! clients: build, snapshot, runtime-validate, start, attribute failures.

use std::any::Any;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use super::{RunCore, RunEvent, RunPhase};
use crate::config::OrchestratorConfig;
use crate::error::{ErrorWithPath, ModuleRuntimeError, RunError};
use crate::model::{
    ModelSystemBuilder, ModelSystemStructure, ModuleNode, ModuleTree, ProgressReport, ProgressReports, RunContext,
};
use crate::types::Colour;

pub const RUN_PARAMETERS_FILE: &str = "RunParameters.json";
pub const ERROR_LOG_FILE: &str = "ErrorLog.txt";

pub(crate) struct ModelSystemWorker {
    core: Arc<RunCore>,
    builder: Arc<dyn ModelSystemBuilder>,
    config: Arc<OrchestratorConfig>,
    context: RunContext,
    /// Tree currently executing; only set while the root is running.
    active: RwLock<Option<Arc<ModuleTree>>>,
    terminating: AtomicBool,
}

impl ModelSystemWorker {
    pub fn new(
        core: Arc<RunCore>,
        builder: Arc<dyn ModelSystemBuilder>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let saved = core.clone();
        let context = RunContext::new(
            core.name().clone(),
            core.run_directory().to_path_buf(),
            config.clone(),
        )
        .with_save_hook(Arc::new(move |text: String| saved.emit(RunEvent::ModelSystemSaved(text))));
        Self {
            core,
            builder,
            config,
            context,
            active: RwLock::new(None),
            terminating: AtomicBool::new(false),
        }
    }

    pub fn core(&self) -> &RunCore {
        &self.core
    }

    /// Execute on a dedicated thread. The caller must already have claimed
    /// the run through [`RunCore::try_begin`].
    pub fn spawn(self: &Arc<Self>, structure: ModelSystemStructure, overwrite: bool) -> Result<(), RunError> {
        let worker = self.clone();
        std::thread::Builder::new()
            .name(format!("run-{}", self.core.name()))
            .spawn(move || worker.execute(&structure, overwrite))
            .map(|_| ())
            .map_err(|source| self.spawn_failed(source))
    }

    /// A claimed run whose thread never started still owes its terminal event.
    fn spawn_failed(&self, source: std::io::Error) -> RunError {
        error!("Unable to start worker thread for run `{}`: {}", self.core.name(), source);
        self.core.finish(RunEvent::RuntimeError(ErrorWithPath::unattributed(format!(
            "Unable to start worker thread: {}",
            source
        ))));
        RunError::Spawn {
            name: self.core.name().to_string(),
            source,
        }
    }

    /// Run the whole pipeline on the current thread, raising exactly one
    /// terminal event.
    pub fn execute(&self, structure: &ModelSystemStructure, overwrite: bool) {
        let core = &self.core;
        core.set_phase(RunPhase::Validating);
        core.emit(RunEvent::ValidationStarting);

        let built = catch_unwind(AssertUnwindSafe(|| self.builder.build(structure, &self.config)));
        let tree = match built {
            Ok(Ok(tree)) => Arc::new(tree),
            Ok(Err(errors)) => {
                warn!("Run `{}` failed validation with {} error(s)", core.name(), errors.len());
                self.finish(RunEvent::ValidationError(errors));
                return;
            }
            Err(panic) => {
                let message = format!("Model system construction panicked: {}", panic_message(&*panic));
                self.finish(RunEvent::ValidationError(vec![ErrorWithPath::unattributed(message)]));
                return;
            }
        };

        if core.is_finished() {
            tree.root.dispose_all();
            return;
        }

        if let Err(e) = self.prepare_run_directory(structure, overwrite) {
            tree.root.dispose_all();
            let message = format!("{:#}", e);
            self.finish(RunEvent::RuntimeValidationError(vec![ErrorWithPath::unattributed(message)]));
            return;
        }

        core.set_phase(RunPhase::RuntimeValidating);
        let errors = tree.root.runtime_validation();
        if !errors.is_empty() {
            tree.root.dispose_all();
            self.finish(RunEvent::RuntimeValidationError(errors));
            return;
        }

        *self.active.write() = Some(tree.clone());
        core.set_phase(RunPhase::Running);
        core.emit(RunEvent::RunStarted);
        info!("Run `{}` started `{}`", core.name(), tree.template.name());

        let outcome = catch_unwind(AssertUnwindSafe(|| tree.template.start(&self.context)));

        tree.root.dispose_all();
        *self.active.write() = None;

        let event = match outcome {
            Ok(Ok(())) if self.context.exit_requested() => {
                info!("Run `{}` stopped on request", core.name());
                RunEvent::Cancelled
            }
            Ok(Ok(())) => RunEvent::Completed,
            Ok(Err(e)) => {
                let failure = attribute_failure(&tree.root, &e);
                error!("Run `{}` failed: {}", core.name(), failure);
                self.append_error_log(&failure);
                RunEvent::RuntimeError(failure)
            }
            Err(panic) => {
                let failure = ErrorWithPath::unattributed(format!(
                    "Model system panicked: {}",
                    panic_message(&*panic)
                ));
                error!("Run `{}` failed: {}", core.name(), failure);
                self.append_error_log(&failure);
                RunEvent::RuntimeError(failure)
            }
        };
        self.finish(event);
    }

    fn finish(&self, event: RunEvent) {
        if self.terminating.load(Ordering::SeqCst) {
            self.core.finish(RunEvent::Cancelled);
        } else {
            self.core.finish(event);
        }
    }

    fn prepare_run_directory(&self, structure: &ModelSystemStructure, overwrite: bool) -> anyhow::Result<()> {
        let dir = self.core.run_directory();
        if overwrite && dir.exists() {
            fs::remove_dir_all(dir)
                .with_context(|| format!("Unable to clear run directory {}", dir.display()))?;
        }
        fs::create_dir_all(dir)
            .with_context(|| format!("Unable to create run directory {}", dir.display()))?;

        let snapshot = serde_json::to_string_pretty(structure)?;
        let file = dir.join(RUN_PARAMETERS_FILE);
        fs::write(&file, snapshot).with_context(|| format!("Unable to write {}", file.display()))?;
        Ok(())
    }

    fn append_error_log(&self, failure: &ErrorWithPath) {
        let file = self.core.run_directory().join(ERROR_LOG_FILE);
        let entry = format!(
            "{}\n\n{}\n",
            failure.message,
            failure.stack_trace.as_deref().unwrap_or_default()
        );
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
            .and_then(|mut f| f.write_all(entry.as_bytes()));
        if let Err(e) = written {
            warn!("Unable to append to {}: {}", file.display(), e);
        }
    }

    fn tree(&self) -> Option<Arc<ModuleTree>> {
        self.active.read().clone()
    }

    pub fn progress(&self) -> f32 {
        self.tree().map(|t| t.template.progress()).unwrap_or(0.0)
    }

    pub fn status(&self) -> String {
        self.tree().map(|t| t.template.status()).unwrap_or_default()
    }

    pub fn colour(&self) -> Colour {
        self.tree()
            .map(|t| t.template.progress_colour())
            .unwrap_or(Colour::DEFAULT)
    }

    pub fn reports(&self) -> &ProgressReports {
        &self.context.reports
    }

    pub fn progress_reports(&self) -> Vec<ProgressReport> {
        self.context.reports.snapshot()
    }

    pub fn exit_request(&self) -> bool {
        self.context.exit.request();
        self.tree().is_some_and(|t| t.template.exit_request())
    }

    pub fn deep_exit_request(&self) -> bool {
        self.context.exit.request();
        self.tree().is_some_and(|t| t.root.deep_exit_request())
    }

    /// Stop the run without waiting for it. A run that never started is
    /// cancelled silently; otherwise the worker gets a grace period to
    /// return before it is abandoned.
    pub fn terminate(self: &Arc<Self>) {
        if self.core.cancel_unstarted() || self.core.is_finished() {
            return;
        }
        self.terminating.store(true, Ordering::SeqCst);
        self.deep_exit_request();

        let worker = self.clone();
        let grace = self.config.termination_grace_period();
        let spawned = std::thread::Builder::new()
            .name(format!("terminate-{}", self.core.name()))
            .spawn(move || {
                if !worker.core.wait_timeout(grace) {
                    warn!(
                        "Run `{}` did not stop within {:?}; abandoning its worker",
                        worker.core.name(),
                        grace
                    );
                    worker.core.finish(RunEvent::Cancelled);
                }
            });
        if let Err(e) = spawned {
            warn!("Unable to start terminator thread: {}", e);
            self.core.finish(RunEvent::Cancelled);
        }
    }
}

/// Turn an error escaping the root into an [`ErrorWithPath`]; the innermost
/// [`ModuleRuntimeError`] in the chain decides the path.
pub(crate) fn attribute_failure(root: &ModuleNode, error: &anyhow::Error) -> ErrorWithPath {
    let stack_trace = format!("{:?}", error);
    let tagged = error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<ModuleRuntimeError>())
        .last();

    match tagged {
        Some(tag) => ErrorWithPath::new(root.find_path(tag.module()), tag.message())
            .with_stack_trace(stack_trace)
            .with_module_name(tag.module().name()),
        None => ErrorWithPath::unattributed(error.root_cause().to_string()).with_stack_trace(stack_trace),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
