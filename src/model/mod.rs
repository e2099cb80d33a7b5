//! Module-tree model: the executable side of a model system.
//!
//! A model system is described by a serializable [`ModelSystemStructure`] and
//! turned into an executable [`ModuleTree`] by a [`ModelSystemBuilder`]. The
//! orchestration core never reshapes a tree; it only walks it to validate,
//! attribute failures, request exits and dispose modules.

pub mod builtin;
pub mod progress;
pub mod reference;
pub mod registry;
pub mod structure;

pub use progress::{ProgressReport, ProgressReports, ReportChange};
pub use reference::{ParameterReference, PathSegment};
pub use registry::{ModuleRegistry, ModuleSpec};
pub use structure::{LinkedParameter, ModelSystemDocument, ModelSystemStructure, ParameterValue};

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::OrchestratorConfig;
use crate::error::{ErrorWithPath, ModulePath};
use crate::types::{Colour, RunName};

/// A configured node of a model system.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Check resolved parameters right before execution.
    fn runtime_validation(&self) -> Result<(), String> {
        Ok(())
    }

    /// Modules that can run a model system expose themselves here.
    fn as_template(&self) -> Option<&dyn ModelSystemTemplate> {
        None
    }

    /// Owned variant of [`Module::as_template`], used for the tree root.
    fn into_template(self: Arc<Self>) -> Option<Arc<dyn ModelSystemTemplate>> {
        None
    }

    /// Release resources once the run is over.
    fn dispose(&self) {}
}

/// A module able to drive (part of) a model system.
pub trait ModelSystemTemplate: Module {
    /// Execute synchronously on the run's worker thread.
    fn start(&self, ctx: &RunContext) -> anyhow::Result<()>;

    /// Ask the template to stop at its next opportunity.
    fn exit_request(&self) -> bool;

    fn progress(&self) -> f32;

    fn progress_colour(&self) -> Colour {
        Colour::DEFAULT
    }

    fn status(&self) -> String {
        self.name().to_string()
    }
}

/// Shared cooperative-exit flag for one run.
#[derive(Debug, Clone, Default)]
pub struct ExitSignal(Arc<AtomicBool>);

impl ExitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives the text of a model system saved during a run.
pub type SaveHook = Arc<dyn Fn(String) + Send + Sync>;

/// Everything a model system needs to know about the run executing it.
///
/// Modules resolve relative file paths against [`RunContext::run_directory`]
/// instead of relying on the process working directory.
#[derive(Clone)]
pub struct RunContext {
    pub run_name: RunName,
    pub run_directory: PathBuf,
    pub config: Arc<OrchestratorConfig>,
    pub exit: ExitSignal,
    pub reports: ProgressReports,
    on_save: Option<SaveHook>,
}

impl RunContext {
    pub fn new(run_name: RunName, run_directory: impl Into<PathBuf>, config: Arc<OrchestratorConfig>) -> Self {
        Self {
            run_name,
            run_directory: run_directory.into(),
            config,
            exit: ExitSignal::new(),
            reports: ProgressReports::new(),
            on_save: None,
        }
    }

    pub(crate) fn with_save_hook(mut self, hook: SaveHook) -> Self {
        self.on_save = Some(hook);
        self
    }

    /// Hand an updated model system back to whoever started the run.
    pub fn save_model_system(&self, structure: &ModelSystemStructure) -> serde_json::Result<()> {
        let text = ModelSystemDocument::new(structure.clone()).to_text()?;
        match &self.on_save {
            Some(hook) => hook(text),
            None => tracing::debug!("Run `{}` has nowhere to save its model system", self.run_name),
        }
        Ok(())
    }

    /// Resolve `path` relative to the run directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.run_directory.join(path)
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.is_requested()
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_name", &self.run_name)
            .field("run_directory", &self.run_directory)
            .field("exit", &self.exit)
            .field("reports", &self.reports)
            .finish_non_exhaustive()
    }
}

/// One node of an executable tree.
pub struct ModuleNode {
    pub name: String,
    /// Field of the parent this node is bound to (absent for collection items).
    pub parent_field_name: Option<String>,
    pub is_collection: bool,
    /// Optional nodes left unset carry no module.
    pub module: Option<Arc<dyn Module>>,
    pub children: Vec<ModuleNode>,
}

impl ModuleNode {
    pub fn new(name: impl Into<String>, module: Option<Arc<dyn Module>>) -> Self {
        Self {
            name: name.into(),
            parent_field_name: None,
            is_collection: false,
            module,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<ModuleNode>) -> Self {
        self.children = children;
        self
    }

    /// Depth-first search for `target` by identity.
    pub fn find_path(&self, target: &Arc<dyn Module>) -> Option<ModulePath> {
        let mut path = Vec::new();
        self.explore(target, &mut path).then(|| ModulePath::from(path))
    }

    fn explore(&self, target: &Arc<dyn Module>, path: &mut Vec<usize>) -> bool {
        if let Some(module) = &self.module {
            if std::ptr::addr_eq(Arc::as_ptr(module), Arc::as_ptr(target)) {
                return true;
            }
        }
        for (index, child) in self.children.iter().enumerate() {
            path.push(index);
            if child.explore(target, path) {
                return true;
            }
            path.pop();
        }
        false
    }

    /// Runtime-validate every node, collecting all failures.
    pub fn runtime_validation(&self) -> Vec<ErrorWithPath> {
        let mut errors = Vec::new();
        self.collect_runtime_errors(ModulePath::root(), &mut errors);
        errors
    }

    fn collect_runtime_errors(&self, path: ModulePath, errors: &mut Vec<ErrorWithPath>) {
        if let Some(module) = &self.module {
            if let Err(reason) = module.runtime_validation() {
                errors.push(
                    ErrorWithPath::new(
                        Some(path.clone()),
                        format!("Runtime validation error in {}: {}", self.name, reason),
                    )
                    .with_module_name(module.name()),
                );
            }
        }
        for (index, child) in self.children.iter().enumerate() {
            child.collect_runtime_errors(path.child(index), errors);
        }
    }

    /// Ask every template in the subtree to exit; true if any agreed.
    pub fn deep_exit_request(&self) -> bool {
        let children = self
            .children
            .iter()
            .fold(false, |acc, child| child.deep_exit_request() | acc);
        let own = self
            .module
            .as_ref()
            .and_then(|m| m.as_template())
            .is_some_and(|t| t.exit_request());
        children | own
    }

    /// Dispose every module in the subtree, ignoring panics from individual modules.
    pub fn dispose_all(&self) {
        if let Some(module) = &self.module {
            if catch_unwind(AssertUnwindSafe(|| module.dispose())).is_err() {
                tracing::warn!("Module `{}` panicked while disposing", self.name);
            }
        }
        for child in &self.children {
            child.dispose_all();
        }
    }
}

/// A fully built model system: the node tree plus its root template.
pub struct ModuleTree {
    pub root: ModuleNode,
    pub template: Arc<dyn ModelSystemTemplate>,
}

/// Collaborator that turns a description into an executable tree.
///
/// Structural validation failures come back as the error list; an empty
/// list is never returned as an error.
pub trait ModelSystemBuilder: Send + Sync {
    fn build(
        &self,
        structure: &ModelSystemStructure,
        config: &OrchestratorConfig,
    ) -> Result<ModuleTree, Vec<ErrorWithPath>>;
}
