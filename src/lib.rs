//! Run orchestration for model systems.
//!
//! A model system is a tree of configurable modules whose root can drive an
//! execution. This crate validates such a tree, executes it on a worker
//! thread or in a separate worker process, attributes failures to the module
//! that caused them, and schedules runs through a [`RunController`].

pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod remote;
pub mod run;
pub mod types;

pub use config::OrchestratorConfig;
pub use controller::{DelayedRun, RunController};
pub use error::{ErrorWithPath, ModulePath, ModuleRuntimeError, ProtocolError, RunError};
pub use model::{
    ModelSystemBuilder, ModelSystemDocument, ModelSystemStructure, ModelSystemTemplate, Module,
    ModuleRegistry, ProgressReport, ProgressReports, RunContext,
};
pub use remote::{RemoteClientRun, RemoteHostRun};
pub use run::{LocalRun, Run, RunEvent, RunListener, RunPhase, create_run};
pub use types::{Colour, ConfigReference, RunId, RunName};
