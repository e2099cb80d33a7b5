//! Built-in modules available in every [`ModuleRegistry::with_builtins`].
//!
//! - `Sequence`: runs its child templates one after another.
//! - `Delay`: waits for `Millis` milliseconds, optionally ending with the
//!   error given in `Fail`. With `Report` set it publishes its progress as a
//!   named report while it waits. Useful for smoke-testing a deployment.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::anyhow;

use super::registry::ModuleRegistry;
use super::{ModelSystemTemplate, Module, RunContext};
use crate::error::ModuleRuntimeError;
use crate::types::Colour;

const POLL_SLICE: Duration = Duration::from_millis(10);

pub fn register(registry: &mut ModuleRegistry) {
    registry
        .register("Sequence", |spec| {
            Ok(Arc::new(Sequence {
                name: spec.name().to_string(),
                steps: spec.child_templates(),
                current: AtomicUsize::new(0),
                exiting: AtomicBool::new(false),
            }) as Arc<dyn Module>)
        })
        .register("Delay", |spec| {
            let millis: u64 = spec.parse_parameter("Millis")?;
            Ok(Arc::new(Delay {
                name: spec.name().to_string(),
                duration: Duration::from_millis(millis),
                fail: non_empty(spec.parameter("Fail")),
                report: non_empty(spec.parameter("Report")),
                progress: Arc::new(AtomicU32::new(0f32.to_bits())),
                exiting: AtomicBool::new(false),
            }) as Arc<dyn Module>)
        });
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Runs child templates in order.
pub struct Sequence {
    name: String,
    steps: Vec<(Arc<dyn Module>, Arc<dyn ModelSystemTemplate>)>,
    current: AtomicUsize,
    exiting: AtomicBool,
}

impl Module for Sequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_template(&self) -> Option<&dyn ModelSystemTemplate> {
        Some(self)
    }

    fn into_template(self: Arc<Self>) -> Option<Arc<dyn ModelSystemTemplate>> {
        Some(self)
    }
}

impl ModelSystemTemplate for Sequence {
    fn start(&self, ctx: &RunContext) -> anyhow::Result<()> {
        for (index, (module, step)) in self.steps.iter().enumerate() {
            if self.exiting.load(Ordering::SeqCst) || ctx.exit_requested() {
                tracing::info!("Sequence `{}` stopping before step {}", self.name, index);
                break;
            }
            self.current.store(index, Ordering::SeqCst);
            if let Err(e) = step.start(ctx) {
                // keep an existing attribution, otherwise blame the step
                let tagged = e.chain().any(|c| c.is::<ModuleRuntimeError>());
                return Err(if tagged {
                    e
                } else {
                    ModuleRuntimeError::new(module.clone(), format!("{:#}", e)).into()
                });
            }
        }
        self.current.store(self.steps.len(), Ordering::SeqCst);
        Ok(())
    }

    fn exit_request(&self) -> bool {
        self.exiting.store(true, Ordering::SeqCst);
        true
    }

    fn progress(&self) -> f32 {
        if self.steps.is_empty() {
            return 1.0;
        }
        let current = self.current.load(Ordering::SeqCst);
        let partial = self
            .steps
            .get(current)
            .map(|(_, step)| step.progress().clamp(0.0, 1.0))
            .unwrap_or(0.0);
        ((current as f32 + partial) / self.steps.len() as f32).min(1.0)
    }

    fn status(&self) -> String {
        let current = self.current.load(Ordering::SeqCst);
        match self.steps.get(current) {
            Some((_, step)) => format!("{}: {}", self.name, step.status()),
            None => self.name.clone(),
        }
    }
}

/// Waits for a fixed duration, checking for exit requests as it goes.
pub struct Delay {
    name: String,
    duration: Duration,
    fail: Option<String>,
    report: Option<String>,
    progress: Arc<AtomicU32>,
    exiting: AtomicBool,
}

impl Delay {
    fn set_progress(&self, value: f32) {
        self.progress.store(value.to_bits(), Ordering::SeqCst);
    }

    fn wait(&self, ctx: &RunContext) {
        let began = Instant::now();
        loop {
            let elapsed = began.elapsed();
            if elapsed >= self.duration {
                self.set_progress(1.0);
                return;
            }
            if self.exiting.load(Ordering::SeqCst) || ctx.exit_requested() {
                return;
            }
            self.set_progress(elapsed.as_secs_f32() / self.duration.as_secs_f32());
            std::thread::sleep(POLL_SLICE.min(self.duration - elapsed));
        }
    }
}

impl Module for Delay {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_template(&self) -> Option<&dyn ModelSystemTemplate> {
        Some(self)
    }

    fn into_template(self: Arc<Self>) -> Option<Arc<dyn ModelSystemTemplate>> {
        Some(self)
    }
}

impl ModelSystemTemplate for Delay {
    fn start(&self, ctx: &RunContext) -> anyhow::Result<()> {
        if let Some(report) = &self.report {
            let progress = self.progress.clone();
            ctx.reports.create(report.as_str(), Colour::DEFAULT, move || {
                f32::from_bits(progress.load(Ordering::SeqCst))
            });
        }
        self.wait(ctx);
        if let Some(report) = &self.report {
            ctx.reports.remove(report);
        }
        if self.progress() < 1.0 {
            return Ok(());
        }
        match &self.fail {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(()),
        }
    }

    fn exit_request(&self) -> bool {
        self.exiting.store(true, Ordering::SeqCst);
        true
    }

    fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::SeqCst))
    }
}

/// Template that records the order in which it was started; test helper.
#[cfg(test)]
pub(crate) struct Recorder {
    pub name: String,
    pub log: Arc<parking_lot::Mutex<Vec<String>>>,
}

#[cfg(test)]
impl Module for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn into_template(self: Arc<Self>) -> Option<Arc<dyn ModelSystemTemplate>> {
        Some(self)
    }
}

#[cfg(test)]
impl ModelSystemTemplate for Recorder {
    fn start(&self, _ctx: &RunContext) -> anyhow::Result<()> {
        self.log.lock().push(self.name.clone());
        Ok(())
    }

    fn exit_request(&self) -> bool {
        false
    }

    fn progress(&self) -> f32 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::model::{ModelSystemBuilder, ModelSystemStructure, ReportChange};
    use crate::types::RunName;
    use parking_lot::Mutex;

    fn ctx() -> RunContext {
        RunContext::new(
            RunName::new("test"),
            std::env::temp_dir(),
            Arc::new(OrchestratorConfig::default()),
        )
    }

    #[test]
    fn test_sequence_runs_steps_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ModuleRegistry::with_builtins();
        let shared = log.clone();
        registry.register("Recorder", move |spec| {
            Ok(Arc::new(Recorder {
                name: spec.name().to_string(),
                log: shared.clone(),
            }) as Arc<dyn Module>)
        });

        let structure = ModelSystemStructure::new("All", "Sequence")
            .with_child(ModelSystemStructure::new("first", "Recorder"))
            .with_child(ModelSystemStructure::new("second", "Recorder"));
        let tree = registry
            .build(&structure, &OrchestratorConfig::default())
            .unwrap_or_else(|e| panic!("unexpected errors: {e:?}"));

        tree.template.start(&ctx()).unwrap();
        assert_eq!(*log.lock(), vec!["first".to_string(), "second".to_string()]);
        assert_eq!(tree.template.progress(), 1.0);
    }

    #[test]
    fn test_sequence_attributes_failing_step() {
        let registry = ModuleRegistry::with_builtins();
        let structure = ModelSystemStructure::new("All", "Sequence")
            .with_child(ModelSystemStructure::new("ok", "Delay").with_parameter("Millis", "0"))
            .with_child(
                ModelSystemStructure::new("broken", "Delay")
                    .with_parameter("Millis", "0")
                    .with_parameter("Fail", "ran out of zones"),
            );
        let tree = registry
            .build(&structure, &OrchestratorConfig::default())
            .unwrap_or_else(|e| panic!("unexpected errors: {e:?}"));

        let err = tree.template.start(&ctx()).unwrap_err();
        let tagged = err.downcast_ref::<ModuleRuntimeError>().unwrap();
        assert_eq!(tagged.message(), "ran out of zones");
        let module = tagged.module();
        assert_eq!(tree.root.find_path(module), Some(vec![1].into()));
    }

    #[test]
    fn test_delay_stops_on_exit_request() {
        let registry = ModuleRegistry::with_builtins();
        let structure = ModelSystemStructure::new("Wait", "Delay").with_parameter("Millis", "60000");
        let tree = registry
            .build(&structure, &OrchestratorConfig::default())
            .unwrap_or_else(|e| panic!("unexpected errors: {e:?}"));

        let context = ctx();
        context.exit.request();
        let began = Instant::now();
        tree.template.start(&context).unwrap();
        assert!(began.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_delay_publishes_named_report_while_waiting() {
        let registry = ModuleRegistry::with_builtins();
        let structure = ModelSystemStructure::new("Wait", "Delay")
            .with_parameter("Millis", "0")
            .with_parameter("Report", "Warm-up");
        let tree = registry
            .build(&structure, &OrchestratorConfig::default())
            .unwrap_or_else(|e| panic!("unexpected errors: {e:?}"));

        let context = ctx();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        context
            .reports
            .observe(Arc::new(move |c: &ReportChange| sink.lock().push(c.clone())));
        tree.template.start(&context).unwrap();

        assert_eq!(
            *changes.lock(),
            vec![
                ReportChange::Created {
                    name: "Warm-up".into(),
                    colour: Colour::DEFAULT
                },
                ReportChange::Removed("Warm-up".into()),
            ]
        );
        assert!(context.reports.is_empty());
    }

    #[test]
    fn test_delay_requires_millis() {
        let registry = ModuleRegistry::with_builtins();
        let structure = ModelSystemStructure::new("Wait", "Delay");
        assert!(registry.build(&structure, &OrchestratorConfig::default()).is_err());
    }
}
