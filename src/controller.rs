//! Admission policy for runs.
//!
//! The controller keeps three collections behind one lock: the runs that
//! are executing, a FIFO backlog, and a list of delayed runs sorted by start
//! time. By default only one run executes at a time; each terminal event
//! frees the slot and admits the backlog head.

use std::collections::VecDeque;
use std::sync::{Arc, Once, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::OrchestratorConfig;
use crate::run::{Run, RunEvent};
use crate::types::RunId;

/// A run waiting for its start time.
#[derive(Clone)]
pub struct DelayedRun {
    pub start_time: DateTime<Utc>,
    pub run: Arc<dyn Run>,
}

#[derive(Default)]
struct Queues {
    executing: Vec<Arc<dyn Run>>,
    backlog: VecDeque<Arc<dyn Run>>,
    /// Sorted by ascending start time; equal times keep insertion order.
    delayed: Vec<DelayedRun>,
}

impl Queues {
    fn remove(&mut self, id: RunId) {
        self.executing.retain(|r| r.id() != id);
        self.remove_pending(id);
    }

    fn remove_pending(&mut self, id: RunId) {
        self.backlog.retain(|r| r.id() != id);
        self.delayed.retain(|d| d.run.id() != id);
    }
}

struct ControllerState {
    queues: Mutex<Queues>,
    poller: Once,
    poll_interval: Duration,
}

/// Schedules runs: immediately, after the current one, or at a given time.
#[derive(Clone)]
pub struct RunController {
    state: Arc<ControllerState>,
}

impl RunController {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self::with_poll_interval(config.delayed_poll_interval())
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Arc::new(ControllerState {
                queues: Mutex::new(Queues::default()),
                poller: Once::new(),
                poll_interval,
            }),
        }
    }

    /// Start `run` now if nothing is executing (or `execute_now` is set),
    /// otherwise append it to the backlog.
    pub fn execute_run(&self, run: Arc<dyn Run>, execute_now: bool) {
        self.state.admit(run, execute_now);
    }

    /// Start `run` once `start_time` has passed.
    pub fn execute_delayed_run(&self, run: Arc<dyn Run>, start_time: DateTime<Utc>) {
        if start_time <= Utc::now() {
            self.execute_run(run, false);
            return;
        }

        info!("Run `{}` scheduled for {}", run.name(), start_time);
        {
            let mut queues = self.state.queues.lock();
            let position = queues
                .delayed
                .iter()
                .position(|d| d.start_time > start_time)
                .unwrap_or(queues.delayed.len());
            queues.delayed.insert(position, DelayedRun { start_time, run });
        }
        self.state.ensure_poller();
    }

    /// Ask an executing run to exit, or drop a waiting run and terminate it
    /// without raising any event.
    pub fn cancel_run(&self, run: &dyn Run) {
        let id = run.id();
        let executing = {
            let mut queues = self.state.queues.lock();
            if queues.executing.iter().any(|r| r.id() == id) {
                true
            } else {
                queues.remove_pending(id);
                false
            }
        };

        if executing {
            info!("Requesting exit for run `{}`", run.name());
            run.exit_request();
        } else {
            info!("Cancelling queued run `{}`", run.name());
            run.terminate_run();
        }
    }

    /// Move a backlogged run to `index`, clamped to the backlog length.
    /// Returns false if the run is not in the backlog.
    pub fn reorder_queued_run(&self, run: &dyn Run, index: usize) -> bool {
        let id = run.id();
        let mut queues = self.state.queues.lock();
        let Some(current) = queues.backlog.iter().position(|r| r.id() == id) else {
            return false;
        };
        let Some(entry) = queues.backlog.remove(current) else {
            return false;
        };
        let index = index.min(queues.backlog.len());
        queues.backlog.insert(index, entry);
        true
    }

    pub fn executing_runs(&self) -> Vec<Arc<dyn Run>> {
        self.state.queues.lock().executing.clone()
    }

    pub fn queued_runs(&self) -> Vec<Arc<dyn Run>> {
        self.state.queues.lock().backlog.iter().cloned().collect()
    }

    pub fn delayed_runs(&self) -> Vec<DelayedRun> {
        self.state.queues.lock().delayed.clone()
    }

    #[cfg(test)]
    fn promote_due_runs(&self, now: DateTime<Utc>) {
        self.state.promote_due_runs(now);
    }
}

impl ControllerState {
    fn admit(self: &Arc<Self>, run: Arc<dyn Run>, execute_now: bool) {
        let id = run.id();
        let weak: Weak<Self> = Arc::downgrade(self);
        run.subscribe(Arc::new(move |event: &RunEvent| {
            if event.is_terminal() {
                if let Some(state) = weak.upgrade() {
                    state.on_finished(id);
                }
            }
        }));

        let start_now = {
            let mut queues = self.queues.lock();
            if execute_now || queues.executing.is_empty() {
                queues.executing.push(run.clone());
                true
            } else {
                queues.backlog.push_back(run.clone());
                false
            }
        };

        if start_now {
            self.start_run(run);
        } else {
            debug!("Run `{}` queued", run.name());
        }
    }

    fn start_run(self: &Arc<Self>, run: Arc<dyn Run>) {
        info!("Starting run `{}`", run.name());
        if let Err(e) = run.start() {
            error!("Run `{}` failed to start: {}", run.name(), e);
            // may already have run through the terminal-event listener
            self.on_finished(run.id());
        }
    }

    /// Bookkeeping after a run has finished: release its slot and admit the
    /// backlog head if nothing else is executing.
    fn on_finished(self: &Arc<Self>, id: RunId) {
        let next = {
            let mut queues = self.queues.lock();
            queues.remove(id);
            if queues.executing.is_empty() {
                let next = queues.backlog.pop_front();
                if let Some(run) = &next {
                    queues.executing.push(run.clone());
                }
                next
            } else {
                None
            }
        };
        if let Some(run) = next {
            self.start_run(run);
        }
    }

    fn promote_due_runs(self: &Arc<Self>, now: DateTime<Utc>) {
        let due: Vec<Arc<dyn Run>> = {
            let mut queues = self.queues.lock();
            let count = queues.delayed.iter().take_while(|d| d.start_time <= now).count();
            queues.delayed.drain(..count).map(|d| d.run).collect()
        };
        for run in due {
            info!("Delayed run `{}` is due", run.name());
            self.admit(run, false);
        }
    }

    fn ensure_poller(self: &Arc<Self>) {
        self.poller.call_once(|| {
            let weak = Arc::downgrade(self);
            let interval = self.poll_interval;
            let spawned = std::thread::Builder::new()
                .name("delayed-run-poller".to_string())
                .spawn(move || {
                    loop {
                        std::thread::sleep(interval);
                        let Some(state) = weak.upgrade() else {
                            debug!("Controller dropped; delayed-run poller exiting");
                            break;
                        };
                        state.promote_due_runs(Utc::now());
                    }
                });
            if let Err(e) = spawned {
                error!("Unable to start delayed-run poller: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorWithPath, RunError};
    use crate::run::{RunCore, RunPhase};
    use crate::types::{Colour, RunName};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Run whose outcome the test decides.
    struct ManualRun {
        core: RunCore,
        fail_start: bool,
        starts: AtomicU32,
        exit_requests: AtomicU32,
        terminations: AtomicU32,
    }

    impl ManualRun {
        fn new(name: &str) -> Arc<Self> {
            Self::build(name, false)
        }

        fn failing(name: &str) -> Arc<Self> {
            Self::build(name, true)
        }

        fn build(name: &str, fail_start: bool) -> Arc<Self> {
            Arc::new(Self {
                core: RunCore::new(RunName::new(name), format!("/tmp/{name}")),
                fail_start,
                starts: AtomicU32::new(0),
                exit_requests: AtomicU32::new(0),
                terminations: AtomicU32::new(0),
            })
        }

        fn complete(&self) {
            self.core.finish(RunEvent::Completed);
        }

        fn started(&self) -> bool {
            self.starts.load(Ordering::SeqCst) > 0
        }
    }

    impl Run for ManualRun {
        fn core(&self) -> &RunCore {
            &self.core
        }

        fn runs_remotely(&self) -> bool {
            false
        }

        fn start(&self) -> Result<(), RunError> {
            self.core.try_begin()?;
            if self.fail_start {
                self.core
                    .finish(RunEvent::RuntimeError(ErrorWithPath::unattributed("no threads left")));
                return Err(RunError::Spawn {
                    name: self.name().to_string(),
                    source: std::io::Error::other("no threads left"),
                });
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.core.set_phase(RunPhase::Running);
            Ok(())
        }

        fn exit_request(&self) -> bool {
            self.exit_requests.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn deep_exit_request(&self) -> bool {
            self.exit_request()
        }

        fn terminate_run(&self) {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            if !self.core.cancel_unstarted() {
                self.core.finish(RunEvent::Cancelled);
            }
        }

        fn poll_progress(&self) -> f32 {
            0.0
        }

        fn poll_status_message(&self) -> String {
            String::new()
        }

        fn poll_colour(&self) -> Colour {
            Colour::DEFAULT
        }
    }

    fn ids(runs: &[Arc<dyn Run>]) -> Vec<RunId> {
        runs.iter().map(|r| r.id()).collect()
    }

    fn controller() -> RunController {
        RunController::with_poll_interval(Duration::from_secs(3600))
    }

    #[test]
    fn test_backlog_is_fifo() {
        let controller = controller();
        let (a, b, c) = (ManualRun::new("a"), ManualRun::new("b"), ManualRun::new("c"));
        controller.execute_run(a.clone(), false);
        controller.execute_run(b.clone(), false);
        controller.execute_run(c.clone(), false);

        assert!(a.started());
        assert!(!b.started());
        assert_eq!(ids(&controller.queued_runs()), vec![b.id(), c.id()]);

        a.complete();
        assert!(b.started());
        assert!(!c.started());
        assert_eq!(ids(&controller.executing_runs()), vec![b.id()]);

        b.complete();
        assert!(c.started());
        c.complete();
        assert!(controller.executing_runs().is_empty());
        assert!(controller.queued_runs().is_empty());
    }

    #[test]
    fn test_execute_now_bypasses_backlog() {
        let controller = controller();
        let (a, b) = (ManualRun::new("a"), ManualRun::new("b"));
        controller.execute_run(a.clone(), false);
        controller.execute_run(b.clone(), true);

        assert!(a.started() && b.started());
        assert_eq!(controller.executing_runs().len(), 2);
    }

    #[test]
    fn test_cancel_queued_run_is_silent() {
        let controller = controller();
        let (a, b, c) = (ManualRun::new("a"), ManualRun::new("b"), ManualRun::new("c"));
        controller.execute_run(a.clone(), false);
        controller.execute_run(b.clone(), false);
        controller.execute_run(c.clone(), false);

        controller.cancel_run(b.as_ref());
        assert_eq!(b.terminations.load(Ordering::SeqCst), 1);
        assert_eq!(b.phase(), RunPhase::Cancelled);
        assert_eq!(ids(&controller.queued_runs()), vec![c.id()]);

        a.complete();
        assert!(!b.started());
        assert!(c.started());
    }

    #[test]
    fn test_cancel_executing_run_asks_it_to_exit() {
        let controller = controller();
        let a = ManualRun::new("a");
        controller.execute_run(a.clone(), false);

        controller.cancel_run(a.as_ref());
        assert_eq!(a.exit_requests.load(Ordering::SeqCst), 1);
        assert_eq!(a.terminations.load(Ordering::SeqCst), 0);
        assert_eq!(controller.executing_runs().len(), 1);

        a.complete();
        assert!(controller.executing_runs().is_empty());
    }

    #[test]
    fn test_reorder_queued_run() {
        let controller = controller();
        let runs: Vec<_> = ["a", "b", "c", "d"].into_iter().map(ManualRun::new).collect();
        for run in &runs {
            controller.execute_run(run.clone(), false);
        }

        assert!(controller.reorder_queued_run(runs[3].as_ref(), 0));
        assert_eq!(
            ids(&controller.queued_runs()),
            vec![runs[3].id(), runs[1].id(), runs[2].id()]
        );
        assert!(controller.reorder_queued_run(runs[3].as_ref(), 99));
        assert_eq!(
            ids(&controller.queued_runs()),
            vec![runs[1].id(), runs[2].id(), runs[3].id()]
        );
        assert!(!controller.reorder_queued_run(runs[0].as_ref(), 0));
    }

    #[test]
    fn test_failed_start_frees_the_slot() {
        let controller = controller();
        let (a, broken, c) = (ManualRun::new("a"), ManualRun::failing("broken"), ManualRun::new("c"));
        controller.execute_run(a.clone(), false);
        controller.execute_run(broken.clone(), false);
        controller.execute_run(c.clone(), false);

        a.complete();
        assert!(c.started());
        assert_eq!(c.starts.load(Ordering::SeqCst), 1);
        assert_eq!(broken.phase(), RunPhase::RuntimeError);
        assert_eq!(ids(&controller.executing_runs()), vec![c.id()]);
        assert!(controller.queued_runs().is_empty());
    }

    #[test]
    fn test_delayed_runs_are_sorted_and_promoted_in_order() {
        let controller = controller();
        let now = Utc::now();
        let late = ManualRun::new("late");
        let early = ManualRun::new("early");
        let middle = ManualRun::new("middle");
        controller.execute_delayed_run(late.clone(), now + chrono::Duration::hours(3));
        controller.execute_delayed_run(early.clone(), now + chrono::Duration::hours(1));
        controller.execute_delayed_run(middle.clone(), now + chrono::Duration::hours(2));

        let order: Vec<RunId> = controller.delayed_runs().iter().map(|d| d.run.id()).collect();
        assert_eq!(order, vec![early.id(), middle.id(), late.id()]);

        controller.promote_due_runs(now + chrono::Duration::minutes(150));
        assert!(early.started());
        assert!(!middle.started());
        assert_eq!(ids(&controller.queued_runs()), vec![middle.id()]);
        assert_eq!(controller.delayed_runs().len(), 1);

        early.complete();
        assert!(middle.started());
    }

    #[test]
    fn test_past_start_time_executes_immediately() {
        let controller = controller();
        let a = ManualRun::new("a");
        controller.execute_delayed_run(a.clone(), Utc::now() - chrono::Duration::seconds(5));
        assert!(a.started());
        assert!(controller.delayed_runs().is_empty());
    }

    #[test]
    fn test_poller_promotes_due_run() {
        let controller = RunController::with_poll_interval(Duration::from_millis(10));
        let a = ManualRun::new("a");
        controller.execute_delayed_run(a.clone(), Utc::now() + chrono::Duration::milliseconds(30));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !a.started() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(a.started());
    }
}
