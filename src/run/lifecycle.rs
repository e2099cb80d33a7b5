use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::{RunEvent, RunPhase};
use crate::error::RunError;
use crate::types::{RunId, RunName};

/// Callback invoked for every event a run raises, on whichever thread
/// raised it.
pub type RunListener = Arc<dyn Fn(&RunEvent) + Send + Sync>;

/// Lifecycle state shared by every run variant.
///
/// Guarantees at most one terminal event per run and lets callers block
/// until the run has finished.
pub struct RunCore {
    id: RunId,
    name: RunName,
    run_directory: PathBuf,
    phase: Mutex<RunPhase>,
    listeners: Mutex<Vec<RunListener>>,
    started: AtomicBool,
    finished: AtomicBool,
    done: Mutex<bool>,
    done_signal: Condvar,
}

impl RunCore {
    pub fn new(name: RunName, run_directory: impl Into<PathBuf>) -> Self {
        Self {
            id: RunId::new(),
            name,
            run_directory: run_directory.into(),
            phase: Mutex::new(RunPhase::Created),
            listeners: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn name(&self) -> &RunName {
        &self.name
    }

    pub fn run_directory(&self) -> &Path {
        &self.run_directory
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.lock()
    }

    pub fn subscribe(&self, listener: RunListener) {
        self.listeners.lock().push(listener);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Mark the run as started; fails on the second call.
    pub fn try_begin(&self) -> Result<(), RunError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RunError::AlreadyStarted(self.name.to_string()));
        }
        Ok(())
    }

    /// Move to a non-terminal phase. Ignored once the run has finished.
    pub fn set_phase(&self, phase: RunPhase) {
        let mut current = self.phase.lock();
        if !current.is_terminal() {
            *current = phase;
        }
    }

    /// Deliver a non-terminal event. Suppressed once the run has finished.
    pub fn emit(&self, event: RunEvent) {
        if self.is_finished() {
            debug!("Run `{}` dropped late event {:?}", self.name, event);
            return;
        }
        self.notify(&event);
    }

    /// Deliver the terminal event, if no other terminal event has been
    /// delivered yet. Returns whether this call won.
    pub fn finish(&self, event: RunEvent) -> bool {
        let Some(phase) = event.terminal_phase() else {
            self.emit(event);
            return false;
        };
        if self
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Run `{}` already finished; ignoring {:?}", self.name, phase);
            return false;
        }
        *self.phase.lock() = phase;
        info!("Run `{}` finished: {}", self.name, phase.as_str());

        self.notify(&event);
        self.release_waiters();
        true
    }

    /// Finish a run that never started, without notifying anyone.
    pub fn cancel_unstarted(&self) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.finished.store(true, Ordering::SeqCst);
        *self.phase.lock() = RunPhase::Cancelled;
        info!("Run `{}` cancelled before it started", self.name);
        self.release_waiters();
        true
    }

    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.done_signal.wait(&mut done);
        }
    }

    /// Wait up to `timeout`; returns whether the run has finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.done_signal.wait_until(&mut done, deadline).timed_out() {
                break;
            }
        }
        *done
    }

    fn notify(&self, event: &RunEvent) {
        // listeners may call back into the run (or the controller)
        let listeners: Vec<RunListener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(event);
        }
    }

    fn release_waiters(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.done_signal.notify_all();
    }
}
