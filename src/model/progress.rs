//! Named progress bars a model system publishes next to its overall progress.
//!
//! A module registers a report with a callback that is polled whenever an
//! observer asks for a snapshot. Remote hosts keep a mirror of the worker's
//! reports whose values are refreshed from progress replies instead.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::Colour;

/// Callback polled for a report's current value.
pub type ProgressSource = Arc<dyn Fn() -> f32 + Send + Sync>;

/// Receives every change to the set of reports as it happens.
pub type ReportObserver = Arc<dyn Fn(&ReportChange) + Send + Sync>;

/// Point-in-time value of one named report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub name: String,
    pub progress: f32,
    pub colour: Colour,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportChange {
    Created { name: String, colour: Colour },
    Removed(String),
    Cleared,
}

struct Entry {
    name: String,
    colour: Colour,
    /// `None` for mirrored reports, whose value arrives from elsewhere.
    source: Option<ProgressSource>,
    last: f32,
}

#[derive(Default)]
struct Reports {
    entries: Vec<Entry>,
    observer: Option<ReportObserver>,
}

/// The set of named reports of one run. Clones share the same set.
#[derive(Clone, Default)]
pub struct ProgressReports {
    inner: Arc<Mutex<Reports>>,
}

impl ProgressReports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a report, or recolour the existing one with the same name.
    pub fn create<F>(&self, name: impl Into<String>, colour: Colour, source: F)
    where
        F: Fn() -> f32 + Send + Sync + 'static,
    {
        self.insert(name.into(), colour, Some(Arc::new(source)));
    }

    /// Returns whether a report with that name existed.
    pub fn remove(&self, name: &str) -> bool {
        let removed = {
            let mut reports = self.inner.lock();
            let before = reports.entries.len();
            reports.entries.retain(|e| e.name != name);
            reports.entries.len() != before
        };
        if removed {
            self.notify(ReportChange::Removed(name.to_string()));
        }
        removed
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
        self.notify(ReportChange::Cleared);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current value of every report, in creation order.
    pub fn snapshot(&self) -> Vec<ProgressReport> {
        let polled: Vec<_> = {
            let reports = self.inner.lock();
            reports
                .entries
                .iter()
                .map(|e| (e.name.clone(), e.colour, e.source.clone(), e.last))
                .collect()
        };
        // sources run outside the lock; they may touch the reports themselves
        polled
            .into_iter()
            .map(|(name, colour, source, last)| ProgressReport {
                name,
                progress: source.map(|s| s()).unwrap_or(last),
                colour,
            })
            .collect()
    }

    pub(crate) fn observe(&self, observer: ReportObserver) {
        self.inner.lock().observer = Some(observer);
    }

    /// Track a report created elsewhere; its value comes from [`Self::record`].
    pub(crate) fn mirror(&self, name: String, colour: Colour) {
        self.insert(name, colour, None);
    }

    /// Store reported values for known mirrored reports; unknown names are ignored.
    pub(crate) fn record(&self, values: &[ProgressReport]) {
        let mut reports = self.inner.lock();
        for value in values {
            if let Some(entry) = reports
                .entries
                .iter_mut()
                .find(|e| e.name == value.name && e.source.is_none())
            {
                entry.last = value.progress;
            }
        }
    }

    fn insert(&self, name: String, colour: Colour, source: Option<ProgressSource>) {
        {
            let mut reports = self.inner.lock();
            if let Some(existing) = reports.entries.iter_mut().find(|e| e.name == name) {
                existing.colour = colour;
                return;
            }
            reports.entries.push(Entry {
                name: name.clone(),
                colour,
                source,
                last: 0.0,
            });
        }
        self.notify(ReportChange::Created { name, colour });
    }

    fn notify(&self, change: ReportChange) {
        let observer = self.inner.lock().observer.clone();
        if let Some(observer) = observer {
            observer(&change);
        }
    }
}

impl fmt::Debug for ProgressReports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reports = self.inner.lock();
        f.debug_list().entries(reports.entries.iter().map(|e| &e.name)).finish()
    }
}
