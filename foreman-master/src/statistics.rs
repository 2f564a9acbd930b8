use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the master and its assignment engine.
pub struct MasterStatistics(Arc<MasterStatisticsInner>);

impl Deref for MasterStatistics {
    type Target = MasterStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct MasterStatisticsInner {
    /// The number of terms this process has started as master.
    pub(crate) num_terms: Counter,
    /// The number of live workers known to the current term.
    pub(crate) num_live_workers: Counter,
    /// The number of tasks waiting for a live worker.
    pub(crate) num_pending_tasks: Counter,
    /// The number of assignment nodes created by this process.
    pub(crate) num_assignments_created: Counter,
    /// The number of tasks reclaimed from departed workers.
    pub(crate) num_tasks_reassigned: Counter,
    /// The number of tasks reclaimed from departed workers and re-queued while bootstrapping.
    pub(crate) num_orphans_recovered: Counter,
    /// The number of events discarded because they belonged to a previous term.
    pub(crate) num_stale_events_dropped: Counter,
}

impl MasterStatisticsInner {
    /// The number of terms this process has started as master.
    pub fn num_terms(&self) -> u64 {
        self.num_terms.load(Ordering::Relaxed)
    }

    /// The number of live workers known to the current term.
    pub fn num_live_workers(&self) -> u64 {
        self.num_live_workers.load(Ordering::Relaxed)
    }

    /// The number of tasks waiting for a live worker.
    pub fn num_pending_tasks(&self) -> u64 {
        self.num_pending_tasks.load(Ordering::Relaxed)
    }

    /// The number of assignment nodes created by this process.
    pub fn num_assignments_created(&self) -> u64 {
        self.num_assignments_created.load(Ordering::Relaxed)
    }

    /// The number of tasks reclaimed from departed workers.
    pub fn num_tasks_reassigned(&self) -> u64 {
        self.num_tasks_reassigned.load(Ordering::Relaxed)
    }

    /// The number of tasks reclaimed from departed workers and re-queued while bootstrapping.
    pub fn num_orphans_recovered(&self) -> u64 {
        self.num_orphans_recovered.load(Ordering::Relaxed)
    }

    /// The number of events discarded because they belonged to a previous term.
    pub fn num_stale_events_dropped(&self) -> u64 {
        self.num_stale_events_dropped.load(Ordering::Relaxed)
    }
}
