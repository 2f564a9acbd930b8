use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use foreman_coordination::{
    CoordinationClient,
    CoordinationError,
    CreateMode,
    Epoch,
    Fence,
    Namespace,
    NodePath,
    Payload,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;

use crate::error::MasterError;
use crate::statistics::MasterStatistics;
use crate::tracker::{MembershipTracker, TrackerEvent};
use crate::MasterConfig;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// The lifecycle of the assignment engine within a term.
pub enum EngineState {
    /// No authority, events are ignored.
    Idle,
    /// Reconciling the persisted assignments with the live workers.
    Bootstrapping,
    /// Reacting to worker and task changes.
    SteadyState,
    /// Tearing down the trackers after mastership was lost.
    Draining,
}

impl EngineState {
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Bootstrapping | Self::SteadyState)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A tracker event tagged with the term that produced it.
///
/// A master can start several terms within the same election epoch, for
/// example after recovering from a transient failure, so terms are told
/// apart by `term_id` which is unique per engine.
pub struct EngineEvent {
    pub term_id: u64,
    pub epoch: Epoch,
    pub kind: EngineEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEventKind {
    Worker(TrackerEvent),
    Task(TrackerEvent),
}

/// Assigns tasks to live workers and moves the tasks of departed workers.
///
/// The engine is the only component mutating the `assign` subtree. It only
/// has authority while a term is active, every mutation it issues carries
/// the term's epoch as a fence.
pub struct AssignmentEngine<C: CoordinationClient> {
    client: Arc<C>,
    namespace: Namespace,
    election: NodePath,
    my_id: String,
    rng_seed: Option<u64>,
    events: flume::Sender<EngineEvent>,
    state_tx: watch::Sender<EngineState>,
    statistics: MasterStatistics,
    last_term_id: u64,
    term: Option<Term<C>>,
}

impl<C: CoordinationClient> AssignmentEngine<C> {
    pub fn new(
        client: Arc<C>,
        config: &MasterConfig,
        events: flume::Sender<EngineEvent>,
        statistics: MasterStatistics,
    ) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Idle);

        Self {
            client,
            namespace: config.namespace().clone(),
            election: config.election_path().clone(),
            my_id: config.my_id().to_string(),
            rng_seed: config.rng_seed(),
            events,
            state_tx,
            statistics,
            last_term_id: 0,
            term: None,
        }
    }

    /// Watch the state of the engine.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    #[inline]
    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// The epoch of the active term, if any.
    #[inline]
    pub fn epoch(&self) -> Option<Epoch> {
        self.term.as_ref().map(|term| term.epoch)
    }

    /// The id of the active term, if any.
    #[inline]
    pub fn term_id(&self) -> Option<u64> {
        self.term.as_ref().map(|term| term.id)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.term.is_some()
    }

    /// Starts a new term at `epoch`.
    ///
    /// Any previous term is drained first. On error the term is left
    /// partially set up and must be drained by the caller.
    pub async fn bootstrap(&mut self, epoch: Epoch) -> Result<(), MasterError> {
        if self.term.is_some() {
            self.drain();
        }

        self.set_state(EngineState::Bootstrapping);
        self.statistics.num_terms.fetch_add(1, Ordering::Relaxed);
        self.last_term_id += 1;
        let term_id = self.last_term_id;
        info!(
            my_id = %self.my_id,
            epoch = %epoch,
            term_id = term_id,
            "Bootstrapping assignment engine."
        );

        let seed = derive_seed(self.rng_seed, &self.my_id, epoch);
        let term = self.term.insert(Term {
            id: term_id,
            epoch,
            fence: Fence::new(self.election.clone(), epoch),
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            statistics: self.statistics.clone(),
            rng: StdRng::seed_from_u64(seed),
            workers: BTreeSet::new(),
            pending: BTreeMap::new(),
            assignments: BTreeMap::new(),
            worker_tracker: None,
            task_tracker: None,
        });

        let worker_tracker = MembershipTracker::start(
            self.client.clone(),
            self.namespace.workers().clone(),
            self.events.clone(),
            move |event| EngineEvent {
                term_id,
                epoch,
                kind: EngineEventKind::Worker(event),
            },
        )
        .await?;
        term.workers.extend(worker_tracker.ids());
        term.worker_tracker = Some(worker_tracker);

        let orphaned = term.reconcile_assignments().await?;

        let task_tracker = MembershipTracker::start(
            self.client.clone(),
            self.namespace.tasks().clone(),
            self.events.clone(),
            move |event| EngineEvent {
                term_id,
                epoch,
                kind: EngineEventKind::Task(event),
            },
        )
        .await?;
        let mut num_recovered = 0;
        for (task_id, payload) in task_tracker.snapshot() {
            if term.assignments.contains_key(&task_id) {
                continue;
            }
            if orphaned.contains(&task_id) {
                num_recovered += 1;
            }
            term.pending.insert(task_id, payload);
        }
        self.statistics
            .num_orphans_recovered
            .fetch_add(num_recovered, Ordering::Relaxed);
        term.task_tracker = Some(task_tracker);

        term.assign_pending().await?;
        term.sync_gauges();

        info!(
            my_id = %self.my_id,
            epoch = %epoch,
            num_workers = term.workers.len(),
            num_assigned = term.assignments.len(),
            num_pending = term.pending.len(),
            "Assignment engine ready."
        );
        self.set_state(EngineState::SteadyState);

        Ok(())
    }

    /// Applies a single tracker event to the active term.
    ///
    /// Events from any other term are dropped.
    pub async fn handle(&mut self, event: EngineEvent) -> Result<(), MasterError> {
        if self.term_id() != Some(event.term_id) {
            self.statistics
                .num_stale_events_dropped
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                event_term_id = event.term_id,
                event_epoch = %event.epoch,
                term_id = ?self.term_id(),
                "Dropping event from another term."
            );
            return Ok(());
        }

        let term = match self.term.as_mut() {
            Some(term) => term,
            None => return Ok(()),
        };

        match event.kind {
            EngineEventKind::Worker(event) => term.on_worker_event(event).await?,
            EngineEventKind::Task(event) => term.on_task_event(event).await?,
        }
        term.sync_gauges();

        Ok(())
    }

    /// Stops the trackers and discards everything held by the active term.
    pub fn drain(&mut self) {
        let term = match self.term.take() {
            Some(term) => term,
            None => return,
        };

        self.set_state(EngineState::Draining);
        info!(my_id = %self.my_id, epoch = %term.epoch, "Draining assignment engine.");
        drop(term);

        self.statistics.num_live_workers.store(0, Ordering::Relaxed);
        self.statistics.num_pending_tasks.store(0, Ordering::Relaxed);
        self.set_state(EngineState::Idle);
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
    }
}

/// The working set of a single term.
///
/// Dropping it stops both trackers.
struct Term<C: CoordinationClient> {
    id: u64,
    epoch: Epoch,
    fence: Fence,
    client: Arc<C>,
    namespace: Namespace,
    statistics: MasterStatistics,
    rng: StdRng,
    /// The live workers, ordered so that seeded picks are reproducible.
    workers: BTreeSet<String>,
    /// Tasks waiting for a live worker.
    pending: BTreeMap<String, Payload>,
    /// Task id to the worker it is assigned to.
    assignments: BTreeMap<String, String>,
    worker_tracker: Option<MembershipTracker>,
    task_tracker: Option<MembershipTracker>,
}

impl<C: CoordinationClient> Term<C> {
    /// Records the assignments held by live workers and drains the segments
    /// of workers which are gone.
    ///
    /// Returns the ids of the tasks removed from departed workers.
    async fn reconcile_assignments(&mut self) -> Result<BTreeSet<String>, MasterError> {
        let segments = list_or_empty(self.client.as_ref(), self.namespace.assign()).await?;
        let mut orphaned = BTreeSet::new();

        for worker_id in segments {
            let segment = self.namespace.assignments_of(&worker_id)?;

            if !self.workers.contains(&worker_id) {
                let reclaimed = self.drain_segment(&worker_id).await?;
                if !reclaimed.is_empty() {
                    warn!(
                        worker_id = %worker_id,
                        num_tasks = reclaimed.len(),
                        "Removed orphaned assignments of a departed worker."
                    );
                }
                orphaned.extend(reclaimed);
                continue;
            }

            for task_id in list_or_empty(self.client.as_ref(), &segment).await? {
                match self.assignments.get(&task_id) {
                    Some(other) => {
                        warn!(
                            task_id = %task_id,
                            worker_id = %worker_id,
                            other_worker_id = %other,
                            "Task is assigned to more than one worker."
                        );
                    },
                    None => {
                        self.assignments.insert(task_id, worker_id.clone());
                    },
                }
            }
        }

        Ok(orphaned)
    }

    async fn on_worker_event(&mut self, event: TrackerEvent) -> Result<(), MasterError> {
        match event {
            TrackerEvent::Added { id, .. } => {
                info!(worker_id = %id, epoch = %self.epoch, "Worker joined.");
                self.workers.insert(id);
                self.assign_pending().await
            },
            TrackerEvent::Removed { id } => {
                info!(worker_id = %id, epoch = %self.epoch, "Worker left.");
                self.workers.remove(&id);
                self.reassign_tasks_of(&id).await
            },
            TrackerEvent::Updated { .. } => Ok(()),
        }
    }

    async fn on_task_event(&mut self, event: TrackerEvent) -> Result<(), MasterError> {
        match event {
            TrackerEvent::Added { id, payload } => {
                if let Some(worker_id) = self.assignments.get(&id) {
                    debug!(task_id = %id, worker_id = %worker_id, "Task is already assigned.");
                    return Ok(());
                }

                self.pending.insert(id.clone(), payload);
                self.try_assign(&id).await?;
                Ok(())
            },
            TrackerEvent::Updated { id, payload } => {
                if let Some(pending) = self.pending.get_mut(&id) {
                    *pending = payload;
                }
                Ok(())
            },
            TrackerEvent::Removed { id } => {
                self.pending.remove(&id);
                if let Some(worker_id) = self.assignments.remove(&id) {
                    debug!(task_id = %id, worker_id = %worker_id, "Task finished.");
                }
                Ok(())
            },
        }
    }

    /// Moves every task assigned to a departed worker onto live workers.
    async fn reassign_tasks_of(&mut self, worker_id: &str) -> Result<(), MasterError> {
        let reclaimed = self.drain_segment(worker_id).await?;

        for task_id in reclaimed {
            let payload = match self
                .client
                .get_data(&self.namespace.task(&task_id)?)
                .await
            {
                Ok(payload) => payload,
                Err(CoordinationError::NoNode(_)) => {
                    debug!(task_id = %task_id, "Reclaimed task no longer exists.");
                    continue;
                },
                Err(e) => return Err(e.into()),
            };

            self.statistics
                .num_tasks_reassigned
                .fetch_add(1, Ordering::Relaxed);
            self.pending.insert(task_id.clone(), payload);
            if let Some(new_worker) = self.try_assign(&task_id).await? {
                info!(
                    task_id = %task_id,
                    from_worker_id = %worker_id,
                    to_worker_id = %new_worker,
                    "Task reassigned."
                );
            }
        }

        Ok(())
    }

    /// Deletes every assignment of a worker and then the worker's segment.
    ///
    /// Returns the ids of the tasks that were assigned to it.
    async fn drain_segment(&mut self, worker_id: &str) -> Result<Vec<String>, MasterError> {
        let segment = self.namespace.assignments_of(worker_id)?;
        let tasks = list_or_empty(self.client.as_ref(), &segment).await?;

        for task_id in tasks.iter() {
            let assignment = segment.join(task_id)?;
            match self.client.delete(&assignment, Some(&self.fence)).await {
                Ok(()) => {},
                Err(CoordinationError::NoNode(_)) => {},
                Err(e) => return Err(e.into()),
            }
            debug!(worker_id = %worker_id, task_id = %task_id, "Removed stale assignment.");
        }
        self.assignments.retain(|_, w| w != worker_id);

        match self.client.delete(&segment, Some(&self.fence)).await {
            Ok(()) => {},
            // Already removed.
            Err(e) if e.is_race() => {},
            Err(e) => return Err(e.into()),
        }

        Ok(tasks)
    }

    async fn assign_pending(&mut self) -> Result<(), MasterError> {
        let task_ids = self.pending.keys().cloned().collect::<Vec<_>>();
        for task_id in task_ids {
            if self.workers.is_empty() {
                break;
            }
            self.try_assign(&task_id).await?;
        }
        Ok(())
    }

    /// Assigns a pending task to a randomly picked live worker.
    ///
    /// Returns the chosen worker, or `None` if no worker is live and the
    /// task stays pending.
    async fn try_assign(&mut self, task_id: &str) -> Result<Option<String>, MasterError> {
        let payload = match self.pending.get(task_id) {
            Some(payload) => payload.clone(),
            None => return Ok(None),
        };

        let worker_id = match self.pick_worker() {
            Some(worker_id) => worker_id,
            None => {
                debug!(task_id = %task_id, "No live workers, task remains pending.");
                return Ok(None);
            },
        };

        self.create_assignment(&worker_id, task_id, payload).await?;

        self.pending.remove(task_id);
        self.assignments
            .insert(task_id.to_string(), worker_id.clone());

        Ok(Some(worker_id))
    }

    fn pick_worker(&mut self) -> Option<String> {
        if self.workers.is_empty() {
            return None;
        }

        let idx = self.rng.gen_range(0..self.workers.len());
        self.workers.iter().nth(idx).cloned()
    }

    async fn create_assignment(
        &self,
        worker_id: &str,
        task_id: &str,
        payload: Payload,
    ) -> Result<(), MasterError> {
        let segment = self.namespace.assignments_of(worker_id)?;
        let assignment = segment.join(task_id)?;

        let mut attempts_left = 2;
        loop {
            attempts_left -= 1;
            self.ensure_segment(&segment).await?;

            let res = self
                .client
                .create(
                    &assignment,
                    payload.clone(),
                    CreateMode::Persistent,
                    Some(&self.fence),
                )
                .await;

            match res {
                Ok(()) => {
                    self.statistics
                        .num_assignments_created
                        .fetch_add(1, Ordering::Relaxed);
                    info!(
                        task_id = %task_id,
                        worker_id = %worker_id,
                        epoch = %self.epoch,
                        "Task assigned."
                    );
                    return Ok(());
                },
                Err(CoordinationError::NodeExists(_)) => {
                    debug!(task_id = %task_id, worker_id = %worker_id, "Assignment already exists.");
                    return Ok(());
                },
                Err(CoordinationError::NoParent(_)) if attempts_left > 0 => {
                    debug!(worker_id = %worker_id, "Assignment segment vanished, retrying.");
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn ensure_segment(&self, segment: &NodePath) -> Result<(), MasterError> {
        match self
            .client
            .create(segment, Vec::new(), CreateMode::Persistent, Some(&self.fence))
            .await
        {
            Ok(()) | Err(CoordinationError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn sync_gauges(&self) {
        self.statistics
            .num_live_workers
            .store(self.workers.len() as u64, Ordering::Relaxed);
        self.statistics
            .num_pending_tasks
            .store(self.pending.len() as u64, Ordering::Relaxed);
    }
}

impl<C: CoordinationClient> Drop for Term<C> {
    fn drop(&mut self) {
        if let Some(tracker) = self.worker_tracker.take() {
            tracker.stop();
        }
        if let Some(tracker) = self.task_tracker.take() {
            tracker.stop();
        }
    }
}

async fn list_or_empty<C: CoordinationClient + ?Sized>(
    client: &C,
    path: &NodePath,
) -> Result<Vec<String>, CoordinationError> {
    match client.get_children(path).await {
        Ok(children) => Ok(children),
        Err(CoordinationError::NoNode(_)) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn derive_seed(configured: Option<u64>, my_id: &str, epoch: Epoch) -> u64 {
    if let Some(seed) = configured {
        return seed;
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let id_hash = crc32fast::hash(my_id.as_bytes()) as u64;

    (id_hash << 32) ^ epoch.0.rotate_left(17) ^ nanos
}
