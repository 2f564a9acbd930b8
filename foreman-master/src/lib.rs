//! # Foreman Master
//! Master election and fault-tolerant task assignment for a cluster of workers
//! coordinated through a hierarchical coordination service.
//!
//! Every process wanting to act as master starts a [Master]. At most one of them
//! holds the election at a time, the holder reconciles the persisted assignments
//! with the live workers and then keeps assigning new tasks and moving the tasks
//! of departed workers until it loses the election.
//!
//! ```text
//! /master                      election
//! /workers/{workerId}          ephemeral liveness markers
//! /tasks/{taskId}              task payloads
//! /assign/{workerId}/{taskId}  assignments
//! ```
//!
//! Mutations made by a master are fenced with the epoch of its term, a master
//! which was deposed without noticing cannot change the namespace.

#[macro_use]
extern crate tracing;

mod election;
mod engine;
mod error;
mod statistics;
mod tracker;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use foreman_coordination::{CoordinationClient, CoordinationError, Namespace, NodePath};
use futures::StreamExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

pub use self::election::{ElectionHandle, LeaderElection, LeadershipState};
pub use self::engine::{AssignmentEngine, EngineEvent, EngineEventKind, EngineState};
pub use self::error::MasterError;
pub use self::statistics::{MasterStatistics, MasterStatisticsInner};
pub use self::tracker::{MembershipTracker, TrackerEvent};

const RETRY_BACKOFF: Duration = if cfg!(test) {
    Duration::from_millis(50)
} else {
    Duration::from_secs(2)
};

#[derive(Debug, Clone)]
/// Configuration of a master process.
pub struct MasterConfig {
    my_id: String,
    namespace: Namespace,
    election_path: Option<NodePath>,
    rng_seed: Option<u64>,
    retry_backoff: Duration,
}

impl MasterConfig {
    /// Creates a new config for the master candidate `my_id`.
    ///
    /// The id is used as the election candidate id and must be unique
    /// across the processes competing for mastership.
    pub fn new(my_id: impl Into<String>) -> Self {
        Self {
            my_id: my_id.into(),
            namespace: Namespace::default(),
            election_path: None,
            rng_seed: None,
            retry_backoff: RETRY_BACKOFF,
        }
    }

    /// Set the namespace the cluster lives in.
    pub fn with_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    /// Set the election node, defaults to the `master` node of the namespace.
    pub fn with_election_path(mut self, path: NodePath) -> Self {
        self.election_path = Some(path);
        self
    }

    /// Seed the worker selection, making the picks reproducible.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Set how long to wait before retrying after a transient failure.
    pub fn with_retry_backoff(mut self, dur: Duration) -> Self {
        self.retry_backoff = dur;
        self
    }

    #[inline]
    pub fn my_id(&self) -> &str {
        &self.my_id
    }

    #[inline]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    #[inline]
    pub fn election_path(&self) -> &NodePath {
        self.election_path
            .as_ref()
            .unwrap_or_else(|| self.namespace.election())
    }

    #[inline]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }

    #[inline]
    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }
}

/// A process competing to become the cluster master.
pub struct Master<C: CoordinationClient> {
    client: Arc<C>,
    config: MasterConfig,
}

impl<C: CoordinationClient> Master<C> {
    pub fn new(client: Arc<C>, config: MasterConfig) -> Self {
        Self { client, config }
    }

    /// Enters the election and runs the assignment engine whenever this
    /// process holds it.
    ///
    /// The service keeps running across lost and regained mastership. It
    /// only stops on [MasterHandle::shutdown], when the session of the
    /// client expires or on a non-recoverable error.
    pub fn start(self) -> MasterHandle {
        let statistics = MasterStatistics::default();
        let (events_tx, events_rx) = flume::unbounded();

        let engine = AssignmentEngine::new(
            self.client.clone(),
            &self.config,
            events_tx,
            statistics.clone(),
        );
        let state = engine.subscribe();

        let election = LeaderElection::new(
            self.client.clone(),
            self.config.election_path().clone(),
            self.config.my_id(),
        )
        .with_retry_backoff(self.config.retry_backoff())
        .start();
        let leadership = election.subscribe();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let ctx = MasterContext {
            my_id: self.config.my_id().to_string(),
            retry_backoff: self.config.retry_backoff(),
            statistics: statistics.clone(),
            engine,
            election,
            events: events_rx,
        };
        let task = tokio::spawn(run_master(ctx, shutdown_rx));

        info!(
            my_id = %self.config.my_id(),
            election = %self.config.election_path(),
            namespace = %self.config.namespace().root(),
            "Master service started."
        );

        MasterHandle {
            my_id: self.config.my_id,
            state,
            leadership,
            statistics,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// A handle to a running [Master].
///
/// Dropping the handle shuts the master down in the background.
pub struct MasterHandle {
    my_id: String,
    state: watch::Receiver<EngineState>,
    leadership: watch::Receiver<LeadershipState>,
    statistics: MasterStatistics,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), MasterError>>,
}

impl MasterHandle {
    #[inline]
    pub fn my_id(&self) -> &str {
        &self.my_id
    }

    #[inline]
    /// The current state of the assignment engine.
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    #[inline]
    /// The local view of the election.
    pub fn leadership(&self) -> LeadershipState {
        *self.leadership.borrow()
    }

    #[inline]
    pub fn is_leader(&self) -> bool {
        self.leadership().is_leader()
    }

    /// A stream of engine states, starting with the current one.
    pub fn state_changes(&self) -> WatchStream<EngineState> {
        WatchStream::new(self.state.clone())
    }

    /// A stream of leadership states, starting with the current one.
    pub fn leadership_changes(&self) -> WatchStream<LeadershipState> {
        WatchStream::new(self.leadership.clone())
    }

    #[inline]
    /// Get a handle to the live statistics.
    pub fn statistics(&self) -> MasterStatistics {
        self.statistics.clone()
    }

    /// Returns true once the service has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the engine to reach a state matching the predicate.
    pub async fn wait_for_state<F>(
        &self,
        mut predicate: F,
        timeout_after: Duration,
    ) -> Result<(), anyhow::Error>
    where
        F: FnMut(&EngineState) -> bool,
    {
        tokio::time::timeout(
            timeout_after,
            self.state_changes()
                .skip_while(|state| futures::future::ready(!predicate(state)))
                .next(),
        )
        .await?
        .ok_or_else(|| anyhow::anyhow!("The master service stopped."))?;
        Ok(())
    }

    /// Waits for the leadership to reach a state matching the predicate.
    pub async fn wait_for_leadership<F>(
        &self,
        mut predicate: F,
        timeout_after: Duration,
    ) -> Result<LeadershipState, anyhow::Error>
    where
        F: FnMut(&LeadershipState) -> bool,
    {
        tokio::time::timeout(
            timeout_after,
            self.leadership_changes()
                .skip_while(|state| futures::future::ready(!predicate(state)))
                .next(),
        )
        .await?
        .ok_or_else(|| anyhow::anyhow!("The election has stopped."))
    }

    /// Stops the master.
    ///
    /// The trackers are stopped, queued events are discarded and the
    /// candidacy is withdrawn before this returns.
    pub async fn shutdown(mut self) -> Result<(), MasterError> {
        info!(my_id = %self.my_id, "Shutting down master.");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.join().await
    }

    /// Waits for the service to stop on its own.
    pub async fn join(self) -> Result<(), MasterError> {
        let Self {
            task, shutdown_tx, ..
        } = self;

        let res = match task.await {
            Ok(res) => res,
            Err(e) => Err(MasterError::Service(e.into())),
        };
        drop(shutdown_tx);

        res
    }
}

struct MasterContext<C: CoordinationClient> {
    my_id: String,
    retry_backoff: Duration,
    statistics: MasterStatistics,
    engine: AssignmentEngine<C>,
    election: ElectionHandle,
    events: flume::Receiver<EngineEvent>,
}

impl<C: CoordinationClient> MasterContext<C> {
    fn drain(&mut self) {
        self.engine.drain();

        let discarded = self.events.drain().count() as u64;
        if discarded > 0 {
            self.statistics
                .num_stale_events_dropped
                .fetch_add(discarded, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

enum Step {
    Done(Result<(), MasterError>),
    LeadershipChanged,
    ElectionClosed,
    Shutdown,
}

/// Runs `fut` until it completes, the leadership changes or a shutdown is
/// requested, whichever happens first.
async fn until_interrupted(
    leadership: &mut watch::Receiver<LeadershipState>,
    shutdown: &mut oneshot::Receiver<()>,
    fut: impl Future<Output = Result<(), MasterError>>,
) -> Step {
    tokio::select! {
        res = fut => Step::Done(res),
        res = leadership.changed() => match res {
            Ok(()) => Step::LeadershipChanged,
            Err(_) => Step::ElectionClosed,
        },
        _ = shutdown => Step::Shutdown,
    }
}

async fn run_master<C: CoordinationClient>(
    mut ctx: MasterContext<C>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), MasterError> {
    let mut leadership = ctx.election.subscribe();
    let mut election_closed = false;

    let res = loop {
        let leader_epoch = leadership.borrow_and_update().epoch();

        if ctx.engine.is_active() && ctx.engine.epoch() != leader_epoch {
            ctx.drain();
        }

        let step = match leader_epoch {
            Some(epoch) if !ctx.engine.is_active() => {
                until_interrupted(&mut leadership, &mut shutdown, ctx.engine.bootstrap(epoch))
                    .await
            },
            _ => tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                res = leadership.changed() => match res {
                    Ok(()) => continue,
                    Err(_) => Step::ElectionClosed,
                },
                event = ctx.events.recv_async(), if ctx.engine.is_active() => match event {
                    Ok(event) => {
                        until_interrupted(&mut leadership, &mut shutdown, ctx.engine.handle(event))
                            .await
                    },
                    Err(_) => continue,
                },
            },
        };

        match step {
            Step::Done(Ok(())) => {},
            Step::Done(Err(e)) if e.is_transient() => {
                warn!(
                    my_id = %ctx.my_id,
                    error = ?e,
                    backoff = ?ctx.retry_backoff,
                    "Transient failure while acting as master, stepping down."
                );
                ctx.drain();

                tokio::select! {
                    _ = tokio::time::sleep(ctx.retry_backoff) => {},
                    _ = &mut shutdown => break Ok(()),
                }
            },
            Step::Done(Err(e)) => {
                error!(my_id = %ctx.my_id, error = ?e, "Master failed, relinquishing mastership.");
                break Err(e);
            },
            Step::LeadershipChanged => {
                // An interrupted handler may have left the term half updated.
                ctx.drain();
            },
            Step::ElectionClosed => {
                warn!(my_id = %ctx.my_id, "Election ended.");
                election_closed = true;
                break Ok(());
            },
            Step::Shutdown => break Ok(()),
        }
    };

    ctx.drain();
    let MasterContext { election, my_id, .. } = ctx;
    let ended = election.resign().await;
    info!(my_id = %my_id, "Master service stopped.");

    // The error that ended the election takes over if it ended the loop.
    match ended {
        Ok(()) if election_closed => Err(MasterError::Service(anyhow::anyhow!(
            "The election task stopped unexpectedly."
        ))),
        Err(CoordinationError::SessionExpired) if election_closed => {
            Err(MasterError::SessionExpired)
        },
        Err(e) if election_closed => {
            error!(my_id = %my_id, error = ?e, "Election failed, master stopped.");
            Err(MasterError::Coordination(e))
        },
        Err(e) => {
            debug!(my_id = %my_id, error = ?e, "Election had already ended.");
            res
        },
        Ok(()) => res,
    }
}
