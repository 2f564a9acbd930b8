use std::sync::Arc;
use std::time::Duration;

use foreman_coordination::{
    Candidacy,
    CandidacyId,
    CoordinationClient,
    CoordinationError,
    Epoch,
    NodePath,
    SessionState,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

const ELECTION_RETRY_BACKOFF: Duration = if cfg!(test) {
    Duration::from_millis(50)
} else {
    Duration::from_secs(1)
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// The local view of the election.
///
/// `Leader` means "probably leader": the notification can lag behind the
/// coordination service, which is why every mutation made under it carries
/// the epoch as a fence.
pub enum LeadershipState {
    Follower,
    Leader { epoch: Epoch },
}

impl LeadershipState {
    #[inline]
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader { .. })
    }

    #[inline]
    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            Self::Leader { epoch } => Some(*epoch),
            Self::Follower => None,
        }
    }
}

/// Runs a process for master on an exclusive election node.
pub struct LeaderElection<C: CoordinationClient> {
    client: Arc<C>,
    election: NodePath,
    candidate_id: String,
    retry_backoff: Duration,
}

impl<C: CoordinationClient> LeaderElection<C> {
    pub fn new(
        client: Arc<C>,
        election: NodePath,
        candidate_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            election,
            candidate_id: candidate_id.into(),
            retry_backoff: ELECTION_RETRY_BACKOFF,
        }
    }

    /// Set how long to wait before retrying a failed attempt to enter the election.
    pub fn with_retry_backoff(mut self, dur: Duration) -> Self {
        self.retry_backoff = dur;
        self
    }

    /// Starts participating in the election.
    ///
    /// Connection loss is treated as losing the election, once the session
    /// reconnects the old candidacy is withdrawn and a new one is registered.
    /// An expired session or a non-transient error ends the election for
    /// good and closes the state channel.
    pub fn start(self) -> ElectionHandle {
        let (state_tx, state_rx) = watch::channel(LeadershipState::Follower);
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(run_election(self, state_tx, stop_rx));

        ElectionHandle {
            state_rx,
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

/// A handle to a running election.
///
/// Dropping the handle withdraws from the election.
pub struct ElectionHandle {
    state_rx: watch::Receiver<LeadershipState>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), CoordinationError>>,
}

impl ElectionHandle {
    /// Watch the leadership state of this process.
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_rx.clone()
    }

    #[inline]
    pub fn state(&self) -> LeadershipState {
        *self.state_rx.borrow()
    }

    #[inline]
    pub fn is_leader(&self) -> bool {
        self.state().is_leader()
    }

    /// Withdraws from the election and waits for the candidacy to be released.
    ///
    /// If the election had already ended on its own, the error that ended
    /// it is returned.
    pub async fn resign(mut self) -> Result<(), CoordinationError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }

        match (&mut self.task).await {
            Ok(res) => res,
            Err(e) => {
                warn!(error = ?e, "Election task did not shut down cleanly.");
                Ok(())
            },
        }
    }
}

enum Outcome {
    Stopped,
    Disconnected,
    Expired,
    CandidacyClosed,
}

async fn run_election<C: CoordinationClient>(
    election: LeaderElection<C>,
    state_tx: watch::Sender<LeadershipState>,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<(), CoordinationError> {
    let LeaderElection {
        client,
        election,
        candidate_id,
        retry_backoff,
    } = election;

    let mut session = client.session_state();
    let mut stale_candidacy: Option<CandidacyId> = None;

    loop {
        // Wait for the session to be usable.
        loop {
            let state = *session.borrow_and_update();
            match state {
                SessionState::Connected => break,
                SessionState::Expired => {
                    info!(candidate_id = %candidate_id, "Session expired, leaving election.");
                    return Err(CoordinationError::SessionExpired);
                },
                SessionState::Disconnected => {},
            }

            tokio::select! {
                res = session.changed() => if res.is_err() {
                    return Err(CoordinationError::SessionExpired);
                },
                _ = &mut stop_rx => return Ok(()),
            }
        }

        if let Some(id) = stale_candidacy.take() {
            if let Err(e) = client.withdraw(&election, id).await {
                debug!(
                    error = ?e,
                    candidate_id = %candidate_id,
                    "Previous candidacy was already released."
                );
            }
        }

        let mut candidacy = match client.run_for_election(&election, &candidate_id).await {
            Ok(candidacy) => candidacy,
            Err(e) if e.is_transient() => {
                warn!(
                    error = ?e,
                    candidate_id = %candidate_id,
                    election = %election,
                    "Failed to enter election, retrying."
                );
                tokio::select! {
                    _ = tokio::time::sleep(retry_backoff) => {},
                    _ = &mut stop_rx => return Ok(()),
                }
                continue;
            },
            Err(e) => {
                error!(
                    error = ?e,
                    candidate_id = %candidate_id,
                    election = %election,
                    "Failed to enter election."
                );
                return Err(e);
            },
        };

        debug!(
            candidate_id = %candidate_id,
            election = %election,
            candidacy = candidacy.id.0,
            "Entered election."
        );

        let outcome =
            follow_candidacy(&mut candidacy, &mut session, &mut stop_rx, &state_tx).await;
        state_tx.send_replace(LeadershipState::Follower);

        match outcome {
            Outcome::Stopped => {
                if let Err(e) = client.withdraw(&election, candidacy.id).await {
                    warn!(error = ?e, candidate_id = %candidate_id, "Failed to withdraw candidacy.");
                }
                info!(candidate_id = %candidate_id, "Resigned from election.");
                return Ok(());
            },
            Outcome::Disconnected => {
                warn!(
                    candidate_id = %candidate_id,
                    "Lost connection to the coordination service, stepping down."
                );
                stale_candidacy = Some(candidacy.id);
            },
            Outcome::Expired => {
                info!(candidate_id = %candidate_id, "Session expired, leaving election.");
                return Err(CoordinationError::SessionExpired);
            },
            Outcome::CandidacyClosed => {
                warn!(candidate_id = %candidate_id, "Candidacy was released, re-entering election.");
            },
        }
    }
}

async fn follow_candidacy(
    candidacy: &mut Candidacy,
    session: &mut watch::Receiver<SessionState>,
    stop_rx: &mut oneshot::Receiver<()>,
    state_tx: &watch::Sender<LeadershipState>,
) -> Outcome {
    loop {
        let state = match *candidacy.holder.borrow_and_update() {
            Some(epoch) => LeadershipState::Leader { epoch },
            None => LeadershipState::Follower,
        };

        if *state_tx.borrow() != state {
            match state {
                LeadershipState::Leader { epoch } => {
                    info!(epoch = %epoch, "Acquired mastership.")
                },
                LeadershipState::Follower => info!("Mastership lost."),
            }
            state_tx.send_replace(state);
        }

        tokio::select! {
            res = candidacy.holder.changed() => if res.is_err() {
                return Outcome::CandidacyClosed;
            },
            res = session.changed() => {
                if res.is_err() {
                    return Outcome::Expired;
                }

                let state = *session.borrow_and_update();
                match state {
                    SessionState::Connected => {},
                    SessionState::Disconnected => return Outcome::Disconnected,
                    SessionState::Expired => return Outcome::Expired,
                }
            },
            _ = &mut *stop_rx => return Outcome::Stopped,
        }
    }
}
