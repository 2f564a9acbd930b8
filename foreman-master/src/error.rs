use foreman_coordination::CoordinationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("{0}")]
    /// An error returned by the coordination service.
    Coordination(#[from] CoordinationError),

    #[error("The leader election has stopped because the coordination session expired.")]
    /// The session backing the election is gone, a new session is required
    /// to run for master again.
    SessionExpired,

    #[error("The master service stopped unexpectedly: {0}")]
    Service(anyhow::Error),
}

impl MasterError {
    /// Returns true if the master can recover from the error by stepping
    /// down and waiting to be re-elected.
    ///
    /// Any other error is a logic error and must cause the master to
    /// relinquish its mastership.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Coordination(e) => e.is_transient(),
            Self::SessionExpired => true,
            Self::Service(_) => false,
        }
    }
}
