use thiserror::Error;

use crate::Epoch;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("No node exists at path {0:?}.")]
    /// The target node does not exist.
    NoNode(String),

    #[error("A node already exists at path {0:?}.")]
    /// The node being created already exists.
    NodeExists(String),

    #[error("The parent of path {0:?} does not exist.")]
    /// The node being created has no parent node.
    NoParent(String),

    #[error("The node at path {0:?} still has children.")]
    /// A node with children cannot be deleted.
    NotEmpty(String),

    #[error("Invalid node path {path:?}: {reason}")]
    /// The path or path segment is malformed.
    InvalidPath { path: String, reason: &'static str },

    #[error("The connection to the coordination service has been lost.")]
    /// The session is temporarily disconnected, the operation may or may not
    /// have been applied.
    ConnectionLoss,

    #[error("The coordination session has expired.")]
    /// The session has ended, all ephemeral nodes and watches owned by it
    /// are gone.
    SessionExpired,

    #[error("Operation timed out after {0:?}.")]
    Timeout(std::time::Duration),

    #[error(
        "Mutation rejected for election {election:?}: fenced at epoch {presented}, current epoch is {current:?}."
    )]
    /// The mutation carried a fence that no longer matches the election holder.
    Fenced {
        election: String,
        presented: Epoch,
        current: Option<Epoch>,
    },
}

impl CoordinationError {
    /// Returns true if the error is caused by connectivity or authority and
    /// can be recovered from by stepping down and retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLoss
                | Self::SessionExpired
                | Self::Timeout(_)
                | Self::Fenced { .. }
        )
    }

    /// Returns true if the error is the expected outcome of a concurrent
    /// mutation of the same node.
    pub fn is_race(&self) -> bool {
        matches!(
            self,
            Self::NoNode(_) | Self::NodeExists(_) | Self::NotEmpty(_)
        )
    }
}
