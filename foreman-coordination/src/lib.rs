//! # Foreman Coordination
//! The capability interface foreman consumes from a hierarchical coordination service.
//!
//! The coordination service itself (consensus, replication, session management and
//! watch delivery) is an external collaborator. This crate only describes what the
//! master needs from it: atomic create/delete of nodes, ephemeral nodes tied to the
//! client session, child listings with change subscriptions and an exclusive
//! election primitive whose holder changes are numbered by a monotonically
//! increasing [Epoch].
//!
//! Enabling the `test-utils` feature exposes [test_utils::MemoryCoordinator], an
//! in-memory coordination service implementing [CoordinationClient] with the same
//! session, ephemeral node and fencing semantics.

#[macro_use]
extern crate tracing;

mod error;
mod namespace;
mod path;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::fmt::{self, Display};

use async_trait::async_trait;
use tokio::sync::watch;

pub use self::error::CoordinationError;
pub use self::namespace::Namespace;
pub use self::path::{validate_segment, NodePath};

/// The raw bytes stored on a node.
pub type Payload = Vec<u8>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
/// A term number of an election.
///
/// Every change of holder of an election produces a strictly larger epoch.
pub struct Epoch(pub u64);

impl Epoch {
    #[inline]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A guard attached to a mutation.
///
/// The coordination service only applies a fenced mutation if the calling
/// session currently holds `election` at exactly `epoch`, otherwise the
/// mutation is rejected with [CoordinationError::Fenced].
pub struct Fence {
    pub election: NodePath,
    pub epoch: Epoch,
}

impl Fence {
    pub fn new(election: NodePath, epoch: Epoch) -> Self {
        Self { election, epoch }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CreateMode {
    /// The node lives until it is explicitly deleted.
    Persistent,
    /// The node is removed automatically when the creating session ends.
    Ephemeral,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// The connectivity of a client session.
pub enum SessionState {
    Connected,
    /// Temporarily unable to reach the service. Ephemeral nodes and election
    /// candidacies are retained until the session expires.
    Disconnected,
    /// Terminal, the session will never reconnect.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A change notification for a watched parent node.
///
/// Delivery is at-least-once per subscription but a subscription can be
/// closed at any time, after which the subscriber must re-list to catch up.
pub enum WatchEvent {
    ChildCreated(String),
    ChildDeleted(String),
    DataChanged(String),
}

/// The result of an atomic list-and-subscribe on a parent node.
pub struct ChildrenWatch {
    /// The children of the node at the time the subscription was registered.
    pub children: Vec<String>,
    /// Changes observed after `children` was taken.
    pub events: flume::Receiver<WatchEvent>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CandidacyId(pub u64);

/// A registered candidacy in an election.
pub struct Candidacy {
    pub id: CandidacyId,
    /// `Some(epoch)` while this candidacy holds the election.
    ///
    /// The sender is dropped once the candidacy is withdrawn or its session
    /// expires.
    pub holder: watch::Receiver<Option<Epoch>>,
}

#[async_trait]
/// The operations foreman requires from a coordination service session.
///
/// Implementations represent a single client session, ephemeral nodes and
/// election candidacies are owned by it.
pub trait CoordinationClient: Send + Sync + 'static {
    /// Watches the connectivity of the session.
    fn session_state(&self) -> watch::Receiver<SessionState>;

    /// Creates a node at `path` with the given payload.
    ///
    /// Returns [CoordinationError::NodeExists] if the node already exists and
    /// [CoordinationError::NoParent] if its parent does not.
    async fn create(
        &self,
        path: &NodePath,
        payload: Payload,
        mode: CreateMode,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError>;

    /// Deletes the node at `path`.
    ///
    /// Returns [CoordinationError::NoNode] if the node does not exist and
    /// [CoordinationError::NotEmpty] if it still has children.
    async fn delete(
        &self,
        path: &NodePath,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError>;

    /// Replaces the payload of an existing node.
    async fn set_data(
        &self,
        path: &NodePath,
        payload: Payload,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError>;

    /// Reads the payload of the node at `path`.
    async fn get_data(&self, path: &NodePath) -> Result<Payload, CoordinationError>;

    /// Lists the names of the children of `path`.
    async fn get_children(
        &self,
        path: &NodePath,
    ) -> Result<Vec<String>, CoordinationError>;

    /// Lists the children of `path` and subscribes to future creations,
    /// deletions and payload changes of them.
    async fn watch_children(
        &self,
        path: &NodePath,
    ) -> Result<ChildrenWatch, CoordinationError>;

    /// Enters the session into the election at `election`.
    ///
    /// At most one candidacy per election holds it at a time, candidacies
    /// acquire the election in the order they were registered.
    async fn run_for_election(
        &self,
        election: &NodePath,
        candidate_id: &str,
    ) -> Result<Candidacy, CoordinationError>;

    /// Withdraws a candidacy, releasing the election if it is the holder.
    async fn withdraw(
        &self,
        election: &NodePath,
        candidacy: CandidacyId,
    ) -> Result<(), CoordinationError>;
}
