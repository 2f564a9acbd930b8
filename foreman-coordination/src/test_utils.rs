use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    Candidacy,
    CandidacyId,
    ChildrenWatch,
    CoordinationClient,
    CoordinationError,
    CreateMode,
    Epoch,
    Fence,
    NodePath,
    Payload,
    SessionState,
    WatchEvent,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

#[derive(Clone, Default)]
/// An in-memory coordination service.
///
/// Every call to [MemoryCoordinator::connect] opens a new session. Sessions own
/// their ephemeral nodes, watches and election candidacies, which are all
/// released once the session expires. Connection loss and lost notifications
/// can be injected to exercise recovery paths.
pub struct MemoryCoordinator {
    state: Arc<Mutex<State>>,
}

impl MemoryCoordinator {
    /// Opens a new session against the service.
    pub fn connect(&self) -> MemoryClient {
        let mut lock = self.state.lock();
        lock.next_session_id += 1;
        let session_id = SessionId(lock.next_session_id);

        let (state_tx, _) = watch::channel(SessionState::Connected);
        lock.sessions.insert(session_id, state_tx);

        debug!(session_id = session_id.0, "Opened memory session.");

        MemoryClient {
            session_id,
            coordinator: self.clone(),
        }
    }

    /// Marks the session as disconnected.
    ///
    /// Operations fail with [CoordinationError::ConnectionLoss] and every
    /// watch registered by the session is closed, ephemeral nodes and
    /// candidacies are kept until the session expires.
    pub fn disconnect(&self, session_id: SessionId) {
        let mut lock = self.state.lock();
        if lock.set_session_state(session_id, SessionState::Disconnected) {
            lock.watchers.retain(|w| w.session != session_id);
        }
    }

    /// Restores a disconnected session.
    pub fn reconnect(&self, session_id: SessionId) {
        let mut lock = self.state.lock();
        if lock.session_state(session_id) == SessionState::Disconnected {
            lock.set_session_state(session_id, SessionState::Connected);
        }
    }

    /// Expires the session, removing its ephemeral nodes, watches and
    /// election candidacies.
    pub fn expire_session(&self, session_id: SessionId) {
        self.state.lock().expire(session_id);
    }

    /// Closes every registered watch without delivering pending changes.
    pub fn drop_watches(&self) {
        self.state.lock().watchers.clear();
    }

    pub fn exists(&self, path: &str) -> bool {
        NodePath::new(path)
            .map(|p| self.state.lock().nodes.contains_key(&p))
            .unwrap_or(false)
    }

    pub fn data(&self, path: &str) -> Option<Payload> {
        let path = NodePath::new(path).ok()?;
        self.state.lock().nodes.get(&path).map(|n| n.data.clone())
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        match NodePath::new(path) {
            Ok(path) => self.state.lock().children_of(&path),
            Err(_) => Vec::new(),
        }
    }

    /// The candidate currently holding the election and its epoch.
    pub fn election_holder(&self, election: &str) -> Option<(String, Epoch)> {
        let election = NodePath::new(election).ok()?;
        let lock = self.state.lock();
        let election = lock.elections.get(&election)?;
        let (_, epoch) = election.held?;
        let front = election.queue.front()?;
        Some((front.candidate_id.clone(), epoch))
    }
}

struct Node {
    data: Payload,
    owner: Option<SessionId>,
}

struct Watcher {
    parent: NodePath,
    session: SessionId,
    tx: flume::Sender<WatchEvent>,
}

struct Candidate {
    id: CandidacyId,
    session: SessionId,
    candidate_id: String,
    holder: watch::Sender<Option<Epoch>>,
}

#[derive(Default)]
struct Election {
    last_epoch: Epoch,
    held: Option<(CandidacyId, Epoch)>,
    queue: VecDeque<Candidate>,
}

impl Election {
    /// Hands the election to the front of the queue if it changed.
    fn refresh(&mut self, path: &NodePath) {
        let front = self.queue.front().map(|c| c.id);
        if front == self.held.map(|(id, _)| id) {
            return;
        }

        self.held = match self.queue.front() {
            Some(candidate) => {
                self.last_epoch = self.last_epoch.next();
                candidate.holder.send_replace(Some(self.last_epoch));
                info!(
                    election = %path,
                    candidate_id = %candidate.candidate_id,
                    epoch = %self.last_epoch,
                    "Election holder changed."
                );
                Some((candidate.id, self.last_epoch))
            },
            None => None,
        };
    }

    fn remove_where(&mut self, path: &NodePath, predicate: impl Fn(&Candidate) -> bool) {
        self.queue.retain(|candidate| {
            let keep = !predicate(candidate);
            if !keep {
                candidate.holder.send_replace(None);
            }
            keep
        });
        self.refresh(path);
    }
}

struct State {
    nodes: BTreeMap<NodePath, Node>,
    sessions: HashMap<SessionId, watch::Sender<SessionState>>,
    watchers: Vec<Watcher>,
    elections: HashMap<NodePath, Election>,
    next_session_id: u64,
    next_candidacy_id: u64,
}

impl Default for State {
    fn default() -> Self {
        let root = Node {
            data: Vec::new(),
            owner: None,
        };

        Self {
            nodes: BTreeMap::from_iter([(NodePath::root(), root)]),
            sessions: HashMap::new(),
            watchers: Vec::new(),
            elections: HashMap::new(),
            next_session_id: 0,
            next_candidacy_id: 0,
        }
    }
}

impl State {
    fn session_state(&self, session_id: SessionId) -> SessionState {
        self.sessions
            .get(&session_id)
            .map(|tx| *tx.borrow())
            .unwrap_or(SessionState::Expired)
    }

    fn set_session_state(&mut self, session_id: SessionId, state: SessionState) -> bool {
        match self.sessions.get(&session_id) {
            Some(tx) if *tx.borrow() != SessionState::Expired => {
                tx.send_replace(state);
                true
            },
            _ => false,
        }
    }

    fn check_session(&self, session_id: SessionId) -> Result<(), CoordinationError> {
        match self.session_state(session_id) {
            SessionState::Connected => Ok(()),
            SessionState::Disconnected => Err(CoordinationError::ConnectionLoss),
            SessionState::Expired => Err(CoordinationError::SessionExpired),
        }
    }

    fn check_fence(
        &self,
        session_id: SessionId,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError> {
        let fence = match fence {
            Some(fence) => fence,
            None => return Ok(()),
        };

        let election = self.elections.get(&fence.election);
        let current = election.and_then(|e| e.held.map(|(_, epoch)| epoch));
        let holder_session = election
            .and_then(|e| e.queue.front())
            .map(|candidate| candidate.session);

        if current == Some(fence.epoch) && holder_session == Some(session_id) {
            Ok(())
        } else {
            Err(CoordinationError::Fenced {
                election: fence.election.to_string(),
                presented: fence.epoch,
                current,
            })
        }
    }

    fn children_of(&self, path: &NodePath) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|p| p.parent().as_ref() == Some(path))
            .map(|p| p.name().to_string())
            .collect()
    }

    fn notify(&mut self, path: &NodePath, event: impl Fn(String) -> WatchEvent) {
        let parent = match path.parent() {
            Some(parent) => parent,
            None => return,
        };

        let event = event(path.name().to_string());
        self.watchers.retain(|watcher| {
            watcher.parent != parent || watcher.tx.send(event.clone()).is_ok()
        });
    }

    fn create(
        &mut self,
        session_id: SessionId,
        path: &NodePath,
        payload: Payload,
        mode: CreateMode,
    ) -> Result<(), CoordinationError> {
        if self.nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }

        let parent = path
            .parent()
            .ok_or_else(|| CoordinationError::NodeExists(path.to_string()))?;
        if !self.nodes.contains_key(&parent) {
            return Err(CoordinationError::NoParent(path.to_string()));
        }

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(session_id),
        };
        self.nodes.insert(
            path.clone(),
            Node {
                data: payload,
                owner,
            },
        );
        self.notify(path, WatchEvent::ChildCreated);

        Ok(())
    }

    fn delete(&mut self, path: &NodePath) -> Result<(), CoordinationError> {
        if !self.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }

        if path.is_root() || !self.children_of(path).is_empty() {
            return Err(CoordinationError::NotEmpty(path.to_string()));
        }

        self.nodes.remove(path);
        self.notify(path, WatchEvent::ChildDeleted);

        Ok(())
    }

    fn expire(&mut self, session_id: SessionId) {
        if !self.set_session_state(session_id, SessionState::Expired) {
            return;
        }

        info!(session_id = session_id.0, "Memory session expired.");

        self.watchers.retain(|w| w.session != session_id);

        let owned = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect::<Vec<_>>();
        for path in owned {
            self.nodes.remove(&path);
            self.notify(&path, WatchEvent::ChildDeleted);
        }

        for (path, election) in self.elections.iter_mut() {
            election.remove_where(path, |c| c.session == session_id);
        }
    }
}

#[derive(Clone)]
/// A session of a [MemoryCoordinator].
pub struct MemoryClient {
    session_id: SessionId,
    coordinator: MemoryCoordinator,
}

impl MemoryClient {
    #[inline]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[inline]
    pub fn coordinator(&self) -> &MemoryCoordinator {
        &self.coordinator
    }

    /// Gracefully ends the session, equivalent to it expiring.
    pub fn close(&self) {
        self.coordinator.expire_session(self.session_id);
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    fn session_state(&self) -> watch::Receiver<SessionState> {
        let lock = self.coordinator.state.lock();
        match lock.sessions.get(&self.session_id) {
            Some(tx) => tx.subscribe(),
            None => watch::channel(SessionState::Expired).1,
        }
    }

    async fn create(
        &self,
        path: &NodePath,
        payload: Payload,
        mode: CreateMode,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError> {
        let mut lock = self.coordinator.state.lock();
        lock.check_session(self.session_id)?;
        lock.check_fence(self.session_id, fence)?;
        lock.create(self.session_id, path, payload, mode)
    }

    async fn delete(
        &self,
        path: &NodePath,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError> {
        let mut lock = self.coordinator.state.lock();
        lock.check_session(self.session_id)?;
        lock.check_fence(self.session_id, fence)?;
        lock.delete(path)
    }

    async fn set_data(
        &self,
        path: &NodePath,
        payload: Payload,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError> {
        let mut lock = self.coordinator.state.lock();
        lock.check_session(self.session_id)?;
        lock.check_fence(self.session_id, fence)?;

        let node = lock
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        node.data = payload;
        lock.notify(path, WatchEvent::DataChanged);

        Ok(())
    }

    async fn get_data(&self, path: &NodePath) -> Result<Payload, CoordinationError> {
        let lock = self.coordinator.state.lock();
        lock.check_session(self.session_id)?;
        lock.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    async fn get_children(
        &self,
        path: &NodePath,
    ) -> Result<Vec<String>, CoordinationError> {
        let lock = self.coordinator.state.lock();
        lock.check_session(self.session_id)?;
        if !lock.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        Ok(lock.children_of(path))
    }

    async fn watch_children(
        &self,
        path: &NodePath,
    ) -> Result<ChildrenWatch, CoordinationError> {
        let mut lock = self.coordinator.state.lock();
        lock.check_session(self.session_id)?;
        if !lock.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }

        let children = lock.children_of(path);
        let (tx, events) = flume::unbounded();
        lock.watchers.push(Watcher {
            parent: path.clone(),
            session: self.session_id,
            tx,
        });

        Ok(ChildrenWatch { children, events })
    }

    async fn run_for_election(
        &self,
        election: &NodePath,
        candidate_id: &str,
    ) -> Result<Candidacy, CoordinationError> {
        let mut lock = self.coordinator.state.lock();
        lock.check_session(self.session_id)?;

        lock.next_candidacy_id += 1;
        let id = CandidacyId(lock.next_candidacy_id);
        let (holder, holder_rx) = watch::channel(None);

        let entry = lock.elections.entry(election.clone()).or_default();
        entry.queue.push_back(Candidate {
            id,
            session: self.session_id,
            candidate_id: candidate_id.to_string(),
            holder,
        });
        entry.refresh(election);

        Ok(Candidacy {
            id,
            holder: holder_rx,
        })
    }

    async fn withdraw(
        &self,
        election: &NodePath,
        candidacy: CandidacyId,
    ) -> Result<(), CoordinationError> {
        let mut lock = self.coordinator.state.lock();
        lock.check_session(self.session_id)?;

        let entry = lock
            .elections
            .get_mut(election)
            .ok_or_else(|| CoordinationError::NoNode(election.to_string()))?;
        if !entry.queue.iter().any(|c| c.id == candidacy) {
            return Err(CoordinationError::NoNode(election.to_string()));
        }
        entry.remove_where(election, |c| c.id == candidacy);

        Ok(())
    }
}

/// A wrapping type around another `CoordinationClient` implementation that
/// logs all the activity going into and out of the client.
pub struct InstrumentedClient<C: CoordinationClient>(pub C);

#[async_trait]
impl<C: CoordinationClient> CoordinationClient for InstrumentedClient<C> {
    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.0.session_state()
    }

    async fn create(
        &self,
        path: &NodePath,
        payload: Payload,
        mode: CreateMode,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError> {
        let res = self.0.create(path, payload, mode, fence).await;
        info!(path = %path, mode = ?mode, fence = ?fence, result = ?res, "create");
        res
    }

    async fn delete(
        &self,
        path: &NodePath,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError> {
        let res = self.0.delete(path, fence).await;
        info!(path = %path, fence = ?fence, result = ?res, "delete");
        res
    }

    async fn set_data(
        &self,
        path: &NodePath,
        payload: Payload,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError> {
        let res = self.0.set_data(path, payload, fence).await;
        info!(path = %path, fence = ?fence, result = ?res, "set_data");
        res
    }

    async fn get_data(&self, path: &NodePath) -> Result<Payload, CoordinationError> {
        let res = self.0.get_data(path).await;
        info!(path = %path, found = res.is_ok(), "get_data");
        res
    }

    async fn get_children(
        &self,
        path: &NodePath,
    ) -> Result<Vec<String>, CoordinationError> {
        let res = self.0.get_children(path).await;
        info!(path = %path, result = ?res, "get_children");
        res
    }

    async fn watch_children(
        &self,
        path: &NodePath,
    ) -> Result<ChildrenWatch, CoordinationError> {
        let res = self.0.watch_children(path).await;
        info!(
            path = %path,
            children = ?res.as_ref().map(|w| &w.children),
            "watch_children",
        );
        res
    }

    async fn run_for_election(
        &self,
        election: &NodePath,
        candidate_id: &str,
    ) -> Result<Candidacy, CoordinationError> {
        info!(election = %election, candidate_id = candidate_id, "run_for_election");
        self.0.run_for_election(election, candidate_id).await
    }

    async fn withdraw(
        &self,
        election: &NodePath,
        candidacy: CandidacyId,
    ) -> Result<(), CoordinationError> {
        info!(election = %election, candidacy = ?candidacy, "withdraw");
        self.0.withdraw(election, candidacy).await
    }
}

#[derive(Default)]
struct Faults {
    election: Option<CoordinationError>,
    children: HashMap<String, CoordinationError>,
}

#[derive(Clone)]
/// A wrapping type around another `CoordinationClient` implementation that
/// fails selected operations with an injected error until cleared.
pub struct FaultyClient<C: CoordinationClient> {
    inner: C,
    faults: Arc<Mutex<Faults>>,
}

impl<C: CoordinationClient> FaultyClient<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            faults: Arc::default(),
        }
    }

    /// The wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Fails every `run_for_election` call with `err`.
    pub fn fail_election(&self, err: CoordinationError) {
        self.faults.lock().election = Some(err);
    }

    /// Fails every listing or watch of the children of `path` with `err`.
    pub fn fail_children_of(&self, path: &str, err: CoordinationError) {
        self.faults.lock().children.insert(path.to_string(), err);
    }

    /// Removes all injected failures.
    pub fn clear(&self) {
        *self.faults.lock() = Faults::default();
    }

    fn children_fault(&self, path: &NodePath) -> Result<(), CoordinationError> {
        match self.faults.lock().children.get(path.as_str()) {
            Some(err) => {
                debug!(path = %path, error = ?err, "Injecting children failure.");
                Err(err.clone())
            },
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<C: CoordinationClient> CoordinationClient for FaultyClient<C> {
    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.inner.session_state()
    }

    async fn create(
        &self,
        path: &NodePath,
        payload: Payload,
        mode: CreateMode,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError> {
        self.inner.create(path, payload, mode, fence).await
    }

    async fn delete(
        &self,
        path: &NodePath,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError> {
        self.inner.delete(path, fence).await
    }

    async fn set_data(
        &self,
        path: &NodePath,
        payload: Payload,
        fence: Option<&Fence>,
    ) -> Result<(), CoordinationError> {
        self.inner.set_data(path, payload, fence).await
    }

    async fn get_data(&self, path: &NodePath) -> Result<Payload, CoordinationError> {
        self.inner.get_data(path).await
    }

    async fn get_children(
        &self,
        path: &NodePath,
    ) -> Result<Vec<String>, CoordinationError> {
        self.children_fault(path)?;
        self.inner.get_children(path).await
    }

    async fn watch_children(
        &self,
        path: &NodePath,
    ) -> Result<ChildrenWatch, CoordinationError> {
        self.children_fault(path)?;
        self.inner.watch_children(path).await
    }

    async fn run_for_election(
        &self,
        election: &NodePath,
        candidate_id: &str,
    ) -> Result<Candidacy, CoordinationError> {
        let fault = self.faults.lock().election.clone();
        if let Some(err) = fault {
            debug!(election = %election, error = ?err, "Injecting election failure.");
            return Err(err);
        }
        self.inner.run_for_election(election, candidate_id).await
    }

    async fn withdraw(
        &self,
        election: &NodePath,
        candidacy: CandidacyId,
    ) -> Result<(), CoordinationError> {
        self.inner.withdraw(election, candidacy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> NodePath {
        NodePath::new(p).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_delete() -> anyhow::Result<()> {
        let coordinator = MemoryCoordinator::default();
        let client = coordinator.connect();

        client
            .create(&path("/tasks"), Vec::new(), CreateMode::Persistent, None)
            .await?;
        client
            .create(&path("/tasks/t1"), b"job".to_vec(), CreateMode::Persistent, None)
            .await?;

        let err = client
            .create(&path("/tasks/t1"), Vec::new(), CreateMode::Persistent, None)
            .await
            .unwrap_err();
        assert_eq!(err, CoordinationError::NodeExists("/tasks/t1".into()));

        let err = client
            .create(&path("/assign/w1"), Vec::new(), CreateMode::Persistent, None)
            .await
            .unwrap_err();
        assert_eq!(err, CoordinationError::NoParent("/assign/w1".into()));

        let err = client.delete(&path("/tasks"), None).await.unwrap_err();
        assert_eq!(err, CoordinationError::NotEmpty("/tasks".into()));

        assert_eq!(client.get_data(&path("/tasks/t1")).await?, b"job");
        assert_eq!(client.get_children(&path("/tasks")).await?, vec!["t1"]);

        client.delete(&path("/tasks/t1"), None).await?;
        let err = client.delete(&path("/tasks/t1"), None).await.unwrap_err();
        assert_eq!(err, CoordinationError::NoNode("/tasks/t1".into()));

        Ok(())
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_follow_session() -> anyhow::Result<()> {
        let coordinator = MemoryCoordinator::default();
        let observer = coordinator.connect();
        let worker = coordinator.connect();

        observer
            .create(&path("/workers"), Vec::new(), CreateMode::Persistent, None)
            .await?;
        let watch = observer.watch_children(&path("/workers")).await?;
        assert!(watch.children.is_empty());

        worker
            .create(&path("/workers/w1"), Vec::new(), CreateMode::Ephemeral, None)
            .await?;
        assert_eq!(
            watch.events.recv_async().await?,
            WatchEvent::ChildCreated("w1".into())
        );

        worker.close();
        assert_eq!(
            watch.events.recv_async().await?,
            WatchEvent::ChildDeleted("w1".into())
        );
        assert!(!coordinator.exists("/workers/w1"));

        let err = worker.get_children(&path("/workers")).await.unwrap_err();
        assert_eq!(err, CoordinationError::SessionExpired);

        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_closes_watches() -> anyhow::Result<()> {
        let coordinator = MemoryCoordinator::default();
        let client = coordinator.connect();

        let watch = client.watch_children(&NodePath::root()).await?;
        coordinator.disconnect(client.session_id());

        assert!(watch.events.recv_async().await.is_err());
        assert_eq!(
            *client.session_state().borrow(),
            SessionState::Disconnected
        );
        let err = client.get_children(&NodePath::root()).await.unwrap_err();
        assert_eq!(err, CoordinationError::ConnectionLoss);

        coordinator.reconnect(client.session_id());
        assert_eq!(*client.session_state().borrow(), SessionState::Connected);
        client.get_children(&NodePath::root()).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_election_hand_over_and_fencing() -> anyhow::Result<()> {
        let coordinator = MemoryCoordinator::default();
        let election = path("/master");
        let first = coordinator.connect();
        let second = coordinator.connect();

        let first_candidacy = first.run_for_election(&election, "m1").await?;
        let second_candidacy = second.run_for_election(&election, "m2").await?;

        assert_eq!(*first_candidacy.holder.borrow(), Some(Epoch(1)));
        assert_eq!(*second_candidacy.holder.borrow(), None);
        assert_eq!(
            coordinator.election_holder("/master"),
            Some(("m1".to_string(), Epoch(1)))
        );

        let fence = Fence::new(election.clone(), Epoch(1));
        first
            .create(&path("/a"), Vec::new(), CreateMode::Persistent, Some(&fence))
            .await?;
        let err = second
            .create(&path("/b"), Vec::new(), CreateMode::Persistent, Some(&fence))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Fenced { .. }));

        first.close();
        assert_eq!(*second_candidacy.holder.borrow(), Some(Epoch(2)));

        let err = second
            .create(&path("/b"), Vec::new(), CreateMode::Persistent, Some(&fence))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoordinationError::Fenced {
                election: "/master".into(),
                presented: Epoch(1),
                current: Some(Epoch(2)),
            }
        );

        let fence = Fence::new(election.clone(), Epoch(2));
        second
            .create(&path("/b"), Vec::new(), CreateMode::Persistent, Some(&fence))
            .await?;

        second.withdraw(&election, second_candidacy.id).await?;
        assert_eq!(coordinator.election_holder("/master"), None);
        assert!(second.withdraw(&election, second_candidacy.id).await.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_instrumented_client_passes_through() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt::try_init();

        let coordinator = MemoryCoordinator::default();
        let client = InstrumentedClient(coordinator.connect());

        client
            .create(&path("/status"), b"ok".to_vec(), CreateMode::Persistent, None)
            .await?;
        client.set_data(&path("/status"), b"busy".to_vec(), None).await?;
        assert_eq!(client.get_data(&path("/status")).await?, b"busy");
        assert_eq!(coordinator.data("/status"), Some(b"busy".to_vec()));

        Ok(())
    }

    #[tokio::test]
    async fn test_faulty_client_injects_until_cleared() -> anyhow::Result<()> {
        let coordinator = MemoryCoordinator::default();
        let client = FaultyClient::new(coordinator.connect());
        client
            .create(&path("/assign"), Vec::new(), CreateMode::Persistent, None)
            .await?;

        client.fail_children_of("/assign", CoordinationError::ConnectionLoss);
        client.fail_election(CoordinationError::Timeout(std::time::Duration::from_secs(1)));
        assert_eq!(
            client.get_children(&path("/assign")).await.unwrap_err(),
            CoordinationError::ConnectionLoss
        );
        assert!(client.watch_children(&path("/assign")).await.is_err());
        assert!(client.run_for_election(&path("/master"), "m1").await.is_err());
        assert_eq!(coordinator.election_holder("/master"), None);

        client.clear();
        assert!(client.get_children(&path("/assign")).await?.is_empty());
        let candidacy = client.run_for_election(&path("/master"), "m1").await?;
        assert!(candidacy.holder.borrow().is_some());

        Ok(())
    }
}
