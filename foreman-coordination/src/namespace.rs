use crate::{CoordinationClient, CoordinationError, CreateMode, NodePath};

static ELECTION: &str = "master";
static WORKERS: &str = "workers";
static TASKS: &str = "tasks";
static ASSIGN: &str = "assign";
static STATUS: &str = "status";

#[derive(Debug, Clone, PartialEq, Eq)]
/// The layout of a cluster namespace.
///
/// ```text
/// {root}/master                     election token
/// {root}/workers/{workerId}         ephemeral liveness markers
/// {root}/tasks/{taskId}             task payloads
/// {root}/assign/{workerId}/{taskId} assignments, a copy of the task payload
/// {root}/status                     reserved
/// ```
pub struct Namespace {
    root: NodePath,
    election: NodePath,
    workers: NodePath,
    tasks: NodePath,
    assign: NodePath,
    status: NodePath,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::with_root(NodePath::root())
            .expect("Static namespace segments should always be valid")
    }
}

impl Namespace {
    /// Creates a namespace rooted at the given absolute path.
    pub fn new(root: impl Into<String>) -> Result<Self, CoordinationError> {
        Self::with_root(NodePath::new(root)?)
    }

    fn with_root(root: NodePath) -> Result<Self, CoordinationError> {
        Ok(Self {
            election: root.join(ELECTION)?,
            workers: root.join(WORKERS)?,
            tasks: root.join(TASKS)?,
            assign: root.join(ASSIGN)?,
            status: root.join(STATUS)?,
            root,
        })
    }

    #[inline]
    pub fn root(&self) -> &NodePath {
        &self.root
    }

    #[inline]
    pub fn election(&self) -> &NodePath {
        &self.election
    }

    #[inline]
    pub fn workers(&self) -> &NodePath {
        &self.workers
    }

    #[inline]
    pub fn tasks(&self) -> &NodePath {
        &self.tasks
    }

    #[inline]
    pub fn assign(&self) -> &NodePath {
        &self.assign
    }

    #[inline]
    pub fn status(&self) -> &NodePath {
        &self.status
    }

    /// The liveness marker of a worker.
    pub fn worker(&self, worker_id: &str) -> Result<NodePath, CoordinationError> {
        self.workers.join(worker_id)
    }

    /// The payload node of a task.
    pub fn task(&self, task_id: &str) -> Result<NodePath, CoordinationError> {
        self.tasks.join(task_id)
    }

    /// The parent node holding every assignment of a worker.
    pub fn assignments_of(&self, worker_id: &str) -> Result<NodePath, CoordinationError> {
        self.assign.join(worker_id)
    }

    /// The assignment binding `task_id` to `worker_id`.
    pub fn assignment(
        &self,
        worker_id: &str,
        task_id: &str,
    ) -> Result<NodePath, CoordinationError> {
        self.assignments_of(worker_id)?.join(task_id)
    }

    /// Creates the persistent top level nodes of the namespace.
    ///
    /// Nodes which already exist are left untouched, so this can safely be
    /// called by every process joining the cluster.
    pub async fn bootstrap<C>(&self, client: &C) -> Result<(), CoordinationError>
    where
        C: CoordinationClient + ?Sized,
    {
        let mut ancestors = Vec::new();
        let mut current = self.root.parent();
        while let Some(path) = current {
            current = path.parent();
            if !path.is_root() {
                ancestors.push(path);
            }
        }

        let nodes = ancestors
            .into_iter()
            .rev()
            .chain(std::iter::once(self.root.clone()).filter(|p| !p.is_root()))
            .chain([
                self.workers.clone(),
                self.assign.clone(),
                self.tasks.clone(),
                self.status.clone(),
            ]);

        for path in nodes {
            match client
                .create(&path, Vec::new(), CreateMode::Persistent, None)
                .await
            {
                Ok(()) => debug!(path = %path, "Created namespace node."),
                Err(CoordinationError::NodeExists(_)) => {},
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}
