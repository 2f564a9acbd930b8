use std::collections::BTreeMap;

use foreman_coordination::test_utils::{MemoryClient, MemoryCoordinator};
use foreman_coordination::{CoordinationClient, CreateMode, Namespace};

/// Opens a new session and registers it as a live worker.
///
/// Closing or expiring the returned session removes the worker.
pub async fn spawn_worker(
    coordinator: &MemoryCoordinator,
    namespace: &Namespace,
    worker_id: &str,
) -> anyhow::Result<MemoryClient> {
    let client = coordinator.connect();
    client
        .create(
            &namespace.worker(worker_id)?,
            Vec::new(),
            CreateMode::Ephemeral,
            None,
        )
        .await?;
    debug!(worker_id = %worker_id, session_id = client.session_id().0, "Spawned worker.");
    Ok(client)
}

/// Submits a task.
pub async fn create_task<C: CoordinationClient>(
    client: &C,
    namespace: &Namespace,
    task_id: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    client
        .create(
            &namespace.task(task_id)?,
            payload.to_vec(),
            CreateMode::Persistent,
            None,
        )
        .await?;
    Ok(())
}

/// Completes a task the way a worker does, removing its assignment and
/// then the task itself.
pub async fn complete_task<C: CoordinationClient>(
    client: &C,
    namespace: &Namespace,
    worker_id: &str,
    task_id: &str,
) -> anyhow::Result<()> {
    client
        .delete(&namespace.assignment(worker_id, task_id)?, None)
        .await?;
    client.delete(&namespace.task(task_id)?, None).await?;
    Ok(())
}

/// The current assignments of the namespace, keyed by task id.
///
/// A task mapping to more than one worker violates the at-most-one
/// assignment guarantee.
pub fn assignments(
    coordinator: &MemoryCoordinator,
    namespace: &Namespace,
) -> BTreeMap<String, Vec<String>> {
    let mut tasks = BTreeMap::<String, Vec<String>>::new();
    for worker_id in coordinator.children(namespace.assign().as_str()) {
        let segment = match namespace.assignments_of(&worker_id) {
            Ok(segment) => segment,
            Err(_) => continue,
        };
        for task_id in coordinator.children(segment.as_str()) {
            tasks.entry(task_id).or_default().push(worker_id.clone());
        }
    }
    tasks
}
