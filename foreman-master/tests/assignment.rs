use std::sync::Arc;
use std::time::Duration;

use foreman_coordination::test_utils::{MemoryClient, MemoryCoordinator};
use foreman_coordination::Namespace;
use foreman_master::{EngineState, Master, MasterConfig, MasterHandle};
use futures::StreamExt;
use test_helper::{assignments, complete_task, create_task, spawn_worker, wait_until};

const WAIT: Duration = Duration::from_secs(10);

async fn setup() -> anyhow::Result<(MemoryCoordinator, MemoryClient, Namespace)> {
    let coordinator = MemoryCoordinator::default();
    let admin = coordinator.connect();
    let namespace = Namespace::default();
    namespace.bootstrap(&admin).await?;
    Ok((coordinator, admin, namespace))
}

async fn start_master(
    coordinator: &MemoryCoordinator,
    my_id: &str,
) -> anyhow::Result<MasterHandle> {
    let config = MasterConfig::new(my_id)
        .with_rng_seed(42)
        .with_retry_backoff(Duration::from_millis(50));
    let master = Master::new(Arc::new(coordinator.connect()), config).start();
    master
        .wait_for_state(|s| *s == EngineState::SteadyState, WAIT)
        .await?;
    Ok(master)
}

fn assigned_to(
    coordinator: &MemoryCoordinator,
    namespace: &Namespace,
    task_id: &str,
) -> Vec<String> {
    assignments(coordinator, namespace)
        .remove(task_id)
        .unwrap_or_default()
}

#[tokio::test]
async fn test_worker_failure_moves_task() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (coordinator, admin, ns) = setup().await?;
    let w1 = spawn_worker(&coordinator, &ns, "w1").await?;
    let w2 = spawn_worker(&coordinator, &ns, "w2").await?;
    let master = start_master(&coordinator, "m1").await?;

    create_task(&admin, &ns, "t1", b"run-job-A").await?;
    wait_until(|| assigned_to(&coordinator, &ns, "t1").len() == 1, WAIT).await?;

    let holder = assigned_to(&coordinator, &ns, "t1").remove(0);
    let (survivor, _kept) = if holder == "w1" {
        w1.close();
        ("w2", w2)
    } else {
        w2.close();
        ("w1", w1)
    };

    wait_until(
        || assigned_to(&coordinator, &ns, "t1") == vec![survivor.to_string()],
        WAIT,
    )
    .await?;
    let path = format!("/assign/{survivor}/t1");
    assert_eq!(coordinator.data(&path), Some(b"run-job-A".to_vec()));
    assert!(!coordinator.exists(&format!("/assign/{holder}")));

    let stats = master.statistics();
    assert_eq!(stats.num_tasks_reassigned(), 1);
    assert_eq!(stats.num_assignments_created(), 2);

    master.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_task_waits_for_first_worker() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (coordinator, admin, ns) = setup().await?;
    let master = start_master(&coordinator, "m1").await?;

    create_task(&admin, &ns, "t2", b"b").await?;
    wait_until(|| master.statistics().num_pending_tasks() == 1, WAIT).await?;
    assert!(assignments(&coordinator, &ns).is_empty());

    let _w3 = spawn_worker(&coordinator, &ns, "w3").await?;
    wait_until(
        || assigned_to(&coordinator, &ns, "t2") == vec!["w3".to_string()],
        WAIT,
    )
    .await?;
    assert_eq!(coordinator.data("/assign/w3/t2"), Some(b"b".to_vec()));
    assert_eq!(master.statistics().num_pending_tasks(), 0);

    master.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_at_most_one_assignment_under_churn() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (coordinator, admin, ns) = setup().await?;
    let mut workers = Vec::new();
    for id in ["w1", "w2", "w3"] {
        workers.push(spawn_worker(&coordinator, &ns, id).await?);
    }
    let master = start_master(&coordinator, "m1").await?;

    let task_ids = (0..20).map(|i| format!("t{i}")).collect::<Vec<_>>();
    for task_id in task_ids.iter() {
        create_task(&admin, &ns, task_id, task_id.as_bytes()).await?;
    }

    for round in 0..6 {
        let leaving = workers.remove(0);
        leaving.close();
        let new_id = format!("w{}", round + 4);
        workers.push(spawn_worker(&coordinator, &ns, &new_id).await?);

        for _ in 0..5 {
            for (task_id, holders) in assignments(&coordinator, &ns) {
                assert!(holders.len() <= 1, "{task_id} is assigned to {holders:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    let live = coordinator.children("/workers");
    wait_until(
        || {
            let current = assignments(&coordinator, &ns);
            current.len() == task_ids.len()
                && current
                    .values()
                    .all(|holders| holders.len() == 1 && live.contains(&holders[0]))
        },
        WAIT,
    )
    .await?;

    for worker_id in coordinator.children("/assign") {
        assert!(live.contains(&worker_id), "{worker_id} should have been drained");
    }

    master.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_completed_tasks_are_not_reassigned() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (coordinator, admin, ns) = setup().await?;
    let w1 = spawn_worker(&coordinator, &ns, "w1").await?;
    let master = start_master(&coordinator, "m1").await?;

    create_task(&admin, &ns, "t1", b"a").await?;
    create_task(&admin, &ns, "t2", b"b").await?;
    wait_until(|| assignments(&coordinator, &ns).len() == 2, WAIT).await?;

    complete_task(&w1, &ns, "w1", "t1").await?;
    wait_until(|| !coordinator.exists("/tasks/t1"), WAIT).await?;

    let _w2 = spawn_worker(&coordinator, &ns, "w2").await?;
    w1.close();

    wait_until(
        || assigned_to(&coordinator, &ns, "t2") == vec!["w2".to_string()],
        WAIT,
    )
    .await?;
    assert!(assigned_to(&coordinator, &ns, "t1").is_empty());

    master.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_tears_down() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (coordinator, admin, ns) = setup().await?;
    let _w1 = spawn_worker(&coordinator, &ns, "w1").await?;
    let master = start_master(&coordinator, "m1").await?;
    assert!(master.is_leader());

    let mut states = master.state_changes();
    master.shutdown().await?;

    assert_eq!(coordinator.election_holder("/master"), None);

    // Nothing reacts to the namespace any more.
    create_task(&admin, &ns, "t1", b"a").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(assignments(&coordinator, &ns).is_empty());

    let mut last = None;
    while let Some(state) = states.next().await {
        last = Some(state);
    }
    assert_eq!(last, Some(EngineState::Idle));

    Ok(())
}

#[tokio::test]
async fn test_namespace_can_be_rooted() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let coordinator = MemoryCoordinator::default();
    let admin = coordinator.connect();
    let ns = Namespace::new("/clusters/blue")?;
    ns.bootstrap(&admin).await?;

    let _w1 = spawn_worker(&coordinator, &ns, "w1").await?;
    let config = MasterConfig::new("m1").with_namespace(ns.clone());
    let master = Master::new(Arc::new(coordinator.connect()), config).start();
    master
        .wait_for_state(|s| *s == EngineState::SteadyState, WAIT)
        .await?;
    assert_eq!(
        coordinator.election_holder("/clusters/blue/master").map(|(id, _)| id),
        Some("m1".to_string())
    );

    create_task(&admin, &ns, "t1", b"a").await?;
    wait_until(|| coordinator.exists("/clusters/blue/assign/w1/t1"), WAIT).await?;
    assert!(!coordinator.exists("/assign"));

    master.shutdown().await?;
    Ok(())
}
