use std::sync::Arc;
use std::time::Duration;

use foreman_coordination::test_utils::{MemoryClient, MemoryCoordinator};
use foreman_coordination::{Epoch, Namespace};
use foreman_master::{EngineState, Master, MasterConfig, MasterError, MasterHandle};
use test_helper::{assignments, create_task, spawn_worker, wait_until};

const WAIT: Duration = Duration::from_secs(10);

async fn setup() -> anyhow::Result<(MemoryCoordinator, MemoryClient, Namespace)> {
    let coordinator = MemoryCoordinator::default();
    let admin = coordinator.connect();
    let namespace = Namespace::default();
    namespace.bootstrap(&admin).await?;
    Ok((coordinator, admin, namespace))
}

fn start_master(client: MemoryClient, my_id: &str) -> MasterHandle {
    let config = MasterConfig::new(my_id).with_retry_backoff(Duration::from_millis(50));
    Master::new(Arc::new(client), config).start()
}

#[tokio::test]
async fn test_single_master_among_candidates() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (coordinator, _admin, _ns) = setup().await?;
    let mut masters = Vec::new();
    for id in ["m1", "m2", "m3"] {
        masters.push(start_master(coordinator.connect(), id));
    }

    wait_until(|| masters.iter().any(|m| m.is_leader()), WAIT).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let leaders = masters.iter().filter(|m| m.is_leader()).count();
    assert_eq!(leaders, 1, "Exactly one master should hold the election.");

    let idx = masters
        .iter()
        .position(|m| m.is_leader())
        .expect("A leader should exist");
    let (holder, epoch) = coordinator
        .election_holder("/master")
        .expect("The election should be held");
    assert_eq!(holder, masters[idx].my_id());
    assert_eq!(epoch, Epoch(1));

    masters.remove(idx).shutdown().await?;

    wait_until(|| masters.iter().any(|m| m.is_leader()), WAIT).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(masters.iter().filter(|m| m.is_leader()).count(), 1);
    assert_eq!(coordinator.election_holder("/master").map(|(_, e)| e), Some(Epoch(2)));

    for master in masters {
        master.shutdown().await?;
    }

    Ok(())
}

#[tokio::test]
async fn test_failover_recovers_orphaned_assignments() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (coordinator, admin, ns) = setup().await?;
    let w1 = spawn_worker(&coordinator, &ns, "w1").await?;

    let m1_client = coordinator.connect();
    let m1_session = m1_client.session_id();
    let m1 = start_master(m1_client, "m1");
    m1.wait_for_state(|s| *s == EngineState::SteadyState, WAIT)
        .await?;

    for task_id in ["t1", "t2", "t3", "t4"] {
        create_task(&admin, &ns, task_id, task_id.as_bytes()).await?;
    }
    wait_until(|| assignments(&coordinator, &ns).len() == 4, WAIT).await?;
    assert_eq!(coordinator.children("/assign/w1").len(), 4);

    let _w2 = spawn_worker(&coordinator, &ns, "w2").await?;
    let m2 = start_master(coordinator.connect(), "m2");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!m2.is_leader());

    // The master and a worker crash together, the worker's assignments are
    // left behind for the next master to find.
    coordinator.expire_session(m1_session);
    w1.close();

    let err = m1.join().await.unwrap_err();
    assert!(matches!(err, MasterError::SessionExpired));

    let leadership = m2.wait_for_leadership(|s| s.is_leader(), WAIT).await?;
    assert_eq!(leadership.epoch(), Some(Epoch(2)));

    wait_until(
        || {
            let current = assignments(&coordinator, &ns);
            current.len() == 4 && current.values().all(|w| w == &vec!["w2".to_string()])
        },
        WAIT,
    )
    .await?;
    assert!(!coordinator.exists("/assign/w1"));
    for task_id in ["t1", "t2", "t3", "t4"] {
        let path = format!("/assign/w2/{task_id}");
        assert_eq!(coordinator.data(&path), Some(task_id.as_bytes().to_vec()));
    }
    assert_eq!(m2.statistics().num_orphans_recovered(), 4);

    m2.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_new_master_keeps_existing_assignments() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (coordinator, admin, ns) = setup().await?;
    let _w1 = spawn_worker(&coordinator, &ns, "w1").await?;
    let _w2 = spawn_worker(&coordinator, &ns, "w2").await?;

    let m1 = start_master(coordinator.connect(), "m1");
    for i in 0..5 {
        create_task(&admin, &ns, &format!("t{i}"), b"job").await?;
    }
    wait_until(|| assignments(&coordinator, &ns).len() == 5, WAIT).await?;
    let before = assignments(&coordinator, &ns);
    m1.shutdown().await?;

    let m2 = start_master(coordinator.connect(), "m2");
    m2.wait_for_state(|s| *s == EngineState::SteadyState, WAIT)
        .await?;

    assert_eq!(assignments(&coordinator, &ns), before);
    let stats = m2.statistics();
    assert_eq!(stats.num_assignments_created(), 0);
    assert_eq!(stats.num_orphans_recovered(), 0);
    assert_eq!(stats.num_pending_tasks(), 0);
    assert_eq!(stats.num_live_workers(), 2);

    m2.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_master_recovers_from_connection_loss() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (coordinator, admin, ns) = setup().await?;
    let _w1 = spawn_worker(&coordinator, &ns, "w1").await?;

    let client = coordinator.connect();
    let session_id = client.session_id();
    let master = start_master(client, "m1");
    master
        .wait_for_state(|s| *s == EngineState::SteadyState, WAIT)
        .await?;

    coordinator.disconnect(session_id);
    master.wait_for_leadership(|s| !s.is_leader(), WAIT).await?;
    master
        .wait_for_state(|s| *s == EngineState::Idle, WAIT)
        .await?;

    create_task(&admin, &ns, "t1", b"a").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(assignments(&coordinator, &ns).is_empty());

    coordinator.reconnect(session_id);
    let leadership = master.wait_for_leadership(|s| s.is_leader(), WAIT).await?;
    assert_eq!(
        leadership.epoch(),
        Some(Epoch(2)),
        "Mastership regained after a connection loss starts a new term."
    );

    wait_until(|| coordinator.exists("/assign/w1/t1"), WAIT).await?;
    assert_eq!(master.statistics().num_terms(), 2);

    master.shutdown().await?;
    Ok(())
}
