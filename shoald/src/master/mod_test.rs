use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use crate::config::Config;
use crate::coordination::MemoryCoordination;
use crate::fixtures::{self, FailingHandler, NoopHandler, RecordingRouter, TestNode};
use crate::master::{Master, MasterCtl, MasterState};
use shoal_core::namespace::ServiceKind;
use shoal_core::reqtype::WriteReqType;
use shoal_core::znode::NodeState;
use shoal_core::WaitTimeout;

fn tmpdir() -> Result<tempfile::TempDir> {
    tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")
}

async fn elected_master(nodes: &[&TestNode]) -> Option<Master> {
    for node in nodes {
        if node.master.is_elected(ServiceKind::Search).await.unwrap_or(false) {
            return Some(node.master.clone());
        }
    }
    None
}

#[tokio::test]
async fn lifecycle_waits_for_workers_and_session() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let dir = tmpdir()?;

    // A master with no workers in sight idles in WAIT_WORKERS.
    let config = Config::new_test_node(&dir, 3, 7, "1", 1)?;
    let client = coordination.connect();
    client.ensure_path(config.namespace().root()).await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let (master_ctl, master) = MasterCtl::new(config, client, shutdown_tx.subscribe());
    let _handle = master_ctl.spawn();

    fixtures::wait_until("master to wait for workers", || {
        let master = master.clone();
        async move { master.state().await.ok() == Some(MasterState::StartingWaitWorkers) }
    })
    .await?;

    // A worker covering the shard set unblocks startup.
    let _node = fixtures::spawn_node(&coordination, &dir, 1, 1, "1", 1, Arc::new(NoopHandler)).await?;
    fixtures::wait_until("master to start", || {
        let master = master.clone();
        async move { master.state().await.ok() == Some(MasterState::Started) }
    })
    .await?;

    // Connection loss parks the state machine; the session surviving the
    // outage puts it straight back to STARTED.
    coordination.set_connected(false);
    fixtures::wait_until("master to wait for the coordination service", || {
        let master = master.clone();
        async move { master.state().await.ok() == Some(MasterState::StartingWaitZk) }
    })
    .await?;
    coordination.set_connected(true);
    fixtures::wait_until("master to restart after reconnect", || {
        let master = master.clone();
        async move { master.state().await.ok() == Some(MasterState::Started) }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn failover_promotes_replica_and_reconciles_routing() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let dir = tmpdir()?;
    let node_a = fixtures::spawn_node(&coordination, &dir, 1, 1, "1", 1, Arc::new(NoopHandler)).await?;
    fixtures::wait_until("node A to win its election", || {
        let worker = node_a.worker.clone();
        async move { worker.is_primary(ServiceKind::Search).await.unwrap_or(false) }
    })
    .await?;
    let node_b = fixtures::spawn_node(&coordination, &dir, 2, 1, "1", 1, Arc::new(NoopHandler)).await?;

    let router = RecordingRouter::new(ServiceKind::Search);
    node_b.master.register_aggregator(router.clone(), false).await?;

    // The aggregator is reconciled to A, the elected shard primary.
    let a_port = node_a.config.worker_port;
    fixtures::wait_until("routing to point at node A", || {
        let router = router.clone();
        async move { router.routes().map(|routes| routes.get(&1).map(|ep| ep.port) == Some(a_port)).unwrap_or(false) }
    })
    .await?;

    // Dropping A's session promotes B and reconciles the routing table.
    coordination.expire_session(&node_a.client);
    let b_port = node_b.config.worker_port;
    fixtures::wait_until("routing to fail over to node B", || {
        let router = router.clone();
        async move { router.routes().map(|routes| routes.get(&1).map(|ep| ep.port) == Some(b_port)).unwrap_or(false) }
    })
    .await?;
    fixtures::wait_until("node B to hold the primary role", || {
        let worker = node_b.worker.clone();
        async move { worker.is_primary(ServiceKind::Search).await.unwrap_or(false) }
    })
    .await?;

    // At most one primary per shard: A re-registered as a follower.
    fixtures::wait_until("node A to rejoin as a follower", || {
        let worker = node_a.worker.clone();
        async move { worker.is_primary(ServiceKind::Search).await.map(|primary| !primary).unwrap_or(false) }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn service_master_election_and_discovery() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let dir = tmpdir()?;
    let node_a = fixtures::spawn_node(&coordination, &dir, 1, 1, "1", 1, Arc::new(NoopHandler)).await?;
    let node_b = fixtures::spawn_node(&coordination, &dir, 2, 1, "1", 1, Arc::new(NoopHandler)).await?;

    fixtures::wait_until("exactly one master to win the election", || {
        let (a, b) = (node_a.master.clone(), node_b.master.clone());
        async move {
            let a_elected = a.is_elected(ServiceKind::Search).await.unwrap_or(false);
            let b_elected = b.is_elected(ServiceKind::Search).await.unwrap_or(false);
            a_elected != b_elected
        }
    })
    .await?;

    // Discovery returns the elected master's advertised endpoint.
    let endpoint = node_b.master.find_service_master(ServiceKind::Search).await?.context("expected a discoverable master endpoint")?;
    assert_eq!(endpoint.0, "127.0.0.1");
    let elected_is_a = node_a.master.is_elected(ServiceKind::Search).await?;
    let expected_port = if elected_is_a { node_a.config.master_port } else { node_b.config.master_port };
    assert_eq!(endpoint.1, expected_port);

    // Expiring the elected master's session hands the role to the survivor.
    let expired_client = if elected_is_a { &node_a.client } else { &node_b.client };
    coordination.expire_session(expired_client);
    let survivor = if elected_is_a { node_b.master.clone() } else { node_a.master.clone() };
    fixtures::wait_until("the surviving master to take the election", || {
        let survivor = survivor.clone();
        async move { survivor.is_elected(ServiceKind::Search).await.unwrap_or(false) }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn write_request_commits_across_primary_and_replica() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let dir = tmpdir()?;
    let node_a = fixtures::spawn_node(&coordination, &dir, 1, 1, "1", 1, Arc::new(NoopHandler)).await?;
    fixtures::wait_until("node A to win its election", || {
        let worker = node_a.worker.clone();
        async move { worker.is_primary(ServiceKind::Search).await.unwrap_or(false) }
    })
    .await?;
    let node_b = fixtures::spawn_node(&coordination, &dir, 2, 1, "1", 1, Arc::new(NoopHandler)).await?;

    // The replica must be registered and READY before the first dispatch, or
    // it would not be enrolled as a participant.
    let ns = node_a.config.namespace();
    fixtures::wait_until("node B to join the election as a replica", || {
        let (client, parent) = (node_a.client.clone(), ns.election_parent(ServiceKind::Search, 1));
        async move { client.get_children(&parent).await.map(|children| children.len() == 2).unwrap_or(false) }
    })
    .await?;
    fixtures::wait_until("node B to advertise READY", || {
        let worker = node_b.worker.clone();
        async move { worker.node_state().await.ok() == Some(NodeState::Ready) }
    })
    .await?;
    fixtures::wait_until("an elected, started master", || {
        let (a, b) = (node_a.master.clone(), node_b.master.clone());
        async move {
            let a_ok = a.state().await.ok() == Some(MasterState::Started) && a.is_elected(ServiceKind::Search).await.unwrap_or(false);
            let b_ok = b.state().await.ok() == Some(MasterState::Started) && b.is_elected(ServiceKind::Search).await.unwrap_or(false);
            a_ok || b_ok
        }
    })
    .await?;
    let master = elected_master(&[&node_a, &node_b]).await.context("expected an elected master")?;

    // Two writes commit in order on the primary and its replica.
    master.push_write(ServiceKind::Search, WriteReqType::DocumentsCreate, b"doc-1".to_vec()).await?;
    fixtures::wait_until("first write to commit everywhere", || {
        let (reqlog_a, reqlog_b, master) = (node_a.reqlog.clone(), node_b.reqlog.clone(), master.clone());
        async move {
            reqlog_a.last_written_id().await.unwrap_or(0) == 1
                && reqlog_b.last_written_id().await.unwrap_or(0) == 1
                && master.pending_writes(ServiceKind::Search).await.unwrap_or(usize::MAX) == 0
        }
    })
    .await?;

    master.push_write(ServiceKind::Search, WriteReqType::DocumentsUpdate, b"doc-2".to_vec()).await?;
    fixtures::wait_until("second write to commit everywhere", || {
        let (reqlog_a, reqlog_b, master) = (node_a.reqlog.clone(), node_b.reqlog.clone(), master.clone());
        async move {
            reqlog_a.last_written_id().await.unwrap_or(0) == 2
                && reqlog_b.last_written_id().await.unwrap_or(0) == 2
                && master.pending_writes(ServiceKind::Search).await.unwrap_or(usize::MAX) == 0
        }
    })
    .await?;

    // Committed entries agree across the replica set.
    for id in 1..=2 {
        let primary_entry = node_a.reqlog.get_by_id(id).await?;
        let replica_entry = node_b.reqlog.get_by_id(id).await?;
        assert_eq!(primary_entry.head.inc_id, replica_entry.head.inc_id);
        assert_eq!(primary_entry.payload, replica_entry.payload);
    }

    // The shard's bulk-data receiver is the primary's data endpoint.
    let receiver = master.shard_receiver(ServiceKind::Search, 1).await?.context("expected a shard receiver")?;
    assert_eq!(receiver, ("127.0.0.1".to_string(), node_a.config.data_port));
    Ok(())
}

#[tokio::test]
async fn aborted_writes_follow_the_replay_policy() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let dir = tmpdir()?;
    let node = fixtures::spawn_node(&coordination, &dir, 1, 1, "1", 1, Arc::new(FailingHandler)).await?;
    fixtures::wait_until("an elected, started master", || {
        let master = node.master.clone();
        async move { master.state().await.ok() == Some(MasterState::Started) && master.is_elected(ServiceKind::Search).await.unwrap_or(false) }
    })
    .await?;

    // A non-replayable write which fails execution is dropped from the queue.
    node.master.push_write(ServiceKind::Search, WriteReqType::DocumentsCreate, b"doomed".to_vec()).await?;
    fixtures::wait_until("non-replayable write to be aborted and dropped", || {
        let (master, worker) = (node.master.clone(), node.worker.clone());
        async move {
            master.pending_writes(ServiceKind::Search).await.unwrap_or(usize::MAX) == 0
                && worker.node_state().await.ok() == Some(NodeState::Recovering)
        }
    })
    .await?;

    // Recover, then fail a replay-safe write: the queue entry is retained
    // for the next elected primary.
    node.worker.set_ready().await?;
    fixtures::wait_until("node to recover to READY", || {
        let worker = node.worker.clone();
        async move { worker.node_state().await.ok() == Some(NodeState::Ready) }
    })
    .await?;
    node.master.push_write(ServiceKind::Search, WriteReqType::DocumentsVisit, b"42".to_vec()).await?;
    fixtures::wait_until("replay-safe write to be aborted", || {
        let worker = node.worker.clone();
        async move { worker.node_state().await.ok() == Some(NodeState::Recovering) }
    })
    .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        node.master.pending_writes(ServiceKind::Search).await?,
        1,
        "replay-safe queue entry must be retained for replay"
    );
    Ok(())
}

#[tokio::test]
async fn self_targeted_push_without_include_self_is_dropped() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let dir = tmpdir()?;
    let node = fixtures::spawn_node(&coordination, &dir, 1, 1, "1", 1, Arc::new(NoopHandler)).await?;
    fixtures::wait_until("an elected, started master", || {
        let master = node.master.clone();
        async move { master.state().await.ok() == Some(MasterState::Started) && master.is_elected(ServiceKind::Search).await.unwrap_or(false) }
    })
    .await?;

    // The only target shard is primaried by the pushing node itself.
    node.master
        .push_write_to_shards(ServiceKind::Search, WriteReqType::DocumentsCreate, b"self".to_vec(), vec![1], false, false)
        .await?;
    fixtures::wait_until("self-targeted entry to be dropped", || {
        let master = node.master.clone();
        async move { master.pending_writes(ServiceKind::Search).await.unwrap_or(usize::MAX) == 0 }
    })
    .await?;
    assert_eq!(node.reqlog.last_written_id().await?, 0, "no write must have executed");
    Ok(())
}

#[tokio::test]
async fn migration_gates_writes_until_end_migrate() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let dir = tmpdir()?;
    let node = fixtures::spawn_node(&coordination, &dir, 1, 1, "1", 1, Arc::new(NoopHandler)).await?;
    fixtures::wait_until("an elected, started master", || {
        let master = node.master.clone();
        async move { master.state().await.ok() == Some(MasterState::Started) && master.is_elected(ServiceKind::Search).await.unwrap_or(false) }
    })
    .await?;

    node.master.begin_migrate(vec![1]).await?;
    node.master.push_write(ServiceKind::Search, WriteReqType::DocumentsCreate, b"queued".to_vec()).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.master.pending_writes(ServiceKind::Search).await?, 1, "writes must queue during migration");
    assert_eq!(node.reqlog.last_written_id().await?, 0, "writes must not execute during migration");

    // The target shard is READY under its (unchanged) identity.
    node.master.wait_migrate_ready(ServiceKind::Search, vec![1]).await?;
    // A shard which never materializes surfaces a timeout.
    let err = node.master.wait_new_sharding(ServiceKind::Search, vec![2]).await.unwrap_err();
    assert!(err.downcast_ref::<WaitTimeout>().is_some(), "expected WaitTimeout, got {:?}", err);

    node.master.end_migrate().await?;
    fixtures::wait_until("queued write to drain after migration", || {
        let (master, reqlog) = (node.master.clone(), node.reqlog.clone());
        async move {
            master.pending_writes(ServiceKind::Search).await.unwrap_or(usize::MAX) == 0 && reqlog.last_written_id().await.unwrap_or(0) == 1
        }
    })
    .await?;
    Ok(())
}
