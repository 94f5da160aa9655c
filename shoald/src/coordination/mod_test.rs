use anyhow::Result;

use crate::coordination::{CoordinationEvent, CreateMode, MemoryCoordination, SessionState};
use shoal_core::CoordinationError;

#[tokio::test]
async fn create_get_set_delete_round_trip() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let client = coordination.connect();

    client.ensure_path("/shoal-test/SearchTopology").await?;
    let path = client.create("/shoal-test/SearchTopology/Replica1", b"hello".to_vec(), CreateMode::Persistent).await?;
    assert_eq!(path, "/shoal-test/SearchTopology/Replica1");
    assert_eq!(client.get_data(&path).await?, b"hello".to_vec());

    client.set_data(&path, b"world".to_vec()).await?;
    assert_eq!(client.get_data(&path).await?, b"world".to_vec());

    client.delete(&path).await?;
    assert!(!client.exists(&path).await?, "expected deleted znode to be absent");
    assert!(matches!(client.get_data(&path).await, Err(CoordinationError::NoNode(_))));
    Ok(())
}

#[tokio::test]
async fn create_requires_parent() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let client = coordination.connect();
    let res = client.create("/shoal-test/Missing/Node1", vec![], CreateMode::Persistent).await;
    assert!(matches!(res, Err(CoordinationError::NoNode(_))), "expected create under missing parent to fail, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn sequential_children_are_ordered() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let client = coordination.connect();
    client.ensure_path("/shoal-test/SearchWriteRequestQueue").await?;

    let first = client
        .create("/shoal-test/SearchWriteRequestQueue/WriteRequestSeq", b"a".to_vec(), CreateMode::PersistentSequential)
        .await?;
    let second = client
        .create("/shoal-test/SearchWriteRequestQueue/WriteRequestSeq", b"b".to_vec(), CreateMode::PersistentSequential)
        .await?;
    assert_eq!(first, "/shoal-test/SearchWriteRequestQueue/WriteRequestSeq0000000000");
    assert_eq!(second, "/shoal-test/SearchWriteRequestQueue/WriteRequestSeq0000000001");

    let children = client.get_children("/shoal-test/SearchWriteRequestQueue").await?;
    assert_eq!(children, vec!["WriteRequestSeq0000000000".to_string(), "WriteRequestSeq0000000001".to_string()]);
    Ok(())
}

#[tokio::test]
async fn children_are_direct_only() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let client = coordination.connect();
    client.ensure_path("/shoal-test/SearchTopology/Replica1/Node1").await?;
    client.ensure_path("/shoal-test/SearchTopology/Replica2").await?;

    let children = client.get_children("/shoal-test/SearchTopology").await?;
    assert_eq!(children, vec!["Replica1".to_string(), "Replica2".to_string()]);
    Ok(())
}

#[tokio::test]
async fn delete_with_children_is_rejected() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let client = coordination.connect();
    client.ensure_path("/shoal-test/Synchro/MigrateSharding").await?;
    let res = client.delete("/shoal-test/Synchro").await;
    assert!(matches!(res, Err(CoordinationError::NotEmpty(_))), "expected delete of non-empty znode to fail, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn session_expiry_drops_ephemerals_and_notifies() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let owner = coordination.connect();
    let observer = coordination.connect();
    let mut owner_events = owner.subscribe();
    let mut observer_events = observer.subscribe();

    owner.ensure_path("/shoal-test/SearchServers").await?;
    let real = owner.create("/shoal-test/SearchServers/Server", vec![], CreateMode::EphemeralSequential).await?;
    assert!(observer.exists(&real).await?);

    // Drain the creation events from the observer feed.
    while let Ok(event) = observer_events.try_recv() {
        drop(event);
    }

    coordination.expire_session(&owner);
    assert_eq!(owner.session_state(), SessionState::Expired);
    assert!(matches!(owner.exists(&real).await, Err(CoordinationError::SessionExpired)));
    assert!(!observer.exists(&real).await?, "expected ephemeral to be dropped on expiry");

    let mut saw_delete = false;
    while let Ok(event) = observer_events.try_recv() {
        if event == CoordinationEvent::NodeDeleted(real.clone()) {
            saw_delete = true;
        }
    }
    assert!(saw_delete, "expected observer to see the ephemeral deletion");

    let mut saw_expired = false;
    while let Ok(event) = owner_events.try_recv() {
        if event == CoordinationEvent::Session(SessionState::Expired) {
            saw_expired = true;
        }
    }
    assert!(saw_expired, "expected owner to observe its session expiry");
    Ok(())
}

#[tokio::test]
async fn disconnect_fails_operations_transiently() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let client = coordination.connect();
    client.ensure_path("/shoal-test").await?;

    coordination.set_connected(false);
    assert_eq!(client.session_state(), SessionState::Disconnected);
    let res = client.exists("/shoal-test").await;
    match res {
        Err(err) => assert!(err.is_transient(), "expected transient error, got {:?}", err),
        Ok(_) => panic!("expected operation to fail while disconnected"),
    }

    coordination.set_connected(true);
    assert!(client.exists("/shoal-test").await?, "expected operation to succeed after reconnect");
    Ok(())
}

#[tokio::test]
async fn create_or_set_replaces_existing_data() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let client = coordination.connect();
    client.ensure_path("/shoal-test/Node1").await?;

    client.create_or_set("/shoal-test/Node1/WriteRequest", b"one".to_vec(), CreateMode::Ephemeral).await?;
    client.create_or_set("/shoal-test/Node1/WriteRequest", b"two".to_vec(), CreateMode::Ephemeral).await?;
    assert_eq!(client.get_data("/shoal-test/Node1/WriteRequest").await?, b"two".to_vec());
    Ok(())
}
