use anyhow::Result;

use super::{derive_shard, InFlightWrite, WriteEnvelope};
use crate::coordination::MemoryCoordination;
use crate::pipeline;
use shoal_core::namespace::{Namespace, ServiceKind};
use shoal_core::reqtype::WriteReqType;
use shoal_core::znode::NodeState;

#[test]
fn envelope_round_trip() -> Result<()> {
    let mut envelope = WriteEnvelope::new(WriteReqType::DocumentsCreate, b"\x00\x01binary payload\xff".to_vec());
    envelope.inc_id = Some(42);
    let envelope = envelope.with_shards(vec![1, 3], true, true);

    let decoded = WriteEnvelope::decode(&envelope.encode())?;
    assert_eq!(decoded, envelope, "envelope failed to round-trip through the znode codec");
    Ok(())
}

#[test]
fn unstamped_envelope_round_trip() -> Result<()> {
    let envelope = WriteEnvelope::new(WriteReqType::RecommendAddUser, b"user-1".to_vec());
    assert!(!envelope.is_stamped());
    let decoded = WriteEnvelope::decode(&envelope.encode())?;
    assert_eq!(decoded.inc_id, None);
    assert!(decoded.shards.is_empty());
    assert!(!decoded.for_migrate && !decoded.include_self);
    Ok(())
}

#[test]
fn envelope_rejects_non_write_actions() {
    let mut data = shoal_core::znode::ZnodeData::new();
    data.set(shoal_core::znode::KEY_REQ_TYPE, "documents_search");
    assert!(WriteEnvelope::decode(&data.encode()).is_err(), "expected read action to be rejected");
}

#[test]
fn derived_shards_stay_in_range() {
    for payload in [b"a".as_ref(), b"doc-123", b"", b"another key"] {
        for total in [1u32, 2, 5, 16] {
            let shard = derive_shard(payload, total);
            assert!((1..=total).contains(&shard), "derived shard {} outside 1..={}", shard, total);
        }
    }
}

#[tokio::test]
async fn queue_preserves_enqueue_order() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let client = coordination.connect();
    let ns = Namespace::new("shoal-test");

    let first = WriteEnvelope::new(WriteReqType::DocumentsCreate, b"first".to_vec());
    let second = WriteEnvelope::new(WriteReqType::DocumentsUpdate, b"second".to_vec());
    pipeline::enqueue(&client, &ns, ServiceKind::Search, &first).await?;
    pipeline::enqueue(&client, &ns, ServiceKind::Search, &second).await?;
    assert_eq!(pipeline::queue_len(&client, &ns, ServiceKind::Search).await?, 2);

    let (head_path, head) = pipeline::queue_head(&client, &ns, ServiceKind::Search).await?.expect("expected queue head");
    assert_eq!(head.payload, b"first".to_vec(), "queue head must be the smallest sequence");

    client.delete(&head_path).await?;
    let (_, next) = pipeline::queue_head(&client, &ns, ServiceKind::Search).await?.expect("expected next queue head");
    assert_eq!(next.payload, b"second".to_vec());
    Ok(())
}

#[tokio::test]
async fn empty_queue_has_no_head() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let client = coordination.connect();
    let ns = Namespace::new("shoal-test");
    assert!(pipeline::queue_head(&client, &ns, ServiceKind::Recommend).await?.is_none());
    assert_eq!(pipeline::queue_len(&client, &ns, ServiceKind::Recommend).await?, 0);
    Ok(())
}

#[test]
fn in_flight_acks_require_busy_before_ready() {
    let envelope = WriteEnvelope::new(WriteReqType::DocumentsCreate, b"payload".to_vec());
    let mut in_flight = InFlightWrite::new(ServiceKind::Search, "/q/WriteRequestSeq0000000000".into(), envelope, vec![1]);
    in_flight.add_participant((1, 1));
    in_flight.add_participant((2, 1));

    // A participant idling in READY is not an ack.
    in_flight.observe_state((1, 1), NodeState::Ready);
    assert!(!in_flight.all_ready());

    in_flight.observe_state((1, 1), NodeState::Busy);
    in_flight.observe_state((1, 1), NodeState::Ready);
    assert!(!in_flight.all_ready(), "one participant still outstanding");

    in_flight.observe_state((2, 1), NodeState::Busy);
    in_flight.observe_state((2, 1), NodeState::Ready);
    assert!(in_flight.all_ready());
    assert!(!in_flight.any_failed());
}

#[test]
fn in_flight_failure_paths() {
    let envelope = WriteEnvelope::new(WriteReqType::DocumentsCreate, b"payload".to_vec());
    let mut in_flight = InFlightWrite::new(ServiceKind::Search, "/q/WriteRequestSeq0000000000".into(), envelope, vec![1]);
    in_flight.add_participant((1, 1));
    in_flight.add_participant((2, 1));

    in_flight.observe_state((1, 1), NodeState::Recovering);
    assert!(in_flight.any_failed(), "RECOVERING must surface as a failed participant");

    let envelope = WriteEnvelope::new(WriteReqType::DocumentsCreate, b"payload".to_vec());
    let mut in_flight = InFlightWrite::new(ServiceKind::Search, "/q/WriteRequestSeq0000000001".into(), envelope, vec![1]);
    in_flight.add_participant((1, 1));
    in_flight.observe_departure((1, 1));
    assert!(in_flight.any_failed(), "a departed participant must surface as failed");
}

#[tokio::test]
async fn migrate_marker_round_trip() -> Result<()> {
    let coordination = MemoryCoordination::new();
    let client = coordination.connect();
    let ns = Namespace::new("shoal-test");

    assert_eq!(pipeline::migrate_marker_shards(&client, &ns).await?, None);
    pipeline::assert_migrate_marker(&client, &ns, &[2, 4]).await?;
    assert_eq!(pipeline::migrate_marker_shards(&client, &ns).await?, Some(vec![2, 4]));
    pipeline::clear_migrate_marker(&client, &ns).await?;
    assert_eq!(pipeline::migrate_marker_shards(&client, &ns).await?, None);
    Ok(())
}
