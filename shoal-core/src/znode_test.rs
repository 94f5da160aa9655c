use anyhow::Result;
use rand::prelude::*;

use crate::znode::{NodeState, ZnodeData, KEY_NODE_STATE, KEY_WORKER_PORT};

#[test]
fn empty_payload_decodes_to_empty_mapping() -> Result<()> {
    let data = ZnodeData::decode(b"")?;
    assert!(data.is_empty(), "expected empty mapping from empty payload");
    assert!(data.encode().is_empty(), "expected empty mapping to encode to an empty payload");
    Ok(())
}

#[test]
fn codec_round_trip_generated_mappings() -> Result<()> {
    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let mut data = ZnodeData::new();
        for _ in 0..rng.gen_range(1..20) {
            let key: String = (0..rng.gen_range(1..16)).map(|_| rng.gen_range(b'a'..=b'z') as char).collect();
            let val: String = (0..rng.gen_range(0..32)).map(|_| rng.gen_range(b' '..=b'~') as char).collect();
            data.set(key, val);
        }
        let decoded = ZnodeData::decode(&data.encode())?;
        assert_eq!(decoded, data, "mapping failed to round-trip through the codec");
    }
    Ok(())
}

#[test]
fn unknown_keys_round_trip() -> Result<()> {
    let mut data = ZnodeData::new();
    data.set("some_future_key", "opaque-value");
    data.set_host("10.0.0.1");
    let decoded = ZnodeData::decode(&data.encode())?;
    assert_eq!(decoded.get("some_future_key"), Some("opaque-value"));
    assert_eq!(decoded.host(), Some("10.0.0.1"));
    Ok(())
}

#[test]
fn typed_accessors() -> Result<()> {
    let mut data = ZnodeData::new();
    data.set_host("worker-1")
        .set_port(KEY_WORKER_PORT, 18151)
        .set_replica_id(2)
        .set_node_id(3)
        .set_shard_ids(&[1, 3, 5])
        .set_node_state(NodeState::Ready)
        .set_services(["search", "recommend"]);

    let decoded = ZnodeData::decode(&data.encode())?;
    assert_eq!(decoded.host(), Some("worker-1"));
    assert_eq!(decoded.worker_port(), Some(18151));
    assert_eq!(decoded.replica_id(), Some(2));
    assert_eq!(decoded.node_id(), Some(3));
    assert_eq!(decoded.shard_ids(), vec![1, 3, 5]);
    assert_eq!(decoded.node_state(), Some(NodeState::Ready));
    assert_eq!(decoded.services(), vec!["search", "recommend"]);
    Ok(())
}

#[test]
fn node_state_string_forms() {
    for state in [
        NodeState::Starting,
        NodeState::Ready,
        NodeState::Busy,
        NodeState::Electing,
        NodeState::Recovering,
        NodeState::Down,
    ] {
        assert_eq!(NodeState::parse(state.as_str()), Some(state), "state {} failed to round-trip", state);
    }
    assert_eq!(NodeState::parse("unknown"), None);
    assert!(NodeState::Ready.is_serviceable());
    assert!(NodeState::Busy.is_serviceable());
    assert!(!NodeState::Recovering.is_serviceable());
}

#[test]
fn malformed_payload_is_an_error() {
    let mut data = ZnodeData::new();
    data.set(KEY_NODE_STATE, "ready");
    let mut raw = data.encode();
    raw.truncate(raw.len() - 1);
    assert!(ZnodeData::decode(&raw).is_err(), "expected truncated payload to fail decoding");
}
