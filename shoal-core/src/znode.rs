//! Typed key/value payloads stored in coordination znodes.
//!
//! Payloads are a flat `string → string` mapping serialized as a JSON object.
//! The encoding is stable (keys are ordered) and self-delimiting, unknown
//! keys round-trip untouched, and an empty payload decodes to an empty
//! mapping.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};

use crate::{NodeId, ReplicaId, ShardId};

// Recognized payload keys.
pub const KEY_USERNAME: &str = "username";
pub const KEY_HOST: &str = "host";
pub const KEY_BA_PORT: &str = "baport";
pub const KEY_DATA_PORT: &str = "dataport";
pub const KEY_MASTER_PORT: &str = "masterport";
pub const KEY_WORKER_PORT: &str = "workerport";
pub const KEY_REPLICA_ID: &str = "replicaid";
pub const KEY_NODE_ID: &str = "nodeid";
pub const KEY_SHARD_IDS: &str = "shardids";
pub const KEY_COLLECTION: &str = "collection";
pub const KEY_SERVICE: &str = "service";
pub const KEY_NODE_STATE: &str = "nodestate";
pub const KEY_SELF_PRIMARY_PATH: &str = "self_primary_nodepath";
pub const KEY_MASTER_SERVER_REAL_PATH: &str = "master_server_realpath";
pub const KEY_REQ_DATA: &str = "req_data";
pub const KEY_REQ_TYPE: &str = "req_type";
pub const KEY_REQ_INC_ID: &str = "req_inc_id";

/// The lifecycle state a node advertises in its znode payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    Ready,
    Busy,
    Electing,
    Recovering,
    Down,
}

impl NodeState {
    /// The stable string form written into znode payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Electing => "electing",
            Self::Recovering => "recovering",
            Self::Down => "down",
        }
    }

    /// Resolve a state from its string form.
    pub fn parse(val: &str) -> Option<Self> {
        match val {
            "starting" => Some(Self::Starting),
            "ready" => Some(Self::Ready),
            "busy" => Some(Self::Busy),
            "electing" => Some(Self::Electing),
            "recovering" => Some(Self::Recovering),
            "down" => Some(Self::Down),
            _ => None,
        }
    }

    /// Whether a node in this state may serve as a write primary.
    pub fn is_serviceable(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The decoded payload of a coordination znode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ZnodeData {
    entries: BTreeMap<String, String>,
}

impl ZnodeData {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a payload from raw znode bytes. An empty buffer is an empty
    /// mapping.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let entries: BTreeMap<String, String> = serde_json::from_slice(raw).context("error decoding znode payload")?;
        Ok(Self { entries })
    }

    /// Encode this payload into raw znode bytes.
    pub fn encode(&self) -> Vec<u8> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        // Serializing a string map is infallible.
        serde_json::to_vec(&self.entries).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, val: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), val.into());
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|val| val.parse().ok())
    }

    fn get_u16(&self, key: &str) -> Option<u16> {
        self.get(key).and_then(|val| val.parse().ok())
    }

    pub fn host(&self) -> Option<&str> {
        self.get(KEY_HOST)
    }

    pub fn set_host(&mut self, host: &str) -> &mut Self {
        self.set(KEY_HOST, host)
    }

    pub fn ba_port(&self) -> Option<u16> {
        self.get_u16(KEY_BA_PORT)
    }

    pub fn data_port(&self) -> Option<u16> {
        self.get_u16(KEY_DATA_PORT)
    }

    pub fn worker_port(&self) -> Option<u16> {
        self.get_u16(KEY_WORKER_PORT)
    }

    pub fn master_port(&self) -> Option<u16> {
        self.get_u16(KEY_MASTER_PORT)
    }

    pub fn set_port(&mut self, key: &str, port: u16) -> &mut Self {
        self.set(key, port.to_string())
    }

    pub fn replica_id(&self) -> Option<ReplicaId> {
        self.get_u32(KEY_REPLICA_ID)
    }

    pub fn set_replica_id(&mut self, id: ReplicaId) -> &mut Self {
        self.set(KEY_REPLICA_ID, id.to_string())
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.get_u32(KEY_NODE_ID)
    }

    pub fn set_node_id(&mut self, id: NodeId) -> &mut Self {
        self.set(KEY_NODE_ID, id.to_string())
    }

    /// The shards hosted by this node, encoded as a comma-separated list.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.get(KEY_SHARD_IDS)
            .map(|val| val.split(',').filter_map(|part| part.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    pub fn set_shard_ids(&mut self, shards: &[ShardId]) -> &mut Self {
        let val = shards.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
        self.set(KEY_SHARD_IDS, val)
    }

    pub fn node_state(&self) -> Option<NodeState> {
        self.get(KEY_NODE_STATE).and_then(NodeState::parse)
    }

    pub fn set_node_state(&mut self, state: NodeState) -> &mut Self {
        self.set(KEY_NODE_STATE, state.as_str())
    }

    pub fn self_primary_path(&self) -> Option<&str> {
        self.get(KEY_SELF_PRIMARY_PATH)
    }

    pub fn master_server_real_path(&self) -> Option<&str> {
        self.get(KEY_MASTER_SERVER_REAL_PATH)
    }

    pub fn req_data(&self) -> Option<&str> {
        self.get(KEY_REQ_DATA)
    }

    pub fn req_type(&self) -> Option<&str> {
        self.get(KEY_REQ_TYPE)
    }

    pub fn req_inc_id(&self) -> Option<u32> {
        self.get_u32(KEY_REQ_INC_ID)
    }

    /// The services this node participates in, comma-separated.
    pub fn services(&self) -> Vec<&str> {
        self.get(KEY_SERVICE).map(|val| val.split(',').filter(|s| !s.is_empty()).collect()).unwrap_or_default()
    }

    pub fn set_services<'a>(&mut self, services: impl IntoIterator<Item = &'a str>) -> &mut Self {
        let val = services.into_iter().collect::<Vec<_>>().join(",");
        self.set(KEY_SERVICE, val)
    }
}
