//! Worker/replica topology tracking.
//!
//! Nodes live in a flat arena keyed by `(replica_id, node_id)`; the worker
//! maps hold arena keys rather than node copies, so an entry disappearing
//! from the arena naturally invalidates every reference to it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Context, Result};

use crate::aggregator::{RouteTable, ShardEndpoint};
use crate::coordination::CoordinationClient;
use shoal_core::namespace::{sequence_of, Namespace, ServiceKind};
use shoal_core::znode::{NodeState, ZnodeData};
use shoal_core::{CoordinationError, NodeId, ReplicaId, ShardId};

/// One live node of the cluster topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterNode {
    pub replica_id: ReplicaId,
    pub node_id: NodeId,
    pub host: String,
    pub ba_port: u16,
    pub data_port: u16,
    pub worker_port: u16,
    pub master_port: u16,
    pub state: NodeState,
    pub shard_ids: Vec<ShardId>,
    pub self_primary_path: Option<String>,
}

impl ClusterNode {
    /// Parse a node from its advertisement payload; `None` for payloads which
    /// do not (yet) describe a usable worker.
    fn from_znode(replica_id: ReplicaId, node_id: NodeId, data: &ZnodeData) -> Option<Self> {
        let host = data.host()?.to_string();
        Some(Self {
            replica_id,
            node_id,
            host,
            ba_port: data.ba_port().unwrap_or(0),
            data_port: data.data_port().unwrap_or(0),
            worker_port: data.worker_port()?,
            master_port: data.master_port().unwrap_or(0),
            state: data.node_state()?,
            shard_ids: data.shard_ids(),
            self_primary_path: data.self_primary_path().map(str::to_string),
        })
    }

    pub fn worker_endpoint(&self) -> ShardEndpoint {
        ShardEndpoint { host: self.host.clone(), port: self.worker_port }
    }
}

/// A snapshot of one service's worker topology.
#[derive(Clone, Debug, Default)]
pub struct TopologyView {
    /// All parsed nodes, keyed by `(replica_id, node_id)`.
    pub arena: HashMap<(ReplicaId, NodeId), ClusterNode>,
    /// The read-write primary for each live shard.
    pub worker_map: BTreeMap<ShardId, (ReplicaId, NodeId)>,
    /// The read-only replicas of each shard, by replica plane.
    pub ro_worker_map: BTreeMap<ShardId, BTreeMap<ReplicaId, (ReplicaId, NodeId)>>,
}

impl TopologyView {
    pub fn node(&self, key: &(ReplicaId, NodeId)) -> Option<&ClusterNode> {
        self.arena.get(key)
    }

    /// The primary node of a shard, if one is live.
    pub fn primary_of(&self, shard: ShardId) -> Option<&ClusterNode> {
        self.worker_map.get(&shard).and_then(|key| self.arena.get(key))
    }

    /// The read-only replicas of a shard.
    pub fn replicas_of(&self, shard: ShardId) -> Vec<(ReplicaId, NodeId)> {
        self.ro_worker_map.get(&shard).map(|entries| entries.values().copied().collect()).unwrap_or_default()
    }

    /// Whether every shard in `1..=shard_total` has a live primary.
    pub fn covers(&self, shard_total: u32) -> bool {
        (1..=shard_total).all(|shard| self.worker_map.contains_key(&shard))
    }

    /// Whether every named shard has a READY primary.
    pub fn all_shards_ready(&self, shards: &[ShardId]) -> bool {
        shards.iter().all(|shard| self.primary_of(*shard).map(|node| node.state == NodeState::Ready).unwrap_or(false))
    }

    /// Whether every named shard has a serviceable primary.
    pub fn all_shards_ok(&self, shards: &[ShardId]) -> bool {
        shards.iter().all(|shard| self.primary_of(*shard).map(|node| node.state.is_serviceable()).unwrap_or(false))
    }

    /// The routing table for read-write aggregators.
    pub fn rw_routes(&self) -> RouteTable {
        self.worker_map
            .iter()
            .filter_map(|(shard, key)| self.arena.get(key).map(|node| (*shard, node.worker_endpoint())))
            .collect()
    }

    /// The routing table for read-only aggregators, preferring the given
    /// replica plane where it holds a copy.
    pub fn ro_routes(&self, prefer_replica: ReplicaId) -> RouteTable {
        self.ro_worker_map
            .iter()
            .filter_map(|(shard, entries)| {
                let key = entries.get(&prefer_replica).or_else(|| entries.values().next())?;
                self.arena.get(key).map(|node| (*shard, node.worker_endpoint()))
            })
            .collect()
    }
}

/// Enumerate a service's topology subtree into a fresh snapshot.
///
/// The node group's election children decide primaries: the lowest-sequence
/// child belonging to a serviceable node wins. Shards with no serviceable
/// election child are left out of the worker map entirely, which is how a
/// DOWN shard surfaces.
pub async fn detect(client: &CoordinationClient, ns: &Namespace, service: ServiceKind) -> Result<TopologyView> {
    let mut view = TopologyView::default();

    let replicas = match client.get_children(&ns.topology(service)).await {
        Ok(children) => children,
        Err(CoordinationError::NoNode(_)) => return Ok(view),
        Err(err) => return Err(err).context("error enumerating topology replicas"),
    };
    for replica_name in replicas {
        let replica_id: ReplicaId = match replica_name.strip_prefix("Replica").and_then(|rest| rest.parse().ok()) {
            Some(id) => id,
            None => continue,
        };
        let nodes = match client.get_children(&ns.replica(service, replica_id)).await {
            Ok(children) => children,
            Err(CoordinationError::NoNode(_)) => continue,
            Err(err) => return Err(err).context("error enumerating replica nodes"),
        };
        for node_name in nodes {
            let node_id: NodeId = match node_name.strip_prefix("Node").and_then(|rest| rest.parse().ok()) {
                Some(id) => id,
                None => continue,
            };
            let raw = match client.get_data(&ns.node(service, replica_id, node_id)).await {
                Ok(raw) => raw,
                Err(CoordinationError::NoNode(_)) => continue,
                Err(err) => return Err(err).context("error reading node advertisement"),
            };
            let data = match ZnodeData::decode(&raw) {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(error = ?err, replica_id, node_id, "skipping node with malformed advertisement");
                    continue;
                }
            };
            if let Some(node) = ClusterNode::from_znode(replica_id, node_id, &data) {
                view.arena.insert((replica_id, node_id), node);
            }
        }
    }

    // Resolve the group primary for every node group present in the arena.
    let group_ids: BTreeSet<NodeId> = view.arena.keys().map(|(_, node_id)| *node_id).collect();
    for node_id in group_ids {
        let children = match client.get_children(&ns.election_parent(service, node_id)).await {
            Ok(children) => children,
            Err(CoordinationError::NoNode(_)) => continue,
            Err(err) => return Err(err).context("error enumerating election children"),
        };
        let mut ordered: Vec<_> = children.into_iter().filter(|name| sequence_of(name).is_some()).collect();
        ordered.sort_by_key(|name| sequence_of(name));

        let mut primary: Option<(ReplicaId, NodeId)> = None;
        for child in ordered {
            let child_path = crate::utils::join_path(&ns.election_parent(service, node_id), &child);
            let raw = match client.get_data(&child_path).await {
                Ok(raw) => raw,
                Err(CoordinationError::NoNode(_)) => continue,
                Err(err) => return Err(err).context("error reading election child"),
            };
            let replica_id = match ZnodeData::decode(&raw).ok().and_then(|data| data.replica_id()) {
                Some(id) => id,
                None => continue,
            };
            let key = (replica_id, node_id);
            if view.arena.get(&key).map(|node| node.state.is_serviceable()).unwrap_or(false) {
                primary = Some(key);
                break;
            }
        }
        let primary = match primary {
            Some(primary) => primary,
            None => continue,
        };

        let shard_ids = view.arena.get(&primary).map(|node| node.shard_ids.clone()).unwrap_or_default();
        for shard in shard_ids {
            view.worker_map.insert(shard, primary);
        }
    }

    // Every serviceable non-primary copy of a shard is a read-only worker.
    let entries: Vec<_> = view.arena.iter().map(|(key, node)| (*key, node.state, node.shard_ids.clone())).collect();
    for (key, state, shard_ids) in entries {
        if !state.is_serviceable() {
            continue;
        }
        for shard in shard_ids {
            if view.worker_map.get(&shard) == Some(&key) {
                continue;
            }
            view.ro_worker_map.entry(shard).or_default().insert(key.0, key);
        }
    }

    Ok(view)
}
