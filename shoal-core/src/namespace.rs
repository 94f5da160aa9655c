//! The coordination namespace.
//!
//! Pure naming convention over the coordination service's hierarchical key
//! space. Every path in the cluster derives from one configured cluster root.

use std::fmt;

use crate::{NodeId, ReplicaId};

/// A named role set a node may offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceKind {
    Search,
    Recommend,
}

/// All services recognized by the platform.
pub const ALL_SERVICES: &[ServiceKind] = &[ServiceKind::Search, ServiceKind::Recommend];

impl ServiceKind {
    /// The path prefix used in the coordination namespace.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Search => "Search",
            Self::Recommend => "Recommend",
        }
    }

    /// The lower-case configuration name of this service.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Recommend => "recommend",
        }
    }

    /// Resolve a service from its configuration name.
    pub fn parse(val: &str) -> Option<Self> {
        match val {
            "search" => Some(Self::Search),
            "recommend" => Some(Self::Recommend),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Path constructors rooted at a configured cluster root.
#[derive(Clone, Debug)]
pub struct Namespace {
    root: String,
}

impl Namespace {
    /// Create a namespace over the given cluster root name.
    pub fn new(root: &str) -> Self {
        let trimmed = root.trim_matches('/');
        Self { root: format!("/{}", trimmed) }
    }

    /// The cluster root path.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// `<root>/<Service>Topology`
    pub fn topology(&self, service: ServiceKind) -> String {
        format!("{}/{}Topology", self.root, service.prefix())
    }

    /// `<root>/<Service>Topology/Replica{r}`
    pub fn replica(&self, service: ServiceKind, replica_id: ReplicaId) -> String {
        format!("{}/Replica{}", self.topology(service), replica_id)
    }

    /// `<root>/<Service>Topology/Replica{r}/Node{n}`
    pub fn node(&self, service: ServiceKind, replica_id: ReplicaId, node_id: NodeId) -> String {
        format!("{}/Node{}", self.replica(service, replica_id), node_id)
    }

    /// The marker a node group's current primary holds under its own node path.
    pub fn primary_marker(&self, service: ServiceKind, replica_id: ReplicaId, node_id: NodeId) -> String {
        format!("{}/Primary", self.node(service, replica_id, node_id))
    }

    /// `<root>/<Service>PrimaryNodes`
    pub fn primary_nodes(&self, service: ServiceKind) -> String {
        format!("{}/{}PrimaryNodes", self.root, service.prefix())
    }

    /// The shared election parent of a node group.
    ///
    /// Nodes with the same node id across every replica plane compete here;
    /// the lowest-sequence child is the group primary.
    pub fn election_parent(&self, service: ServiceKind, node_id: NodeId) -> String {
        format!("{}/Node{}", self.primary_nodes(service), node_id)
    }

    /// The base name for a node group's sequential election children.
    pub fn election_base(&self, service: ServiceKind, node_id: NodeId) -> String {
        format!("{}/Node{}_", self.election_parent(service, node_id), node_id)
    }

    /// `<root>/<Service>Servers`
    pub fn servers(&self, service: ServiceKind) -> String {
        format!("{}/{}Servers", self.root, service.prefix())
    }

    /// The base name for sequential master server registrations.
    pub fn server_base(&self, service: ServiceKind) -> String {
        format!("{}/Server", self.servers(service))
    }

    /// `<root>/<Service>WriteRequestQueue`
    pub fn write_queue(&self, service: ServiceKind) -> String {
        format!("{}/{}WriteRequestQueue", self.root, service.prefix())
    }

    /// The base name for sequential write-request queue entries.
    pub fn write_queue_base(&self, service: ServiceKind) -> String {
        format!("{}/WriteRequestSeq", self.write_queue(service))
    }

    /// The prepared-write marker under a node path.
    pub fn write_request_marker(node_path: &str) -> String {
        format!("{}/WriteRequest", node_path)
    }

    /// `<root>/Synchro`
    pub fn synchro(&self) -> String {
        format!("{}/Synchro", self.root)
    }

    /// The rendezvous marker asserted while a sharding migration is underway.
    pub fn migrate_marker(&self) -> String {
        format!("{}/MigrateSharding", self.synchro())
    }

    /// Parse `(replica_id, node_id)` out of any path at or below a node path
    /// for the given service.
    pub fn parse_node(&self, service: ServiceKind, path: &str) -> Option<(ReplicaId, NodeId)> {
        let rest = path.strip_prefix(&self.topology(service))?;
        let mut segments = rest.split('/').filter(|seg| !seg.is_empty());
        let replica_id = segments.next()?.strip_prefix("Replica")?.parse().ok()?;
        let node_id = segments.next()?.strip_prefix("Node")?.parse().ok()?;
        Some((replica_id, node_id))
    }

    /// Whether the given path falls under the topology subtree of a service.
    pub fn is_topology_path(&self, service: ServiceKind, path: &str) -> bool {
        path.starts_with(&self.topology(service))
    }
}

/// Extract the 10-digit sequence number appended to a sequential znode name.
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < 10 {
        return None;
    }
    let (_, suffix) = name.split_at(name.len() - 10);
    if suffix.bytes().all(|b| b.is_ascii_digit()) {
        suffix.parse().ok()
    } else {
        None
    }
}
