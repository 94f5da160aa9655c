//! Capability seams consumed from the surrounding system.

use std::collections::BTreeMap;

use shoal_core::namespace::ServiceKind;
use shoal_core::reqtype::WriteReqType;
use shoal_core::ShardId;

/// A worker endpoint an aggregator routes shard traffic to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardEndpoint {
    pub host: String,
    pub port: u16,
}

/// The routing table handed to aggregators: one worker endpoint per live shard.
pub type RouteTable = BTreeMap<ShardId, ShardEndpoint>;

/// A routing component which fans queries out to shard workers.
///
/// The transport behind `reset` is external; the master only reconciles the
/// table as topology changes.
pub trait AggregatorRouter: Send + Sync + 'static {
    /// The service whose topology this aggregator routes for.
    fn service(&self) -> ServiceKind;

    /// Replace the aggregator's routing table.
    fn reset(&self, routes: &RouteTable);
}

/// The service-side executor of write requests.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Apply a write request to local state.
    fn apply(&self, reqtype: WriteReqType, payload: &[u8]) -> anyhow::Result<()>;
}
