//! Write-request pipeline mechanics.
//!
//! Every mutating request is staged through a service-scoped queue of
//! persistent sequential znodes, dispatched by the elected master to the
//! affected shard primaries, prepared and appended into each participant's
//! request log, and committed once every participant acks READY. The master
//! and worker managers drive the protocol; the envelope codec, queue
//! operations and in-flight bookkeeping live here.

#[cfg(test)]
mod mod_test;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::coordination::{CoordinationClient, CreateMode};
use crate::utils;
use shoal_core::namespace::{sequence_of, Namespace, ServiceKind};
use shoal_core::reqtype::WriteReqType;
use shoal_core::znode::{NodeState, ZnodeData, KEY_REQ_DATA, KEY_REQ_INC_ID, KEY_REQ_TYPE};
use shoal_core::{CoordinationError, NodeId, ReplicaId, ShardId};

/// Envelope key flagging a write which belongs to a sharding migration.
const KEY_FOR_MIGRATE: &str = "for_migrate";
/// Envelope key flagging that the pushing node targets itself as well.
const KEY_INCLUDE_SELF: &str = "include_self";

/// The envelope of a write request as staged through the coordination service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteEnvelope {
    pub reqtype: WriteReqType,
    pub payload: Vec<u8>,
    /// The id stamped by the shard primary; `None` until prepared.
    pub inc_id: Option<u32>,
    /// Explicit target shards; empty means derive from the request.
    pub shards: Vec<ShardId>,
    pub for_migrate: bool,
    pub include_self: bool,
}

impl WriteEnvelope {
    pub fn new(reqtype: WriteReqType, payload: Vec<u8>) -> Self {
        Self {
            reqtype,
            payload,
            inc_id: None,
            shards: Vec::new(),
            for_migrate: false,
            include_self: false,
        }
    }

    pub fn with_shards(mut self, shards: Vec<ShardId>, for_migrate: bool, include_self: bool) -> Self {
        self.shards = shards;
        self.for_migrate = for_migrate;
        self.include_self = include_self;
        self
    }

    /// Whether a primary has stamped this envelope with an id.
    pub fn is_stamped(&self) -> bool {
        self.inc_id.is_some()
    }

    /// Encode into a znode payload. The binary request payload rides base64
    /// inside the string-valued codec.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = ZnodeData::new();
        data.set(KEY_REQ_TYPE, self.reqtype.as_str());
        data.set(KEY_REQ_DATA, base64::encode(&self.payload));
        if let Some(inc_id) = self.inc_id {
            data.set(KEY_REQ_INC_ID, inc_id.to_string());
        }
        if !self.shards.is_empty() {
            data.set_shard_ids(&self.shards);
        }
        if self.for_migrate {
            data.set(KEY_FOR_MIGRATE, "1");
        }
        if self.include_self {
            data.set(KEY_INCLUDE_SELF, "1");
        }
        data.encode()
    }

    /// Decode from a znode payload.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let data = ZnodeData::decode(raw).context("error decoding write envelope znode payload")?;
        let reqtype = data
            .req_type()
            .and_then(WriteReqType::parse)
            .context("write envelope does not name a recognized write request type")?;
        let payload = base64::decode(data.req_data().unwrap_or_default()).context("error decoding write envelope payload")?;
        Ok(Self {
            reqtype,
            payload,
            inc_id: data.req_inc_id(),
            shards: data.shard_ids(),
            for_migrate: data.get(KEY_FOR_MIGRATE).is_some(),
            include_self: data.get(KEY_INCLUDE_SELF).is_some(),
        })
    }
}

/// Derive the target shard of a key-targeted request from its payload.
pub fn derive_shard(payload: &[u8], shard_total: u32) -> ShardId {
    crc32fast::hash(payload) % shard_total + 1
}

/// Append a write request to a service's queue, returning the real entry path.
///
/// Ordering across clients is fixed by the coordination service's sequence.
/// Returns once the coordination service acknowledges the creation; execution
/// is not awaited.
pub async fn enqueue(client: &CoordinationClient, ns: &Namespace, service: ServiceKind, envelope: &WriteEnvelope) -> Result<String> {
    client.ensure_path(&ns.write_queue(service)).await.context("error ensuring write queue path")?;
    let real = client
        .create(&ns.write_queue_base(service), envelope.encode(), CreateMode::PersistentSequential)
        .await
        .context("error appending write request to queue")?;
    Ok(real)
}

/// Fetch the head (smallest sequence) of a service's write queue.
pub async fn queue_head(client: &CoordinationClient, ns: &Namespace, service: ServiceKind) -> Result<Option<(String, WriteEnvelope)>> {
    let parent = ns.write_queue(service);
    let children = match client.get_children(&parent).await {
        Ok(children) => children,
        Err(CoordinationError::NoNode(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let head = children.into_iter().filter(|name| sequence_of(name).is_some()).min_by_key(|name| sequence_of(name));
    let name = match head {
        Some(name) => name,
        None => return Ok(None),
    };
    let path = utils::join_path(&parent, &name);
    match client.get_data(&path).await {
        Ok(raw) => Ok(Some((path, WriteEnvelope::decode(&raw)?))),
        // The head was committed and deleted under us.
        Err(CoordinationError::NoNode(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// The number of entries pending in a service's write queue.
pub async fn queue_len(client: &CoordinationClient, ns: &Namespace, service: ServiceKind) -> Result<usize> {
    match client.get_children(&ns.write_queue(service)).await {
        Ok(children) => Ok(children.len()),
        Err(CoordinationError::NoNode(_)) => Ok(0),
        Err(err) => Err(err.into()),
    }
}

/// The per-participant view of an in-flight write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParticipantState {
    /// The prepare notification has been written to the participant's marker.
    Notified,
    /// The participant has entered its execution phase.
    Busy,
    /// The participant committed locally.
    Ready,
    /// The participant failed or demoted itself.
    Failed,
}

/// Bookkeeping for the write currently moving through the two-phase protocol.
#[derive(Debug)]
pub struct InFlightWrite {
    pub service: ServiceKind,
    pub queue_path: String,
    pub envelope: WriteEnvelope,
    pub shards: Vec<ShardId>,
    participants: BTreeMap<(ReplicaId, NodeId), ParticipantState>,
    started: Instant,
}

impl InFlightWrite {
    pub fn new(service: ServiceKind, queue_path: String, envelope: WriteEnvelope, shards: Vec<ShardId>) -> Self {
        Self {
            service,
            queue_path,
            envelope,
            shards,
            participants: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    /// Record that a participant has been handed the prepare notification.
    pub fn add_participant(&mut self, key: (ReplicaId, NodeId)) {
        self.participants.entry(key).or_insert(ParticipantState::Notified);
    }

    pub fn is_participant(&self, key: &(ReplicaId, NodeId)) -> bool {
        self.participants.contains_key(key)
    }

    pub fn participants(&self) -> impl Iterator<Item = &(ReplicaId, NodeId)> {
        self.participants.keys()
    }

    /// Fold an observed node-state transition into the ack bookkeeping.
    ///
    /// READY only counts as an ack once the participant has been seen BUSY;
    /// nodes idle in READY before the protocol starts must not be mistaken
    /// for committed ones.
    pub fn observe_state(&mut self, key: (ReplicaId, NodeId), state: NodeState) {
        let entry = match self.participants.get_mut(&key) {
            Some(entry) => entry,
            None => return,
        };
        match (*entry, state) {
            (ParticipantState::Notified, NodeState::Busy) => *entry = ParticipantState::Busy,
            (ParticipantState::Busy, NodeState::Ready) => *entry = ParticipantState::Ready,
            (_, NodeState::Recovering) | (_, NodeState::Down) => *entry = ParticipantState::Failed,
            _ => (),
        }
    }

    /// Record that a participant disappeared mid-protocol.
    pub fn observe_departure(&mut self, key: (ReplicaId, NodeId)) {
        if let Some(entry) = self.participants.get_mut(&key) {
            *entry = ParticipantState::Failed;
        }
    }

    pub fn all_ready(&self) -> bool {
        !self.participants.is_empty() && self.participants.values().all(|state| *state == ParticipantState::Ready)
    }

    pub fn any_failed(&self) -> bool {
        self.participants.values().any(|state| *state == ParticipantState::Failed)
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.started.elapsed() > timeout
    }
}

/// Assert the migration rendezvous marker for the given shards.
pub async fn assert_migrate_marker(client: &CoordinationClient, ns: &Namespace, shards: &[ShardId]) -> Result<()> {
    client.ensure_path(&ns.synchro()).await.context("error ensuring synchro path")?;
    let mut data = ZnodeData::new();
    data.set_shard_ids(shards);
    client
        .create_or_set(&ns.migrate_marker(), data.encode(), CreateMode::Ephemeral)
        .await
        .context("error asserting migrate marker")?;
    Ok(())
}

/// Clear the migration rendezvous marker.
pub async fn clear_migrate_marker(client: &CoordinationClient, ns: &Namespace) -> Result<()> {
    client.delete_if_exists(&ns.migrate_marker()).await.context("error clearing migrate marker")?;
    Ok(())
}

/// The shards named by the migration marker, if one is asserted.
pub async fn migrate_marker_shards(client: &CoordinationClient, ns: &Namespace) -> Result<Option<Vec<ShardId>>> {
    match client.get_data(&ns.migrate_marker()).await {
        Ok(raw) => {
            let data = ZnodeData::decode(&raw).context("error decoding migrate marker payload")?;
            Ok(Some(data.shard_ids()))
        }
        Err(CoordinationError::NoNode(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
