//! Worker manager.
//!
//! Each node advertises itself under every service topology it participates
//! in, joins its node group's primary election, and executes the worker half
//! of the two-phase write protocol:
//!
//! - as a shard primary it stages prepare notifications from the master,
//!   stamps them through the request log, re-publishes the stamped envelope
//!   for its replicas, and appends locally before handing the request to the
//!   service layer through `prepare_write`/`end_write`;
//! - as a replica it watches its primary's `/WriteRequest` marker, adopts the
//!   stamped id, appends, executes, and acks READY.


use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream, UnboundedReceiverStream};

use crate::aggregator::ServiceHandler;
use crate::config::Config;
use crate::coordination::{CoordinationClient, CoordinationEvent, CreateMode, SessionState};
use crate::pipeline::WriteEnvelope;
use crate::reqlog::{CommonReqData, RequestLogMgr};
use shoal_core::namespace::{sequence_of, Namespace, ServiceKind};
use shoal_core::znode::{NodeState, ZnodeData, KEY_BA_PORT, KEY_DATA_PORT, KEY_MASTER_PORT, KEY_SELF_PRIMARY_PATH, KEY_WORKER_PORT};
use shoal_core::{CoordinationError, LogError};

const METRIC_WORKER_IS_PRIMARY: &str = "shoal_worker_is_primary";
const METRIC_WORKER_WRITES_APPLIED: &str = "shoal_worker_writes_applied";
const METRIC_WORKER_WRITE_FAILURES: &str = "shoal_worker_write_failures";

/// The per-service runtime state of this node.
struct ServiceState {
    /// This node's advertisement znode path.
    node_path: String,
    /// This node's own `/WriteRequest` marker path.
    marker_path: String,
    /// The shared election parent of this node group.
    election_parent: String,
    /// The real path of this node's election child.
    election_path: Option<String>,
    /// Whether this node currently holds the group primary role.
    is_primary: bool,
    /// The `/WriteRequest` marker of the group primary, watched as a replica.
    primary_marker_path: Option<String>,
    /// A prepare notification staged for `prepare_write`.
    staged: Option<WriteEnvelope>,
}

/// A controller executing the worker role of this node.
pub struct WorkerCtl {
    config: Arc<Config>,
    ns: Namespace,
    client: CoordinationClient,
    reqlog: RequestLogMgr,
    handler: Arc<dyn ServiceHandler>,

    /// Coordination events, consumed on this task only.
    events: UnboundedReceiverStream<CoordinationEvent>,
    /// A channel of inbound control requests.
    requests_rx: ReceiverStream<WorkerCtlMsg>,
    /// Notifications that a new queue entry has become processable.
    notice_tx: mpsc::Sender<ServiceKind>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    services: BTreeMap<ServiceKind, ServiceState>,
    node_state: NodeState,
    new_write_disabled: bool,
    /// Whether a write is currently prepared on this node.
    write_prepared: bool,
}

impl WorkerCtl {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, client: CoordinationClient, reqlog: RequestLogMgr, handler: Arc<dyn ServiceHandler>, shutdown: broadcast::Receiver<()>,
    ) -> (Self, Worker, mpsc::Receiver<ServiceKind>) {
        metrics::register_gauge!(METRIC_WORKER_IS_PRIMARY, metrics::Unit::Count, "whether this node holds a shard primary role, 1.0 when primary");
        metrics::register_counter!(METRIC_WORKER_WRITES_APPLIED, metrics::Unit::Count, "write requests applied by this node");
        metrics::register_counter!(METRIC_WORKER_WRITE_FAILURES, metrics::Unit::Count, "write requests which failed to apply on this node");
        let ns = config.namespace();
        let events = UnboundedReceiverStream::new(client.subscribe());
        let (requests_tx, requests_rx) = mpsc::channel(100);
        let (notice_tx, notice_rx) = mpsc::channel(100);
        let services = config
            .service_kinds
            .iter()
            .map(|&service| {
                let node_path = ns.node(service, config.replica_id, config.node_id);
                let state = ServiceState {
                    marker_path: Namespace::write_request_marker(&node_path),
                    election_parent: ns.election_parent(service, config.node_id),
                    node_path,
                    election_path: None,
                    is_primary: false,
                    primary_marker_path: None,
                    staged: None,
                };
                (service, state)
            })
            .collect();
        (
            Self {
                config,
                ns,
                client,
                reqlog,
                handler,
                events,
                requests_rx: ReceiverStream::new(requests_rx),
                notice_tx,
                shutdown_rx: BroadcastStream::new(shutdown),
                services,
                node_state: NodeState::Starting,
                new_write_disabled: false,
                write_prepared: false,
            },
            Worker { tx: requests_tx },
            notice_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(replica_id = self.config.replica_id, node_id = self.config.node_id, "worker manager has started");
        if let Err(err) = self.register().await {
            tracing::error!(error = ?err, "error registering worker in the coordination namespace");
        }

        loop {
            tokio::select! {
                Some(event) = self.events.next() => self.handle_coordination_event(event).await,
                Some(msg) = self.requests_rx.next() => self.handle_ctl_msg(msg).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("worker manager has shutdown");
        Ok(())
    }

    /// Advertise this node and join the primary election of its node group.
    async fn register(&mut self) -> Result<()> {
        let services: Vec<_> = self.services.keys().copied().collect();
        for service in services {
            self.register_service(service).await.with_context(|| format!("error registering worker for service {}", service))?;
        }
        self.update_node_state(NodeState::Ready).await?;
        Ok(())
    }

    async fn register_service(&mut self, service: ServiceKind) -> Result<()> {
        let (node_path, election_parent) = {
            let state = self.services.get(&service).expect("service state must exist");
            (state.node_path.clone(), state.election_parent.clone())
        };
        self.client.ensure_path(&self.ns.replica(service, self.config.replica_id)).await?;
        self.client.create_or_set(&node_path, self.node_payload(None).encode(), CreateMode::Ephemeral).await?;

        // Join the node group's primary election.
        self.client.ensure_path(&election_parent).await?;
        let mut election_payload = ZnodeData::new();
        election_payload.set_replica_id(self.config.replica_id).set_node_id(self.config.node_id).set_host(&self.config.host);
        let election_path = self
            .client
            .create(&self.ns.election_base(service, self.config.node_id), election_payload.encode(), CreateMode::EphemeralSequential)
            .await?;
        self.client
            .set_data(&node_path, self.node_payload(Some(&election_path)).encode())
            .await
            .context("error recording election path in node advertisement")?;
        if let Some(state) = self.services.get_mut(&service) {
            state.election_path = Some(election_path);
        }

        self.evaluate_election(service).await?;
        Ok(())
    }

    /// The advertisement payload of this node.
    fn node_payload(&self, election_path: Option<&str>) -> ZnodeData {
        let mut data = ZnodeData::new();
        data.set_host(&self.config.host)
            .set_port(KEY_BA_PORT, self.config.ba_port)
            .set_port(KEY_DATA_PORT, self.config.data_port)
            .set_port(KEY_WORKER_PORT, self.config.worker_port)
            .set_port(KEY_MASTER_PORT, self.config.master_port)
            .set_replica_id(self.config.replica_id)
            .set_node_id(self.config.node_id)
            .set_shard_ids(&self.config.shards)
            .set_node_state(self.node_state)
            .set_services(self.config.service_kinds.iter().map(|kind| kind.as_str()));
        data.set(shoal_core::znode::KEY_COLLECTION, &self.config.collection);
        if let Some(path) = election_path {
            data.set(KEY_SELF_PRIMARY_PATH, path);
        }
        data
    }

    /// Re-evaluate the primary election of this node's group for a service.
    async fn evaluate_election(&mut self, service: ServiceKind) -> Result<()> {
        let (election_parent, own_election, node_path) = {
            let state = self.services.get(&service).expect("service state must exist");
            (state.election_parent.clone(), state.election_path.clone(), state.node_path.clone())
        };
        let children = match self.client.get_children(&election_parent).await {
            Ok(children) => children,
            Err(CoordinationError::NoNode(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let lowest = children.iter().filter(|name| sequence_of(name).is_some()).min_by_key(|name| sequence_of(name)).cloned();
        let own_name = own_election.as_deref().and_then(|path| path.rsplit('/').next().map(str::to_string));
        let is_primary = match (&lowest, &own_name) {
            (Some(lowest), Some(own)) => lowest == own,
            _ => false,
        };

        let primary_marker_path = if is_primary {
            None
        } else {
            match lowest {
                Some(name) => {
                    let child_path = crate::utils::join_path(&election_parent, &name);
                    match self.client.get_data(&child_path).await {
                        Ok(raw) => ZnodeData::decode(&raw)
                            .ok()
                            .and_then(|data| data.replica_id())
                            .map(|replica_id| Namespace::write_request_marker(&self.ns.node(service, replica_id, self.config.node_id))),
                        Err(CoordinationError::NoNode(_)) => None,
                        Err(err) => return Err(err.into()),
                    }
                }
                None => None,
            }
        };

        let marker = self.ns.primary_marker(service, self.config.replica_id, self.config.node_id);
        let state = self.services.get_mut(&service).expect("service state must exist");
        let was_primary = state.is_primary;
        state.is_primary = is_primary;
        state.primary_marker_path = primary_marker_path;
        if is_primary && !was_primary {
            tracing::info!(service = %service, node = %node_path, "node elected primary for its group");
            self.client.create_or_set(&marker, Vec::new(), CreateMode::Ephemeral).await?;
        } else if !is_primary && was_primary {
            tracing::info!(service = %service, node = %node_path, "node lost the primary role for its group");
            self.client.delete_if_exists(&marker).await?;
        }
        let any_primary = if self.services.values().any(|state| state.is_primary) { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_WORKER_IS_PRIMARY, any_primary);
        Ok(())
    }

    /// Handle a coordination event relevant to this worker.
    #[tracing::instrument(level = "trace", skip(self, event))]
    async fn handle_coordination_event(&mut self, event: CoordinationEvent) {
        let res = match event {
            CoordinationEvent::Session(SessionState::Expired) => self.handle_session_expired().await,
            CoordinationEvent::Session(_) => Ok(()),
            CoordinationEvent::NodeCreated { path, data } | CoordinationEvent::DataChanged { path, data } => self.handle_path_update(path, data).await,
            CoordinationEvent::NodeDeleted(path) => self.handle_path_deleted(path).await,
            CoordinationEvent::ChildrenChanged(path) => self.handle_children_changed(path).await,
        };
        if let Err(err) = res {
            tracing::error!(error = ?err, "error handling coordination event on worker");
        }
    }

    /// All ephemerals are gone; re-establish the session and re-advertise.
    async fn handle_session_expired(&mut self) -> Result<()> {
        tracing::warn!("coordination session expired, re-registering worker");
        for state in self.services.values_mut() {
            state.election_path = None;
            state.is_primary = false;
            state.staged = None;
        }
        if self.write_prepared {
            self.write_prepared = false;
            let _ = self.reqlog.discard_prepared().await;
        }
        self.client.reconnect().await.context("error re-establishing coordination session")?;
        self.register().await
    }

    async fn handle_path_update(&mut self, path: String, data: Vec<u8>) -> Result<()> {
        let own_marker = self.services.iter().find(|(_, state)| state.marker_path == path).map(|(service, _)| *service);
        if let Some(service) = own_marker {
            return self.handle_own_marker_update(service, &data).await;
        }
        let primary_marker = self
            .services
            .iter()
            .find(|(_, state)| state.primary_marker_path.as_deref() == Some(path.as_str()))
            .map(|(service, _)| *service);
        if let Some(service) = primary_marker {
            return self.handle_primary_marker_update(service, &data).await;
        }
        Ok(())
    }

    async fn handle_path_deleted(&mut self, path: String) -> Result<()> {
        // A deleted own marker with nothing prepared is an abort of a staged
        // notification which never reached prepare.
        if let Some(state) = self.services.values_mut().find(|state| state.marker_path == path) {
            if !self.write_prepared && state.staged.take().is_some() {
                tracing::debug!(marker = %path, "staged write notification aborted before prepare");
            }
        }
        Ok(())
    }

    async fn handle_children_changed(&mut self, path: String) -> Result<()> {
        let service = self.services.iter().find(|(_, state)| state.election_parent == path).map(|(service, _)| *service);
        if let Some(service) = service {
            self.evaluate_election(service).await?;
        }
        Ok(())
    }

    /// A prepare notification landed on this node's own marker.
    async fn handle_own_marker_update(&mut self, service: ServiceKind, raw: &[u8]) -> Result<()> {
        if raw.is_empty() {
            return Ok(());
        }
        let envelope = WriteEnvelope::decode(raw)?;
        if envelope.is_stamped() {
            // Our own stamped re-publication; replicas react to it, we do not.
            return Ok(());
        }
        let state = self.services.get_mut(&service).expect("service state must exist");
        if !state.is_primary {
            tracing::warn!(marker = %state.marker_path, "prepare notification received while not primary, ignoring");
            return Ok(());
        }
        state.staged = Some(envelope);
        let _ = self.notice_tx.try_send(service);
        Ok(())
    }

    /// The group primary re-published a stamped envelope; replicate it.
    async fn handle_primary_marker_update(&mut self, service: ServiceKind, raw: &[u8]) -> Result<()> {
        if raw.is_empty() {
            return Ok(());
        }
        let envelope = WriteEnvelope::decode(raw)?;
        let inc_id = match envelope.inc_id {
            Some(inc_id) => inc_id,
            // Unstamped notification; only the primary acts on it.
            None => return Ok(()),
        };

        let mut req = CommonReqData::new(envelope.reqtype.code(), envelope.payload.clone());
        req.inc_id = inc_id;
        match self.reqlog.prepare(req, false).await {
            Ok(_) => (),
            Err(err @ (LogError::Stale { .. } | LogError::AlreadyPrepared)) => {
                tracing::error!(error = %err, service = %service, "replica prepare failed, demoting to recovering");
                self.update_node_state(NodeState::Recovering).await?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        self.update_node_state(NodeState::Busy).await?;
        self.reqlog.append(envelope.payload.clone()).await?;
        let applied = self.apply_via_handler(&envelope).await;
        self.reqlog.discard_prepared().await?;
        match applied {
            Ok(()) => {
                metrics::increment_counter!(METRIC_WORKER_WRITES_APPLIED);
                self.update_node_state(NodeState::Ready).await
            }
            Err(err) => {
                metrics::increment_counter!(METRIC_WORKER_WRITE_FAILURES);
                tracing::error!(error = ?err, service = %service, "replica execution failed, demoting to recovering");
                self.update_node_state(NodeState::Recovering).await
            }
        }
    }

    /// Run the registered service handler on the blocking pool.
    async fn apply_via_handler(&self, envelope: &WriteEnvelope) -> Result<()> {
        let handler = self.handler.clone();
        let (reqtype, payload) = (envelope.reqtype, envelope.payload.clone());
        tokio::task::spawn_blocking(move || handler.apply(reqtype, &payload))
            .await
            .context("error joining service handler task")?
    }

    /// Record a node state transition in every service advertisement.
    async fn update_node_state(&mut self, state: NodeState) -> Result<()> {
        self.node_state = state;
        let paths: Vec<_> = self.services.values().map(|service| (service.node_path.clone(), service.election_path.clone())).collect();
        for (node_path, election_path) in paths {
            let payload = self.node_payload(election_path.as_deref()).encode();
            if let Err(err) = self.client.set_data(&node_path, payload).await {
                if !err.is_transient() {
                    return Err(err).context("error updating node state advertisement");
                }
                tracing::warn!(error = %err, "transient error updating node state advertisement");
            }
        }
        Ok(())
    }

    /// Handle a worker control message.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_ctl_msg(&mut self, msg: WorkerCtlMsg) {
        match msg {
            WorkerCtlMsg::PrepareWrite { service, tx } => {
                let _ = tx.send(self.prepare_write(service).await);
            }
            WorkerCtlMsg::EndWrite { service, tx } => {
                let _ = tx.send(self.end_write(service).await);
            }
            WorkerCtlMsg::AbortWrite { service, tx } => {
                let _ = tx.send(self.abort_write(service).await);
            }
            WorkerCtlMsg::DisableNewWrite { tx } => {
                self.new_write_disabled = true;
                let _ = tx.send(());
            }
            WorkerCtlMsg::EnableNewWrite { tx } => {
                self.new_write_disabled = false;
                let _ = tx.send(());
            }
            WorkerCtlMsg::GetNodeState { tx } => {
                let _ = tx.send(self.node_state);
            }
            WorkerCtlMsg::IsPrimary { service, tx } => {
                let _ = tx.send(self.services.get(&service).map(|state| state.is_primary).unwrap_or(false));
            }
            WorkerCtlMsg::SetReady { tx } => {
                let _ = tx.send(self.update_node_state(NodeState::Ready).await);
            }
        }
    }

    /// Reserve the right to process the staged write notification.
    ///
    /// Stamps the envelope through the request log, re-publishes it for the
    /// group's replicas, and appends locally. At most one write may be
    /// prepared per node at a time.
    async fn prepare_write(&mut self, service: ServiceKind) -> Result<Option<CommonReqData>> {
        if self.new_write_disabled || self.write_prepared {
            return Ok(None);
        }
        let (envelope, marker_path) = {
            let state = match self.services.get_mut(&service) {
                Some(state) if state.is_primary => state,
                _ => return Ok(None),
            };
            let envelope = match state.staged.take() {
                Some(envelope) => envelope,
                None => return Ok(None),
            };
            (envelope, state.marker_path.clone())
        };

        let req = CommonReqData::new(envelope.reqtype.code(), envelope.payload.clone());
        let stamped = self.reqlog.prepare(req, true).await.context("error preparing write through the request log")?;
        let mut stamped_envelope = envelope;
        stamped_envelope.inc_id = Some(stamped.inc_id);
        self.client
            .set_data(&marker_path, stamped_envelope.encode())
            .await
            .context("error re-publishing stamped write envelope")?;
        self.update_node_state(NodeState::Busy).await?;
        self.reqlog.append(stamped.payload.clone()).await.context("error appending prepared write")?;
        self.write_prepared = true;
        Ok(Some(stamped))
    }

    /// Commit local execution of the prepared write.
    async fn end_write(&mut self, service: ServiceKind) -> Result<()> {
        if !self.write_prepared {
            return Ok(());
        }
        self.write_prepared = false;
        self.reqlog.discard_prepared().await?;
        metrics::increment_counter!(METRIC_WORKER_WRITES_APPLIED);
        if let Some(state) = self.services.get(&service) {
            let marker = state.marker_path.clone();
            self.client.delete_if_exists(&marker).await?;
        }
        self.update_node_state(NodeState::Ready).await
    }

    /// Abort local execution of the prepared write and demote this node.
    async fn abort_write(&mut self, service: ServiceKind) -> Result<()> {
        self.write_prepared = false;
        self.reqlog.discard_prepared().await?;
        metrics::increment_counter!(METRIC_WORKER_WRITE_FAILURES);
        if let Some(state) = self.services.get_mut(&service) {
            state.staged = None;
            let marker = state.marker_path.clone();
            self.client.delete_if_exists(&marker).await?;
        }
        self.update_node_state(NodeState::Recovering).await
    }
}

/// A message bound for a worker controller.
pub enum WorkerCtlMsg {
    PrepareWrite {
        service: ServiceKind,
        tx: oneshot::Sender<Result<Option<CommonReqData>>>,
    },
    EndWrite {
        service: ServiceKind,
        tx: oneshot::Sender<Result<()>>,
    },
    AbortWrite {
        service: ServiceKind,
        tx: oneshot::Sender<Result<()>>,
    },
    DisableNewWrite {
        tx: oneshot::Sender<()>,
    },
    EnableNewWrite {
        tx: oneshot::Sender<()>,
    },
    GetNodeState {
        tx: oneshot::Sender<NodeState>,
    },
    IsPrimary {
        service: ServiceKind,
        tx: oneshot::Sender<bool>,
    },
    SetReady {
        tx: oneshot::Sender<Result<()>>,
    },
}

/// A cloneable handle to the worker controller.
#[derive(Clone)]
pub struct Worker {
    tx: mpsc::Sender<WorkerCtlMsg>,
}

impl Worker {
    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> WorkerCtlMsg) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(build(tx)).await.map_err(|_| anyhow!("worker controller has shutdown"))?;
        rx.await.context("worker controller dropped the request")
    }

    /// Reserve the right to process the next staged write, returning its
    /// stamped envelope.
    pub async fn prepare_write(&self, service: ServiceKind) -> Result<Option<CommonReqData>> {
        self.request(|tx| WorkerCtlMsg::PrepareWrite { service, tx }).await?
    }

    /// Commit local execution of the prepared write.
    pub async fn end_write(&self, service: ServiceKind) -> Result<()> {
        self.request(|tx| WorkerCtlMsg::EndWrite { service, tx }).await?
    }

    /// Abort local execution; the node demotes itself to RECOVERING.
    pub async fn abort_write(&self, service: ServiceKind) -> Result<()> {
        self.request(|tx| WorkerCtlMsg::AbortWrite { service, tx }).await?
    }

    /// Gate off new writes, as during migration or graceful shutdown.
    pub async fn disable_new_write(&self) -> Result<()> {
        self.request(|tx| WorkerCtlMsg::DisableNewWrite { tx }).await
    }

    /// Re-enable new writes.
    pub async fn enable_new_write(&self) -> Result<()> {
        self.request(|tx| WorkerCtlMsg::EnableNewWrite { tx }).await
    }

    /// The node state this worker currently advertises.
    pub async fn node_state(&self) -> Result<NodeState> {
        self.request(|tx| WorkerCtlMsg::GetNodeState { tx }).await
    }

    /// Whether this node holds the primary role for the given service.
    pub async fn is_primary(&self, service: ServiceKind) -> Result<bool> {
        self.request(|tx| WorkerCtlMsg::IsPrimary { service, tx }).await
    }

    /// Mark recovery complete, re-advertising READY.
    pub async fn set_ready(&self) -> Result<()> {
        self.request(|tx| WorkerCtlMsg::SetReady { tx }).await?
    }
}
