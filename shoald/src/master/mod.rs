//! Master manager.
//!
//! Supervises the sharded/replicated worker topology of every service this
//! node participates in and drives the cluster-wide write-request pipeline.
//! All state mutation happens on this controller task; coordination events
//! and control requests arrive over channels and are folded in one at a time.

pub mod registry;
pub mod topology;

#[cfg(test)]
mod mod_test;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream, UnboundedReceiverStream};

use crate::aggregator::AggregatorRouter;
use crate::config::Config;
use crate::coordination::{CoordinationClient, CoordinationEvent, CreateMode, SessionState};
use crate::pipeline::{self, InFlightWrite, WriteEnvelope};
use shoal_core::namespace::{Namespace, ServiceKind};
use shoal_core::reqtype::WriteReqType;
use shoal_core::znode::ZnodeData;
use shoal_core::{ShardId, WaitTimeout};

const METRIC_MASTER_STATE: &str = "shoal_master_state";
const METRIC_MASTER_IS_ELECTED: &str = "shoal_master_is_elected";
const METRIC_MASTER_FAILOVERS: &str = "shoal_master_num_failovers";
const METRIC_WRITES_DISPATCHED: &str = "shoal_master_writes_dispatched";
const METRIC_WRITES_COMMITTED: &str = "shoal_master_writes_committed";
const METRIC_WRITES_ABORTED: &str = "shoal_master_writes_aborted";

/// The interval at which in-flight writes are checked for expiry.
const IN_FLIGHT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// The lifecycle state of the master manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MasterState {
    Init,
    Starting,
    StartingWaitZk,
    StartingWaitWorkers,
    Started,
}

impl MasterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Starting => "starting",
            Self::StartingWaitZk => "starting_wait_zk",
            Self::StartingWaitWorkers => "starting_wait_workers",
            Self::Started => "started",
        }
    }

    fn as_metric(&self) -> f64 {
        match self {
            Self::Init => 0.0,
            Self::Starting => 1.0,
            Self::StartingWaitZk => 2.0,
            Self::StartingWaitWorkers => 3.0,
            Self::Started => 4.0,
        }
    }
}

/// A predicate a caller is waiting on the topology to satisfy.
#[derive(Clone, Debug)]
pub enum WaitPredicate {
    /// Every named shard has a READY primary.
    ShardsReady(Vec<ShardId>),
    /// Every named shard is registered with a live primary.
    ShardsRegistered(Vec<ShardId>),
}

struct TopologyWaiter {
    service: ServiceKind,
    predicate: WaitPredicate,
    tx: oneshot::Sender<()>,
}

/// A controller executing the master role of this node.
pub struct MasterCtl {
    config: Arc<Config>,
    ns: Namespace,
    client: CoordinationClient,

    /// Coordination events, consumed on this task only.
    events: UnboundedReceiverStream<CoordinationEvent>,
    /// A channel of inbound control requests.
    requests_rx: ReceiverStream<MasterCtlMsg>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    state: MasterState,
    topologies: BTreeMap<ServiceKind, topology::TopologyView>,
    rw_aggregators: Vec<Arc<dyn AggregatorRouter>>,
    ro_aggregators: Vec<Arc<dyn AggregatorRouter>>,

    /// Own server registrations, by service.
    server_paths: BTreeMap<ServiceKind, String>,
    /// The predecessor registration each service watches for deletion.
    predecessors: BTreeMap<ServiceKind, Option<String>>,
    /// Whether this node is the elected master, by service.
    elected: BTreeMap<ServiceKind, bool>,

    /// The write currently moving through the two-phase protocol, by service.
    in_flight: BTreeMap<ServiceKind, InFlightWrite>,
    new_write_disabled: bool,
    waiters: Vec<TopologyWaiter>,
}

impl MasterCtl {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, client: CoordinationClient, shutdown: broadcast::Receiver<()>) -> (Self, Master) {
        metrics::register_gauge!(METRIC_MASTER_STATE, metrics::Unit::Count, "the lifecycle state of the master manager");
        metrics::register_gauge!(METRIC_MASTER_IS_ELECTED, metrics::Unit::Count, "whether this node is an elected service master, 1.0 when elected");
        metrics::register_counter!(METRIC_MASTER_FAILOVERS, metrics::Unit::Count, "shard primary fail-overs observed by this master");
        metrics::register_counter!(METRIC_WRITES_DISPATCHED, metrics::Unit::Count, "write requests dispatched into the two-phase protocol");
        metrics::register_counter!(METRIC_WRITES_COMMITTED, metrics::Unit::Count, "write requests committed across all participants");
        metrics::register_counter!(METRIC_WRITES_ABORTED, metrics::Unit::Count, "write requests aborted mid-protocol");
        let ns = config.namespace();
        let events = UnboundedReceiverStream::new(client.subscribe());
        let (requests_tx, requests_rx) = mpsc::channel(100);
        let master = Master {
            tx: requests_tx,
            client: client.clone(),
            ns: ns.clone(),
            config: config.clone(),
        };
        (
            Self {
                config,
                ns,
                client,
                events,
                requests_rx: ReceiverStream::new(requests_rx),
                shutdown_rx: BroadcastStream::new(shutdown),
                state: MasterState::Init,
                topologies: BTreeMap::new(),
                rw_aggregators: Vec::new(),
                ro_aggregators: Vec::new(),
                server_paths: BTreeMap::new(),
                predecessors: BTreeMap::new(),
                elected: BTreeMap::new(),
                in_flight: BTreeMap::new(),
                new_write_disabled: false,
                waiters: Vec::new(),
            },
            master,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("master manager has started");
        if let Err(err) = self.do_start().await {
            tracing::error!(error = ?err, "error during master startup");
        }

        let mut check_timer = tokio::time::interval(IN_FLIGHT_CHECK_INTERVAL);
        loop {
            tokio::select! {
                Some(event) = self.events.next() => self.handle_coordination_event(event).await,
                Some(msg) = self.requests_rx.next() => self.handle_ctl_msg(msg).await,
                _ = check_timer.tick() => self.check_in_flight_expiry().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Abort anything still in flight and drop the server registrations so
        // a successor can take over immediately.
        let services: Vec<_> = self.in_flight.keys().copied().collect();
        for service in services {
            if let Err(err) = self.abort_in_flight(service).await {
                tracing::error!(error = ?err, "error aborting in-flight write during shutdown");
            }
        }
        for path in self.server_paths.values() {
            if let Err(err) = registry::unregister_server(&self.client, path).await {
                tracing::error!(error = ?err, "error unregistering master server during shutdown");
            }
        }
        tracing::debug!("master manager has shutdown");
        Ok(())
    }

    fn set_state(&mut self, state: MasterState) {
        if self.state != state {
            tracing::info!(from = self.state.as_str(), to = state.as_str(), "master state transition");
            self.state = state;
            metrics::gauge!(METRIC_MASTER_STATE, state.as_metric());
        }
    }

    /// Drive startup as far as current conditions allow.
    async fn do_start(&mut self) -> Result<()> {
        self.set_state(MasterState::Starting);
        if !self.client.is_connected() {
            self.set_state(MasterState::StartingWaitZk);
            return Ok(());
        }
        self.detect_all().await?;
        if !self.all_services_covered() {
            self.set_state(MasterState::StartingWaitWorkers);
            return Ok(());
        }
        self.enter_started().await
    }

    /// All conditions hold; register the service endpoints and go live.
    async fn enter_started(&mut self) -> Result<()> {
        let service_kinds = self.config.service_kinds.clone();
        for &service in service_kinds.iter() {
            if !self.server_paths.contains_key(&service) {
                let real_path = registry::register_server(&self.client, &self.ns, service, &self.config).await?;
                tracing::info!(service = %service, path = %real_path, "registered master server endpoint");
                self.server_paths.insert(service, real_path);
            }
            self.evaluate_elected(service).await?;
        }
        self.set_state(MasterState::Started);
        self.try_dispatch_all().await;
        Ok(())
    }

    fn all_services_covered(&self) -> bool {
        self.config
            .service_kinds
            .iter()
            .all(|service| self.topologies.get(service).map(|view| view.covers(self.config.shard_total)).unwrap_or(false))
    }

    /// Re-enumerate every service topology.
    async fn detect_all(&mut self) -> Result<()> {
        for &service in self.config.service_kinds.clone().iter() {
            self.detect_service(service).await?;
        }
        Ok(())
    }

    /// Re-enumerate one service's topology, logging fail-over and recovery
    /// transitions and reconciling aggregator routing.
    async fn detect_service(&mut self, service: ServiceKind) -> Result<()> {
        let view = topology::detect(&self.client, &self.ns, service).await?;
        let old = self.topologies.insert(service, view);

        let view = self.topologies.get(&service).expect("topology just inserted");
        if let Some(old) = old {
            for (shard, old_key) in old.worker_map.iter() {
                match view.worker_map.get(shard) {
                    None => {
                        metrics::increment_counter!(METRIC_MASTER_FAILOVERS);
                        tracing::warn!(service = %service, shard, "shard lost its last serviceable replica, marking down");
                    }
                    Some(new_key) if new_key != old_key => {
                        metrics::increment_counter!(METRIC_MASTER_FAILOVERS);
                        tracing::warn!(
                            service = %service, shard,
                            from = ?old_key, to = ?new_key,
                            "shard primary failed over",
                        );
                    }
                    Some(_) => (),
                }
            }
            for shard in view.worker_map.keys() {
                if !old.worker_map.contains_key(shard) {
                    tracing::info!(service = %service, shard, "shard recovered a serviceable primary");
                }
            }
        }

        self.reconcile_aggregators(service);
        self.satisfy_waiters();

        // Topology movement may change the lifecycle state in either direction.
        match self.state {
            MasterState::Started if !self.all_services_covered() => self.set_state(MasterState::StartingWaitWorkers),
            MasterState::StartingWaitWorkers if self.all_services_covered() => self.enter_started().await?,
            _ => (),
        }
        Ok(())
    }

    /// Push fresh routing tables into every registered aggregator.
    fn reconcile_aggregators(&self, service: ServiceKind) {
        let view = match self.topologies.get(&service) {
            Some(view) => view,
            None => return,
        };
        let rw_routes = view.rw_routes();
        for aggregator in self.rw_aggregators.iter().filter(|agg| agg.service() == service) {
            aggregator.reset(&rw_routes);
        }
        let ro_routes = view.ro_routes(self.config.replica_id);
        for aggregator in self.ro_aggregators.iter().filter(|agg| agg.service() == service) {
            aggregator.reset(&ro_routes);
        }
    }

    /// Resolve topology waiters whose predicate now holds.
    fn satisfy_waiters(&mut self) {
        let topologies = &self.topologies;
        self.waiters.retain_mut(|waiter| {
            let view = match topologies.get(&waiter.service) {
                Some(view) => view,
                None => return true,
            };
            let satisfied = match &waiter.predicate {
                WaitPredicate::ShardsReady(shards) => view.all_shards_ready(shards),
                WaitPredicate::ShardsRegistered(shards) => shards.iter().all(|shard| view.worker_map.contains_key(shard)),
            };
            if satisfied {
                // The waiter may have timed out and dropped the receiver.
                let (tx, _) = oneshot::channel();
                let waiter_tx = std::mem::replace(&mut waiter.tx, tx);
                let _ = waiter_tx.send(());
            }
            !satisfied
        });
    }

    /// Re-evaluate whether this node is the elected master for a service.
    async fn evaluate_elected(&mut self, service: ServiceKind) -> Result<()> {
        let elected_path = registry::elected_server(&self.client, &self.ns, service).await?;
        let own_path = self.server_paths.get(&service);
        let is_elected = matches!((elected_path.as_ref(), own_path), (Some(elected), Some(own)) if elected == own);
        let was_elected = self.elected.insert(service, is_elected).unwrap_or(false);
        if is_elected != was_elected {
            tracing::info!(service = %service, elected = is_elected, "master election outcome changed");
        }
        let any_elected = if self.elected.values().any(|e| *e) { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_MASTER_IS_ELECTED, any_elected);

        let predecessor = match own_path {
            Some(own) => registry::predecessor_of(&self.client, &self.ns, service, own).await?,
            None => None,
        };
        self.predecessors.insert(service, predecessor);
        if is_elected {
            self.try_dispatch(service).await;
        }
        Ok(())
    }

    /// Handle a coordination event relevant to this master.
    #[tracing::instrument(level = "trace", skip(self, event))]
    async fn handle_coordination_event(&mut self, event: CoordinationEvent) {
        let res = match event {
            CoordinationEvent::Session(SessionState::Disconnected) => {
                tracing::warn!("coordination connection lost, waiting for the session to re-establish");
                self.set_state(MasterState::StartingWaitZk);
                Ok(())
            }
            CoordinationEvent::Session(SessionState::Connected) => {
                if self.state == MasterState::StartingWaitZk {
                    self.do_start().await
                } else {
                    Ok(())
                }
            }
            CoordinationEvent::Session(SessionState::Expired) => self.handle_session_expired().await,
            CoordinationEvent::NodeCreated { path, data } | CoordinationEvent::DataChanged { path, data } => self.handle_path_update(path, data).await,
            CoordinationEvent::NodeDeleted(path) => self.handle_path_deleted(path).await,
            CoordinationEvent::ChildrenChanged(path) => self.handle_children_changed(path).await,
        };
        if let Err(err) = res {
            tracing::error!(error = ?err, "error handling coordination event on master");
        }
    }

    /// The session expired: every ephemeral this master owned is gone,
    /// including its server registrations. Start over.
    async fn handle_session_expired(&mut self) -> Result<()> {
        tracing::warn!("coordination session expired, restarting master manager");
        self.server_paths.clear();
        self.predecessors.clear();
        self.elected.clear();
        metrics::gauge!(METRIC_MASTER_IS_ELECTED, 0.0);
        let services: Vec<_> = self.in_flight.keys().copied().collect();
        for service in services {
            self.in_flight.remove(&service);
        }
        self.client.reconnect().await.context("error re-establishing coordination session")?;
        self.do_start().await
    }

    async fn handle_path_update(&mut self, path: String, data: Vec<u8>) -> Result<()> {
        for &service in self.config.service_kinds.clone().iter() {
            if self.ns.is_topology_path(service, &path) {
                // Fold node state movement into in-flight ack tracking before
                // rebuilding the topology snapshot. The event-time payload is
                // authoritative: reading the znode now could already show a
                // later transition and swallow the BUSY edge.
                if let Some(key) = self.ns.parse_node(service, &path) {
                    if path == self.ns.node(service, key.0, key.1) {
                        self.observe_participant(service, key, &data).await?;
                    }
                }
                self.detect_service(service).await?;
                self.try_dispatch(service).await;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn handle_path_deleted(&mut self, path: String) -> Result<()> {
        for &service in self.config.service_kinds.clone().iter() {
            if self.ns.is_topology_path(service, &path) {
                if let Some(key) = self.ns.parse_node(service, &path) {
                    // Only a departed node advertisement fails a participant;
                    // marker deletions are part of the normal commit path.
                    if path == self.ns.node(service, key.0, key.1) {
                        if let Some(in_flight) = self.in_flight.get_mut(&service) {
                            in_flight.observe_departure(key);
                        }
                        self.check_in_flight(service).await?;
                    }
                }
                self.detect_service(service).await?;
                return Ok(());
            }
            let is_predecessor = self.predecessors.get(&service).map(|p| p.as_deref() == Some(path.as_str())).unwrap_or(false);
            if is_predecessor || path.starts_with(&self.ns.servers(service)) {
                self.evaluate_elected(service).await?;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn handle_children_changed(&mut self, path: String) -> Result<()> {
        for &service in self.config.service_kinds.clone().iter() {
            if path == self.ns.write_queue(service) {
                self.try_dispatch(service).await;
                return Ok(());
            }
            if self.ns.is_topology_path(service, &path) || path.starts_with(&self.ns.primary_nodes(service)) {
                self.detect_service(service).await?;
                self.try_dispatch(service).await;
                return Ok(());
            }
            if path == self.ns.servers(service) {
                self.evaluate_elected(service).await?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Fold a participant's advertised node state into the in-flight write.
    async fn observe_participant(&mut self, service: ServiceKind, key: (u32, u32), raw: &[u8]) -> Result<()> {
        let has_in_flight = self.in_flight.get(&service).map(|in_flight| in_flight.is_participant(&key)).unwrap_or(false);
        if !has_in_flight {
            return Ok(());
        }
        let state = ZnodeData::decode(raw).ok().and_then(|data| data.node_state());
        if let (Some(state), Some(in_flight)) = (state, self.in_flight.get_mut(&service)) {
            in_flight.observe_state(key, state);
        }
        self.check_in_flight(service).await
    }

    /// Commit or abort the in-flight write if its outcome is decided.
    async fn check_in_flight(&mut self, service: ServiceKind) -> Result<()> {
        let (all_ready, any_failed) = match self.in_flight.get(&service) {
            Some(in_flight) => (in_flight.all_ready(), in_flight.any_failed()),
            None => return Ok(()),
        };
        if any_failed {
            self.abort_in_flight(service).await?;
            return Ok(());
        }
        if all_ready {
            self.commit_in_flight(service).await?;
        }
        Ok(())
    }

    /// All participants acked READY: drop the queue entry and move on.
    async fn commit_in_flight(&mut self, service: ServiceKind) -> Result<()> {
        let in_flight = match self.in_flight.remove(&service) {
            Some(in_flight) => in_flight,
            None => return Ok(()),
        };
        self.client.delete_if_exists(&in_flight.queue_path).await.context("error deleting committed queue entry")?;
        metrics::increment_counter!(METRIC_WRITES_COMMITTED);
        tracing::debug!(service = %service, queue_entry = %in_flight.queue_path, "write request committed");
        self.try_dispatch(service).await;
        Ok(())
    }

    /// Abort the in-flight write: signal every participant to discard its
    /// prepared slot by dropping the prepare markers.
    ///
    /// The queue entry stays in place for the next elected master to replay,
    /// unless the request type is not replay-safe, in which case partial
    /// execution can not be reconciled and the entry is dropped.
    async fn abort_in_flight(&mut self, service: ServiceKind) -> Result<()> {
        let in_flight = match self.in_flight.remove(&service) {
            Some(in_flight) => in_flight,
            None => return Ok(()),
        };
        metrics::increment_counter!(METRIC_WRITES_ABORTED);
        tracing::warn!(service = %service, queue_entry = %in_flight.queue_path, "aborting in-flight write request");
        for &(replica_id, node_id) in in_flight.participants() {
            let marker = Namespace::write_request_marker(&self.ns.node(service, replica_id, node_id));
            if let Err(err) = self.client.delete_if_exists(&marker).await {
                tracing::error!(error = %err, marker = %marker, "error dropping prepare marker during abort");
            }
        }
        if !in_flight.envelope.reqtype.is_replay_safe() {
            self.client.delete_if_exists(&in_flight.queue_path).await.context("error deleting non-replayable queue entry")?;
        }
        Ok(())
    }

    /// Abort in-flight writes which have outlived the configured window.
    async fn check_in_flight_expiry(&mut self) {
        let timeout = Duration::from_secs(self.config.write_timeout_secs);
        let expired: Vec<_> = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.is_expired(timeout))
            .map(|(service, _)| *service)
            .collect();
        for service in expired {
            tracing::warn!(service = %service, "in-flight write expired without full acknowledgement");
            if let Err(err) = self.abort_in_flight(service).await {
                tracing::error!(error = ?err, "error aborting expired in-flight write");
            }
        }
    }

    async fn try_dispatch_all(&mut self) {
        for &service in self.config.service_kinds.clone().iter() {
            self.try_dispatch(service).await;
        }
    }

    /// Dispatch the queue head into the two-phase protocol, when possible.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn try_dispatch(&mut self, service: ServiceKind) {
        if let Err(err) = self.try_dispatch_inner(service).await {
            tracing::error!(error = ?err, service = %service, "error dispatching write request");
        }
    }

    async fn try_dispatch_inner(&mut self, service: ServiceKind) -> Result<()> {
        if self.state != MasterState::Started
            || self.new_write_disabled
            || !self.elected.get(&service).copied().unwrap_or(false)
            || self.in_flight.contains_key(&service)
        {
            return Ok(());
        }
        let (queue_path, envelope) = match pipeline::queue_head(&self.client, &self.ns, service).await? {
            Some(head) => head,
            None => return Ok(()),
        };

        let view = match self.topologies.get(&service) {
            Some(view) => view,
            None => return Ok(()),
        };
        let mut shards: Vec<ShardId> = if envelope.reqtype.is_auto_shard() {
            view.worker_map.keys().copied().collect()
        } else if !envelope.shards.is_empty() {
            envelope.shards.clone()
        } else {
            vec![pipeline::derive_shard(&envelope.payload, self.config.shard_total)]
        };
        // Explicitly targeted pushes exclude the pushing node unless asked.
        if !envelope.shards.is_empty() && !envelope.include_self {
            let own = (self.config.replica_id, self.config.node_id);
            shards.retain(|shard| view.worker_map.get(shard) != Some(&own));
        }
        if shards.is_empty() {
            // Nothing to execute; drop the entry rather than wedge the queue.
            self.client.delete_if_exists(&queue_path).await?;
            return Ok(());
        }
        if !view.all_shards_ok(&shards) {
            tracing::debug!(service = %service, ?shards, "holding queue head until all target shards are serviceable");
            return Ok(());
        }

        // Writes for shards under migration are queued, not executed, unless
        // they belong to the migration itself.
        if !envelope.for_migrate {
            if let Some(migrating) = pipeline::migrate_marker_shards(&self.client, &self.ns).await? {
                if shards.iter().any(|shard| migrating.contains(shard)) {
                    tracing::debug!(service = %service, "holding queue head while its shards are under migration");
                    return Ok(());
                }
            }
        }

        let mut in_flight = InFlightWrite::new(service, queue_path, envelope.clone(), shards.clone());
        let mut markers = Vec::new();
        for &shard in shards.iter() {
            let primary = view.primary_of(shard).context("target shard lost its primary mid-dispatch")?;
            in_flight.add_participant((primary.replica_id, primary.node_id));
            markers.push(Namespace::write_request_marker(&self.ns.node(service, primary.replica_id, primary.node_id)));
            for key in view.replicas_of(shard) {
                in_flight.add_participant(key);
            }
        }
        markers.sort();
        markers.dedup();
        for marker in markers {
            self.client
                .create_or_set(&marker, envelope.encode(), CreateMode::Ephemeral)
                .await
                .context("error writing prepare notification marker")?;
        }
        metrics::increment_counter!(METRIC_WRITES_DISPATCHED);
        tracing::debug!(service = %service, queue_entry = %in_flight.queue_path, ?shards, "dispatched write request to shard primaries");
        self.in_flight.insert(service, in_flight);
        Ok(())
    }

    /// Handle a master control message.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_ctl_msg(&mut self, msg: MasterCtlMsg) {
        match msg {
            MasterCtlMsg::RegisterAggregator { aggregator, readonly } => {
                let service = aggregator.service();
                if readonly {
                    self.ro_aggregators.push(aggregator);
                } else {
                    self.rw_aggregators.push(aggregator);
                }
                self.reconcile_aggregators(service);
            }
            MasterCtlMsg::GetState { tx } => {
                let _ = tx.send(self.state);
            }
            MasterCtlMsg::IsElected { service, tx } => {
                let _ = tx.send(self.elected.get(&service).copied().unwrap_or(false));
            }
            MasterCtlMsg::DisableNewWrite { tx } => {
                self.new_write_disabled = true;
                let _ = tx.send(());
            }
            MasterCtlMsg::EnableNewWrite { tx } => {
                self.new_write_disabled = false;
                let _ = tx.send(());
                self.try_dispatch_all().await;
            }
            MasterCtlMsg::BeginMigrate { shards, tx } => {
                self.new_write_disabled = true;
                let res = pipeline::assert_migrate_marker(&self.client, &self.ns, &shards).await;
                let _ = tx.send(res);
            }
            MasterCtlMsg::EndMigrate { tx } => {
                let res = pipeline::clear_migrate_marker(&self.client, &self.ns).await;
                self.new_write_disabled = false;
                let _ = tx.send(res);
                self.try_dispatch_all().await;
            }
            MasterCtlMsg::ShardReceiver { service, shard, tx } => {
                let receiver = self
                    .topologies
                    .get(&service)
                    .and_then(|view| view.primary_of(shard))
                    .map(|node| (node.host.clone(), node.data_port));
                let _ = tx.send(receiver);
            }
            MasterCtlMsg::WaitTopology { service, predicate, tx } => {
                let satisfied = self.topologies.get(&service).map(|view| match &predicate {
                    WaitPredicate::ShardsReady(shards) => view.all_shards_ready(shards),
                    WaitPredicate::ShardsRegistered(shards) => shards.iter().all(|shard| view.worker_map.contains_key(shard)),
                });
                if satisfied.unwrap_or(false) {
                    let _ = tx.send(());
                } else {
                    self.waiters.push(TopologyWaiter { service, predicate, tx });
                }
            }
        }
    }
}

/// A message bound for a master controller.
pub enum MasterCtlMsg {
    RegisterAggregator {
        aggregator: Arc<dyn AggregatorRouter>,
        readonly: bool,
    },
    GetState {
        tx: oneshot::Sender<MasterState>,
    },
    IsElected {
        service: ServiceKind,
        tx: oneshot::Sender<bool>,
    },
    DisableNewWrite {
        tx: oneshot::Sender<()>,
    },
    EnableNewWrite {
        tx: oneshot::Sender<()>,
    },
    BeginMigrate {
        shards: Vec<ShardId>,
        tx: oneshot::Sender<Result<()>>,
    },
    EndMigrate {
        tx: oneshot::Sender<Result<()>>,
    },
    ShardReceiver {
        service: ServiceKind,
        shard: ShardId,
        tx: oneshot::Sender<Option<(String, u16)>>,
    },
    WaitTopology {
        service: ServiceKind,
        predicate: WaitPredicate,
        tx: oneshot::Sender<()>,
    },
}

/// A cloneable handle to the master controller.
#[derive(Clone)]
pub struct Master {
    tx: mpsc::Sender<MasterCtlMsg>,
    client: CoordinationClient,
    ns: Namespace,
    config: Arc<Config>,
}

impl Master {
    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> MasterCtlMsg) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(build(tx)).await.map_err(|_| anyhow!("master controller has shutdown"))?;
        rx.await.context("master controller dropped the request")
    }

    /// Register an aggregator for topology reconciliation.
    pub async fn register_aggregator(&self, aggregator: Arc<dyn AggregatorRouter>, readonly: bool) -> Result<()> {
        self.tx
            .send(MasterCtlMsg::RegisterAggregator { aggregator, readonly })
            .await
            .map_err(|_| anyhow!("master controller has shutdown"))
    }

    /// Append a write request to the service's global queue.
    ///
    /// Returns once the coordination service acknowledges the entry; the
    /// request executes asynchronously through the two-phase protocol.
    pub async fn push_write(&self, service: ServiceKind, reqtype: WriteReqType, payload: Vec<u8>) -> Result<String> {
        let envelope = WriteEnvelope::new(reqtype, payload);
        pipeline::enqueue(&self.client, &self.ns, service, &envelope).await
    }

    /// Append a write request targeted at a specific shard subset.
    pub async fn push_write_to_shards(
        &self, service: ServiceKind, reqtype: WriteReqType, payload: Vec<u8>, shards: Vec<ShardId>, for_migrate: bool, include_self: bool,
    ) -> Result<String> {
        let envelope = WriteEnvelope::new(reqtype, payload).with_shards(shards, for_migrate, include_self);
        pipeline::enqueue(&self.client, &self.ns, service, &envelope).await
    }

    /// The number of write requests pending in a service's queue.
    pub async fn pending_writes(&self, service: ServiceKind) -> Result<usize> {
        pipeline::queue_len(&self.client, &self.ns, service).await
    }

    /// The current lifecycle state of the master manager.
    pub async fn state(&self) -> Result<MasterState> {
        self.request(|tx| MasterCtlMsg::GetState { tx }).await
    }

    /// Whether this node is the elected master for the given service.
    pub async fn is_elected(&self, service: ServiceKind) -> Result<bool> {
        self.request(|tx| MasterCtlMsg::IsElected { service, tx }).await
    }

    /// Discover the advertised endpoint of a service's elected master.
    pub async fn find_service_master(&self, service: ServiceKind) -> Result<Option<(String, u16)>> {
        registry::find_service_master(&self.client, &self.ns, service).await
    }

    /// The bulk-data receiver address of a shard's primary, if one is live.
    pub async fn shard_receiver(&self, service: ServiceKind, shard: ShardId) -> Result<Option<(String, u16)>> {
        self.request(|tx| MasterCtlMsg::ShardReceiver { service, shard, tx }).await
    }

    /// Gate off dispatch of new writes.
    pub async fn disable_new_write(&self) -> Result<()> {
        self.request(|tx| MasterCtlMsg::DisableNewWrite { tx }).await
    }

    /// Re-enable dispatch of new writes.
    pub async fn enable_new_write(&self) -> Result<()> {
        self.request(|tx| MasterCtlMsg::EnableNewWrite { tx }).await
    }

    /// Begin a sharding migration: writes for the named shards are queued,
    /// not executed, until `end_migrate`.
    pub async fn begin_migrate(&self, shards: Vec<ShardId>) -> Result<()> {
        self.request(|tx| MasterCtlMsg::BeginMigrate { shards, tx }).await?
    }

    /// Block until every named shard reports READY under its new identity.
    pub async fn wait_migrate_ready(&self, service: ServiceKind, shards: Vec<ShardId>) -> Result<()> {
        self.wait_topology(service, WaitPredicate::ShardsReady(shards), "migrate ready").await
    }

    /// Block until the new shard set is fully registered.
    pub async fn wait_new_sharding(&self, service: ServiceKind, shards: Vec<ShardId>) -> Result<()> {
        self.wait_topology(service, WaitPredicate::ShardsRegistered(shards), "new sharding").await
    }

    /// Clear migration markers and re-enable writes.
    pub async fn end_migrate(&self) -> Result<()> {
        self.request(|tx| MasterCtlMsg::EndMigrate { tx }).await?
    }

    async fn wait_topology(&self, service: ServiceKind, predicate: WaitPredicate, label: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(MasterCtlMsg::WaitTopology { service, predicate, tx })
            .await
            .map_err(|_| anyhow!("master controller has shutdown"))?;
        let timeout = Duration::from_secs(self.config.migrate_timeout_secs);
        match tokio::time::timeout(timeout, rx).await {
            Ok(res) => res.context("master controller dropped the wait"),
            Err(_) => Err(WaitTimeout(label.to_string()).into()),
        }
    }
}
