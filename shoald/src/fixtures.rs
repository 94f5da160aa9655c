use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;

use crate::aggregator::{AggregatorRouter, RouteTable, ServiceHandler};
use crate::config::Config;
use crate::coordination::{CoordinationClient, MemoryCoordination};
use crate::master::{Master, MasterCtl};
use crate::reqlog::RequestLogMgr;
use crate::worker::{Worker, WorkerCtl};
use shoal_core::namespace::ServiceKind;
use shoal_core::reqtype::WriteReqType;
use shoal_core::{NodeId, ReplicaId};

/// An aggregator which records the routing tables handed to it.
pub struct RecordingRouter {
    service: ServiceKind,
    routes: Mutex<Option<RouteTable>>,
}

impl RecordingRouter {
    pub fn new(service: ServiceKind) -> Arc<Self> {
        Arc::new(Self { service, routes: Mutex::new(None) })
    }

    /// The last routing table this aggregator was reconciled to.
    pub fn routes(&self) -> Option<RouteTable> {
        self.routes.lock().expect("routes lock poisoned").clone()
    }
}

impl AggregatorRouter for RecordingRouter {
    fn service(&self) -> ServiceKind {
        self.service
    }

    fn reset(&self, routes: &RouteTable) {
        *self.routes.lock().expect("routes lock poisoned") = Some(routes.clone());
    }
}

/// A service handler which acknowledges everything.
pub struct NoopHandler;

impl ServiceHandler for NoopHandler {
    fn apply(&self, _reqtype: WriteReqType, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// A service handler which fails everything.
pub struct FailingHandler;

impl ServiceHandler for FailingHandler {
    fn apply(&self, reqtype: WriteReqType, _payload: &[u8]) -> Result<()> {
        bail!("handler failure requested for {}", reqtype)
    }
}

/// One fully wired node running against a shared in-memory coordination
/// service: worker manager, master manager, and the service execution loop.
pub struct TestNode {
    pub config: Arc<Config>,
    pub client: CoordinationClient,
    pub worker: Worker,
    pub master: Master,
    pub reqlog: RequestLogMgr,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Spawn a node for the given cluster identity.
pub async fn spawn_node(
    coordination: &MemoryCoordination, tmpdir: &tempfile::TempDir, replica_id: ReplicaId, node_id: NodeId, shard_ids: &str, shard_total: u32,
    handler: Arc<dyn ServiceHandler>,
) -> Result<TestNode> {
    let config = Config::new_test_node(tmpdir, replica_id, node_id, shard_ids, shard_total)?;
    let client = coordination.connect();
    client.ensure_path(config.namespace().root()).await?;
    let reqlog = RequestLogMgr::open(config.reqlog_path()).await?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let (worker_ctl, worker, notice_rx) = WorkerCtl::new(config.clone(), client.clone(), reqlog.clone(), handler.clone(), shutdown_tx.subscribe());
    let _worker_handle = worker_ctl.spawn();
    let (master_ctl, master) = MasterCtl::new(config.clone(), client.clone(), shutdown_tx.subscribe());
    let _master_handle = master_ctl.spawn();
    let _service_loop = crate::app::spawn_service_loop(worker.clone(), handler, notice_rx, shutdown_tx.subscribe());

    Ok(TestNode {
        config,
        client,
        worker,
        master,
        reqlog,
        shutdown_tx,
    })
}

/// Poll the given condition until it holds, failing after a few seconds.
pub async fn wait_until<F, Fut>(what: &str, mut cond: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if cond().await {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            bail!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Read and decode a node's advertisement payload.
pub async fn node_payload(client: &CoordinationClient, path: &str) -> Result<shoal_core::znode::ZnodeData> {
    let raw = client.get_data(path).await.context("error reading node advertisement")?;
    shoal_core::znode::ZnodeData::decode(&raw)
}
