use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::aggregator::ServiceHandler;
use crate::config::Config;
use crate::coordination::MemoryCoordination;
use crate::database::Database;
use crate::master::{Master, MasterCtl};
use crate::reqlog::RequestLogMgr;
use crate::worker::{Worker, WorkerCtl};
use shoal_core::namespace::ServiceKind;
use shoal_core::prom::spawn_proc_metrics_sampler;
use shoal_core::reqtype::WriteReqType;

/// The application object for when Shoal is running as a node daemon.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,
    /// The worker role handle of this node.
    worker: Worker,
    /// The master role handle of this node, when enabled.
    master: Option<Master>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the worker manager.
    worker_handle: JoinHandle<Result<()>>,
    /// The join handle of the master manager, when enabled.
    master_handle: Option<JoinHandle<Result<()>>>,
    /// The join handle of the service execution loop.
    service_loop: JoinHandle<()>,
}

impl App {
    /// Create a new instance.
    ///
    /// The database handle is shared with the caller: sled holds an exclusive
    /// lock on its path, so every component of the process works through the
    /// one handle.
    pub async fn new(config: Arc<Config>, db: Database, handler: Arc<dyn ServiceHandler>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let reqlog = RequestLogMgr::open(config.reqlog_path()).await.context("error opening request log")?;

        // Establish the coordination session. The embedded service backs
        // single-process deployments; an ensemble transport plugs in through
        // the same seam.
        let coordination = MemoryCoordination::new();
        let client = coordination.connect();
        client
            .ensure_path(config.namespace().root())
            .await
            .context("error ensuring cluster root in the coordination namespace")?;

        // Spawn the core controllers.
        let (worker_ctl, worker, notice_rx) = WorkerCtl::new(config.clone(), client.clone(), reqlog, handler.clone(), shutdown_tx.subscribe());
        let worker_handle = worker_ctl.spawn();

        let (master, master_handle) = if config.enable_master {
            let (master_ctl, master) = MasterCtl::new(config.clone(), client, shutdown_tx.subscribe());
            (Some(master), Some(master_ctl.spawn()))
        } else {
            (None, None)
        };

        let service_loop = spawn_service_loop(worker.clone(), handler, notice_rx, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _db: db,
            worker,
            master,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            worker_handle,
            master_handle,
            service_loop,
        })
    }

    /// The worker role handle of this node.
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// The master role handle of this node, when enabled.
    pub fn master(&self) -> Option<&Master> {
        self.master.as_ref()
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
        let mut sampler_shutdown = self.shutdown_tx.subscribe();
        let sampler = spawn_proc_metrics_sampler(async move {
            let _res = sampler_shutdown.recv().await;
        });

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Shoal is shutting down");
        if let Err(err) = self.worker_handle.await.context("error joining worker manager handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down worker manager");
        }
        if let Some(master_handle) = self.master_handle {
            if let Err(err) = master_handle.await.context("error joining master manager handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down master manager");
            }
        }
        if let Err(err) = self.service_loop.await {
            tracing::error!(error = ?err, "error joining service execution loop");
        }
        if let Err(err) = sampler.await {
            tracing::error!(error = ?err, "error joining metrics sampler task");
        }

        tracing::debug!("Shoal shutdown complete");
        Ok(())
    }
}

/// Drain `on_new_req_available` notifications: reserve the staged write,
/// execute it through the registered service handler, and commit or abort.
pub(crate) fn spawn_service_loop(
    worker: Worker, handler: Arc<dyn ServiceHandler>, mut notice_rx: mpsc::Receiver<ServiceKind>, mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                notice = notice_rx.recv() => match notice {
                    Some(service) => execute_staged_write(&worker, &handler, service).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
    })
}

async fn execute_staged_write(worker: &Worker, handler: &Arc<dyn ServiceHandler>, service: ServiceKind) {
    let staged = match worker.prepare_write(service).await {
        Ok(Some(staged)) => staged,
        Ok(None) => return,
        Err(err) => {
            tracing::error!(error = ?err, service = %service, "error preparing staged write");
            if let Err(err) = worker.abort_write(service).await {
                tracing::error!(error = ?err, service = %service, "error aborting failed prepare");
            }
            return;
        }
    };

    let applied = match WriteReqType::from_code(staged.reqtype) {
        Some(reqtype) => {
            let handler = handler.clone();
            let payload = staged.payload;
            tokio::task::spawn_blocking(move || handler.apply(reqtype, &payload))
                .await
                .unwrap_or_else(|err| Err(anyhow!("service handler task failed: {}", err)))
        }
        None => Err(anyhow!("prepared write carries unknown request type code {}", staged.reqtype)),
    };

    let res = match applied {
        Ok(()) => worker.end_write(service).await,
        Err(err) => {
            tracing::error!(error = ?err, service = %service, inc_id = staged.inc_id, "service execution failed, aborting write");
            worker.abort_write(service).await
        }
    };
    if let Err(err) = res {
        tracing::error!(error = ?err, service = %service, "error finalizing staged write");
    }
}
