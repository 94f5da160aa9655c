//! The Shoal cluster node daemon.

use std::io::Write;
use std::mem::MaybeUninit;
use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

use shoal_core::prom::register_proc_metrics;
use shoald::app::App;
use shoald::config::Config;
use shoald::ctr::{ClickCountHandler, ClickCounter, DEFAULT_DOC_CAPACITY};
use shoald::database::Database;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let recorder = get_metrics_recorder(&cfg);
    metrics::set_recorder(recorder).context("error setting prometheus metrics recorder")?;
    register_proc_metrics();

    tracing::info!(
        cluster_root = %cfg.cluster_root,
        host = %cfg.host,
        replica_id = %cfg.replica_id,
        node_id = %cfg.node_id,
        shard_ids = %cfg.shard_ids,
        services = %cfg.services,
        enable_master = %cfg.enable_master,
        collection = %cfg.collection,
        storage_data_path = %cfg.storage_data_path,
        "starting Shoal node daemon",
    );

    // Wire the built-in click-count handler as this daemon's service executor.
    let db = Database::new(cfg.clone()).await.context("error opening database for click counters")?;
    let ctr = ClickCounter::open(&db, DEFAULT_DOC_CAPACITY).await.context("error opening click-count store")?;
    let handler = Arc::new(ClickCountHandler::new(ctr));

    let (shutdown_tx, _) = broadcast::channel(1);
    if let Err(err) = App::new(cfg, db, handler, shutdown_tx.clone()).await?.spawn().await {
        tracing::error!(error = ?err);
        let _res = shutdown_tx.send(());
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}

/// Get a handle to the metrics recorder, initializing it as needed.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static mut RECORDER: MaybeUninit<PrometheusRecorder> = MaybeUninit::uninit();
    static ONCE: Once = Once::new();
    unsafe {
        ONCE.call_once(|| {
            RECORDER.write(
                PrometheusBuilder::new()
                    .idle_timeout(metrics_util::MetricKindMask::ALL, Some(std::time::Duration::from_secs(60 * 60)))
                    .add_global_label("cluster", config.cluster_root.clone())
                    .add_global_label("host", config.host.clone())
                    .add_global_label("replica_id", format!("{}", config.replica_id))
                    .add_global_label("node_id", format!("{}", config.node_id))
                    .build(),
            );
        });
        RECORDER.assume_init_ref()
    }
}
