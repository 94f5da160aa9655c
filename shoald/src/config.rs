//! Runtime configuration.

#[cfg(test)]
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use shoal_core::namespace::{Namespace, ServiceKind};
use shoal_core::{NodeId, ReplicaId, ShardId};

/// The storage backend used for recommend data.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Embedded key/value storage on local disk.
    Local,
    /// A remote column store; endpoints must be configured.
    Remote,
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Local
}

fn default_enable_master() -> bool {
    true
}

fn default_migrate_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    30
}

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The name of the cluster root in the coordination namespace.
    pub cluster_root: String,
    /// The host address advertised to the rest of the cluster.
    pub host: String,
    /// The port serving client traffic.
    pub ba_port: u16,
    /// The port serving bulk data transfer.
    pub data_port: u16,
    /// The port serving worker RPC traffic.
    pub worker_port: u16,
    /// The port serving master RPC traffic.
    pub master_port: u16,
    /// The port which the metrics server is to listen on.
    pub metrics_port: u16,

    /// The replica plane this node belongs to, `1..=R`.
    pub replica_id: ReplicaId,
    /// The id of this node within its replica plane, `1..=N`.
    pub node_id: NodeId,
    /// Comma-separated list of shard ids hosted by this node.
    pub shard_ids: String,
    /// The shards hosted by this node.
    ///
    /// This value is derived from the `shard_ids` value.
    #[serde(skip, default)]
    pub shards: Vec<ShardId>,
    /// The total number of shards per service in this cluster.
    pub shard_total: u32,
    /// Comma-separated list of services this node participates in.
    pub services: String,
    /// The services this node participates in.
    ///
    /// This value is derived from the `services` value.
    #[serde(skip, default)]
    pub service_kinds: Vec<ServiceKind>,
    /// Whether this node runs the master manager.
    #[serde(default = "default_enable_master")]
    pub enable_master: bool,

    /// The collection served by this node.
    pub collection: String,
    /// The path to data storage on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,
    /// Override for the request log directory; defaults to `reqlog` under the
    /// data path.
    #[serde(default)]
    pub reqlog_data_path: Option<String>,
    /// The storage backend for recommend data.
    #[serde(default = "default_storage_backend")]
    pub storage_backend: StorageBackend,
    /// Comma-separated remote column store endpoints, required for the
    /// `remote` backend.
    #[serde(default)]
    pub remote_storage_hosts: Option<String>,

    /// Seconds to wait on sharding migration rendezvous points.
    #[serde(default = "default_migrate_timeout")]
    pub migrate_timeout_secs: u64,
    /// Seconds an in-flight write may remain unacknowledged before it is aborted.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let mut config: Config = envy::from_env().context("error building config from env")?;
        config.derive_and_validate()?;
        Ok(config)
    }

    pub(crate) fn derive_and_validate(&mut self) -> Result<()> {
        if self.replica_id < 1 {
            bail!("replica_id must be >= 1");
        }
        if self.node_id < 1 {
            bail!("node_id must be >= 1");
        }
        if self.shard_total < 1 {
            bail!("shard_total must be >= 1");
        }
        self.shards = self
            .shard_ids
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|part| part.trim().parse::<ShardId>().context("invalid shard id in shard_ids"))
            .collect::<Result<Vec<_>>>()?;
        if self.shards.is_empty() {
            bail!("shard_ids must name at least one shard");
        }
        if let Some(bad) = self.shards.iter().find(|id| **id < 1 || **id > self.shard_total) {
            bail!("shard id {} is outside of 1..={}", bad, self.shard_total);
        }
        self.service_kinds = self
            .services
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|part| ServiceKind::parse(part.trim()).with_context(|| format!("unrecognized service '{}'", part.trim())))
            .collect::<Result<Vec<_>>>()?;
        if self.service_kinds.is_empty() {
            bail!("services must name at least one service");
        }
        if self.storage_backend == StorageBackend::Remote && self.remote_storage_hosts.as_deref().map(str::is_empty).unwrap_or(true) {
            bail!("remote storage backend selected but remote_storage_hosts is not configured");
        }
        Ok(())
    }

    /// The coordination namespace of this cluster.
    pub fn namespace(&self) -> Namespace {
        Namespace::new(&self.cluster_root)
    }

    /// The directory holding the request log files.
    pub fn reqlog_path(&self) -> std::path::PathBuf {
        match &self.reqlog_data_path {
            Some(path) => path.into(),
            None => std::path::Path::new(&self.storage_data_path).join("reqlog"),
        }
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> Result<(Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config = Self::new_test_node(&tmpdir, 1, 1, "1", 1)?;
        Ok((config, tmpdir))
    }

    /// Build a test instance for the given cluster identity, sharing a base dir.
    #[cfg(test)]
    pub fn new_test_node(tmpdir: &tempfile::TempDir, replica_id: ReplicaId, node_id: NodeId, shard_ids: &str, shard_total: u32) -> Result<Arc<Self>> {
        // Every cluster identity gets its own port block.
        let port_offset = (replica_id * 10 + node_id) as u16;
        let mut config = Self {
            rust_log: "".into(),
            cluster_root: "shoal-test".into(),
            host: "127.0.0.1".into(),
            ba_port: 18080 + port_offset,
            data_port: 18300 + port_offset,
            worker_port: 18500 + port_offset,
            master_port: 18700 + port_offset,
            metrics_port: 18900 + port_offset,
            replica_id,
            node_id,
            shard_ids: shard_ids.into(),
            shards: vec![],
            shard_total,
            services: "search".into(),
            service_kinds: vec![],
            enable_master: true,
            collection: "items".into(),
            storage_data_path: tmpdir.path().join(format!("r{}n{}", replica_id, node_id)).to_string_lossy().to_string(),
            reqlog_data_path: None,
            storage_backend: StorageBackend::Local,
            remote_storage_hosts: None,
            migrate_timeout_secs: 2,
            write_timeout_secs: 2,
        };
        config.derive_and_validate()?;
        Ok(Arc::new(config))
    }
}
