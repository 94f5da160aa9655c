//! Service registry.
//!
//! Each service's elected master advertises itself as a sequential ephemeral
//! under `<Service>Servers/`; the lowest-sequence child is the elected master
//! for the service. Nodes watch their predecessor rather than the whole
//! sibling set, which keeps an election change from stampeding every node.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::coordination::{CoordinationClient, CreateMode};
use crate::utils;
use shoal_core::namespace::{sequence_of, Namespace, ServiceKind};
use shoal_core::znode::{ZnodeData, KEY_BA_PORT, KEY_MASTER_PORT, KEY_MASTER_SERVER_REAL_PATH};
use shoal_core::CoordinationError;

/// Advertise this node as a master server for the given service, returning
/// the real (sequence-suffixed) registration path.
pub async fn register_server(client: &CoordinationClient, ns: &Namespace, service: ServiceKind, config: &Config) -> Result<String> {
    client.ensure_path(&ns.servers(service)).await.context("error ensuring servers path")?;
    let mut data = ZnodeData::new();
    data.set_host(&config.host)
        .set_port(KEY_MASTER_PORT, config.master_port)
        .set_port(KEY_BA_PORT, config.ba_port)
        .set_replica_id(config.replica_id)
        .set_node_id(config.node_id);
    let real_path = client
        .create(&ns.server_base(service), data.encode(), CreateMode::EphemeralSequential)
        .await
        .context("error registering master server")?;

    // Record the real path back into the registration so watchers can
    // correlate a server entry with the node which owns it.
    let mut with_path = data;
    with_path.set(KEY_MASTER_SERVER_REAL_PATH, &real_path);
    client.set_data(&real_path, with_path.encode()).await.context("error recording server real path")?;
    Ok(real_path)
}

/// Drop a master server registration.
pub async fn unregister_server(client: &CoordinationClient, real_path: &str) -> Result<()> {
    client.delete_if_exists(real_path).await.context("error unregistering master server")?;
    Ok(())
}

/// The registration names of a service's servers, ordered by sequence.
async fn server_names(client: &CoordinationClient, ns: &Namespace, service: ServiceKind) -> Result<Vec<String>> {
    let mut names = match client.get_children(&ns.servers(service)).await {
        Ok(children) => children,
        Err(CoordinationError::NoNode(_)) => return Ok(Vec::new()),
        Err(err) => return Err(err).context("error enumerating service servers"),
    };
    names.retain(|name| sequence_of(name).is_some());
    names.sort_by_key(|name| sequence_of(name));
    Ok(names)
}

/// The full path of the elected (lowest-sequence) server for a service.
pub async fn elected_server(client: &CoordinationClient, ns: &Namespace, service: ServiceKind) -> Result<Option<String>> {
    let names = server_names(client, ns, service).await?;
    Ok(names.first().map(|name| utils::join_path(&ns.servers(service), name)))
}

/// The predecessor of this node's registration, the single entry it needs to
/// watch for deletion.
pub async fn predecessor_of(client: &CoordinationClient, ns: &Namespace, service: ServiceKind, own_real_path: &str) -> Result<Option<String>> {
    let own_name = own_real_path.rsplit('/').next().unwrap_or_default();
    let own_seq = match sequence_of(own_name) {
        Some(seq) => seq,
        None => return Ok(None),
    };
    let names = server_names(client, ns, service).await?;
    let predecessor = names
        .into_iter()
        .filter(|name| sequence_of(name).map(|seq| seq < own_seq).unwrap_or(false))
        .last();
    Ok(predecessor.map(|name| utils::join_path(&ns.servers(service), &name)))
}

/// Discover the advertised endpoint of a service's elected master.
pub async fn find_service_master(client: &CoordinationClient, ns: &Namespace, service: ServiceKind) -> Result<Option<(String, u16)>> {
    let elected = match elected_server(client, ns, service).await? {
        Some(path) => path,
        None => return Ok(None),
    };
    let raw = match client.get_data(&elected).await {
        Ok(raw) => raw,
        Err(CoordinationError::NoNode(_)) => return Ok(None),
        Err(err) => return Err(err).context("error reading elected server registration"),
    };
    let data = ZnodeData::decode(&raw).context("error decoding elected server registration")?;
    match (data.host(), data.master_port()) {
        (Some(host), Some(port)) => Ok(Some((host.to_string(), port))),
        _ => Ok(None),
    }
}
