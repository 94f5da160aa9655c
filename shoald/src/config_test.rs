use anyhow::Result;

use crate::config::{Config, StorageBackend};
use shoal_core::namespace::ServiceKind;

fn base_env() -> Vec<(String, String)> {
    vec![
        ("RUST_LOG".into(), "error".into()),
        ("CLUSTER_ROOT".into(), "shoal".into()),
        ("HOST".into(), "10.0.0.7".into()),
        ("BA_PORT".into(), "18080".into()),
        ("DATA_PORT".into(), "18090".into()),
        ("WORKER_PORT".into(), "18151".into()),
        ("MASTER_PORT".into(), "18131".into()),
        ("METRICS_PORT".into(), "18201".into()),
        ("REPLICA_ID".into(), "2".into()),
        ("NODE_ID".into(), "3".into()),
        ("SHARD_IDS".into(), "3,5".into()),
        ("SHARD_TOTAL".into(), "5".into()),
        ("SERVICES".into(), "search,recommend".into()),
        ("COLLECTION".into(), "items".into()),
        ("STORAGE_DATA_PATH".into(), "/usr/local/shoal/data".into()),
    ]
}

fn parse(env: Vec<(String, String)>) -> Result<Config> {
    let mut config: Config = envy::from_iter(env)?;
    config.derive_and_validate()?;
    Ok(config)
}

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config = parse(base_env())?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}", config.rust_log);
    assert!(config.cluster_root == "shoal", "unexpected value parsed for CLUSTER_ROOT, got {}", config.cluster_root);
    assert!(config.host == "10.0.0.7", "unexpected value parsed for HOST, got {}", config.host);
    assert!(config.worker_port == 18151, "unexpected value parsed for WORKER_PORT, got {}", config.worker_port);
    assert!(config.replica_id == 2, "unexpected value parsed for REPLICA_ID, got {}", config.replica_id);
    assert!(config.node_id == 3, "unexpected value parsed for NODE_ID, got {}", config.node_id);
    assert!(config.shards == vec![3, 5], "unexpected value derived for shards, got {:?}", config.shards);
    assert!(config.shard_total == 5, "unexpected value parsed for SHARD_TOTAL, got {}", config.shard_total);
    assert!(
        config.service_kinds == vec![ServiceKind::Search, ServiceKind::Recommend],
        "unexpected value derived for services, got {:?}",
        config.service_kinds
    );
    assert!(config.enable_master, "expected ENABLE_MASTER to default to true");
    assert!(
        config.storage_backend == StorageBackend::Local,
        "expected STORAGE_BACKEND to default to local, got {:?}",
        config.storage_backend
    );
    assert!(config.migrate_timeout_secs == 30, "expected MIGRATE_TIMEOUT_SECS to default to 30, got {}", config.migrate_timeout_secs);
    assert!(config.reqlog_path().ends_with("reqlog"), "expected request log dir to default under the data path");
    Ok(())
}

#[test]
fn config_parses_optional_overrides() -> Result<()> {
    let mut env = base_env();
    env.push(("ENABLE_MASTER".into(), "false".into()));
    env.push(("STORAGE_BACKEND".into(), "remote".into()));
    env.push(("REMOTE_STORAGE_HOSTS".into(), "cs1:9160,cs2:9160".into()));
    env.push(("MIGRATE_TIMEOUT_SECS".into(), "45".into()));
    env.push(("REQLOG_DATA_PATH".into(), "/var/lib/shoal/reqlog".into()));
    let config = parse(env)?;

    assert!(!config.enable_master, "expected ENABLE_MASTER override to parse");
    assert!(config.storage_backend == StorageBackend::Remote, "expected STORAGE_BACKEND override to parse");
    assert!(
        config.remote_storage_hosts.as_deref() == Some("cs1:9160,cs2:9160"),
        "unexpected value parsed for REMOTE_STORAGE_HOSTS, got {:?}",
        config.remote_storage_hosts
    );
    assert!(config.migrate_timeout_secs == 45, "unexpected value parsed for MIGRATE_TIMEOUT_SECS, got {}", config.migrate_timeout_secs);
    assert!(
        config.reqlog_path() == std::path::PathBuf::from("/var/lib/shoal/reqlog"),
        "expected REQLOG_DATA_PATH override to win, got {:?}",
        config.reqlog_path()
    );
    Ok(())
}

#[test]
fn invalid_configs_are_rejected_at_init() {
    let mut env = base_env();
    env.push(("STORAGE_BACKEND".into(), "remote".into()));
    assert!(parse(env).is_err(), "expected remote backend without hosts to be rejected");

    let mut env = base_env();
    env.retain(|(key, _)| key != "SERVICES");
    env.push(("SERVICES".into(), "search,unknown".into()));
    assert!(parse(env).is_err(), "expected unknown service to be rejected");

    let mut env = base_env();
    env.retain(|(key, _)| key != "SHARD_IDS");
    env.push(("SHARD_IDS".into(), "9".into()));
    assert!(parse(env).is_err(), "expected out-of-range shard id to be rejected");

    let mut env = base_env();
    env.retain(|(key, _)| key != "REPLICA_ID");
    env.push(("REPLICA_ID".into(), "0".into()));
    assert!(parse(env).is_err(), "expected replica id 0 to be rejected");
}

#[test]
fn test_constructor_validates() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    assert_eq!(config.shards, vec![1]);
    assert_eq!(config.service_kinds, vec![ServiceKind::Search]);
    Ok(())
}
