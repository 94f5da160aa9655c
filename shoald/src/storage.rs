//! Recommend storage factory.
//!
//! Creates the user and event stores for a collection, choosing the backing
//! implementation from config at init. The rest of the system is oblivious
//! to the choice.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::config::{Config, StorageBackend};
use crate::database::{Database, Tree};

const STORE_USERS: &str = "users";
const STORE_EVENTS: &str = "events";

/// A simple persistent key/value store for recommend data.
#[derive(Clone)]
pub struct RecommendStore {
    tree: Tree,
}

impl RecommendStore {
    pub fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.tree.insert(key, val).context("error writing recommend record")?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let val = self.tree.get(key).context("error reading recommend record")?;
        Ok(val.map(|ivec| ivec.to_vec()))
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.tree.remove(key).context("error removing recommend record")?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush().context("error flushing recommend store")?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Creates storage instances for recommend data.
pub struct StorageFactory {
    config: Arc<Config>,
    db: Database,
}

impl StorageFactory {
    pub fn new(config: Arc<Config>, db: Database) -> Self {
        Self { config, db }
    }

    /// The user profile store for this node's collection.
    pub async fn user_store(&self) -> Result<RecommendStore> {
        self.open_store(STORE_USERS).await
    }

    /// The purchase/visit event store for this node's collection.
    pub async fn event_store(&self) -> Result<RecommendStore> {
        self.open_store(STORE_EVENTS).await
    }

    async fn open_store(&self, store: &str) -> Result<RecommendStore> {
        match self.config.storage_backend {
            StorageBackend::Local => {
                let tree = self.db.get_recommend_tree(&self.config.collection, store).await?;
                Ok(RecommendStore { tree })
            }
            // The column-store transport is provided by the deployment, not
            // this daemon.
            StorageBackend::Remote => bail!(
                "remote recommend storage for hosts '{}' is not served in-process",
                self.config.remote_storage_hosts.as_deref().unwrap_or_default()
            ),
        }
    }
}
