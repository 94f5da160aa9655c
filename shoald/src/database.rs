//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use shoal_core::{ShutdownError, ShutdownResult};

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/shoal/data";
/// The DB tree used for the click-through counters of this node's collection.
const TREE_CTR: &str = "ctr";
/// The DB tree prefix used for recommend storage.
const TREE_RECOMMEND_PREFIX: &str = "recommend";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over this node's embedded database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// System runtime config.
    #[allow(dead_code)]
    config: Arc<Config>,
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let dbpath = PathBuf::from(&config.storage_data_path).join("db");
        tokio::fs::create_dir_all(&dbpath).await.context("error creating dir for shoal database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { config, db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await.map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the DB tree holding click-through counters.
    pub async fn get_ctr_tree(&self) -> ShutdownResult<Tree> {
        self.get_tree(TREE_CTR.to_string()).await
    }

    /// Get a handle to a recommend storage tree for the given collection and store name.
    pub async fn get_recommend_tree(&self, collection: &str, store: &str) -> ShutdownResult<Tree> {
        self.get_tree(format!("{}/{}/{}", TREE_RECOMMEND_PREFIX, collection, store)).await
    }

    async fn get_tree(&self, name: String) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(name.as_str()));
        Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", &name, err))))
    }
}
