//! Coordination service client.
//!
//! The coordination service is a hierarchical store with ephemeral and
//! sequential znodes, watches for data/children changes, and observable
//! session state. The transport to an external ensemble is out of scope
//! here; `CoordinationBackend` is the seam it plugs into, and
//! [`MemoryCoordination`] is the embedded implementation used for
//! single-process deployments and simulation tests.
//!
//! Callbacks are never delivered on the caller's stack: every subscriber
//! receives events over a channel consumed by its own controller task, so
//! all state mutation driven by coordination events stays single-threaded.

mod memory;
#[cfg(test)]
mod mod_test;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use memory::MemoryCoordination;
use shoal_core::CoordinationError;

/// A result type for coordination operations.
pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

/// The id of a client session.
pub type SessionId = Uuid;

/// The creation mode of a znode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// The state of a client session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// The session is established and events are flowing.
    Connected,
    /// The connection was lost; the session may still be re-established.
    Disconnected,
    /// The session has expired; every ephemeral it owned is gone.
    Expired,
}

/// An event delivered to coordination subscribers.
///
/// Watches are level-style: every subscriber sees every event and filters by
/// path, mirroring the event-handler dispatch of the upstream service.
/// Creation and data events carry the payload snapshot taken when the event
/// fired, so consumers observe every transition in order rather than
/// re-reading whatever state the znode has settled into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinationEvent {
    /// A session state transition for the subscribing client.
    Session(SessionState),
    NodeCreated { path: String, data: Vec<u8> },
    NodeDeleted(String),
    DataChanged { path: String, data: Vec<u8> },
    ChildrenChanged(String),
}

/// The interface implemented by coordination service backends.
#[async_trait]
pub trait CoordinationBackend: Send + Sync + 'static {
    /// Create a znode, returning the real path (sequential modes append a
    /// 10-digit suffix).
    async fn create(&self, session: SessionId, path: &str, data: Vec<u8>, mode: CreateMode) -> CoordinationResult<String>;

    /// Recursively create the given path with persistent empty znodes, as needed.
    async fn ensure_path(&self, session: SessionId, path: &str) -> CoordinationResult<()>;

    /// Replace the data payload of an existing znode.
    async fn set_data(&self, session: SessionId, path: &str, data: Vec<u8>) -> CoordinationResult<()>;

    /// Fetch the data payload of a znode.
    async fn get_data(&self, session: SessionId, path: &str) -> CoordinationResult<Vec<u8>>;

    /// Fetch the sorted child names of a znode.
    async fn get_children(&self, session: SessionId, path: &str) -> CoordinationResult<Vec<String>>;

    /// Check whether a znode exists.
    async fn exists(&self, session: SessionId, path: &str) -> CoordinationResult<bool>;

    /// Delete a childless znode.
    async fn delete(&self, session: SessionId, path: &str) -> CoordinationResult<()>;

    /// Subscribe to the event feed of this session.
    fn subscribe(&self, session: SessionId) -> mpsc::UnboundedReceiver<CoordinationEvent>;

    /// The current state of the given session.
    fn session_state(&self, session: SessionId) -> SessionState;

    /// Re-establish an expired session.
    ///
    /// Models a client transparently negotiating a fresh session after
    /// expiry: the handle keeps working, but every ephemeral the old session
    /// owned is gone and must be re-created.
    async fn reconnect(&self, session: SessionId) -> CoordinationResult<()>;

    /// Close the given session, dropping its ephemerals.
    async fn close(&self, session: SessionId);
}

/// A cloneable per-session handle to the coordination service.
#[derive(Clone)]
pub struct CoordinationClient {
    session: SessionId,
    backend: Arc<dyn CoordinationBackend>,
}

impl CoordinationClient {
    /// Create a new handle over the given backend session.
    pub fn new(session: SessionId, backend: Arc<dyn CoordinationBackend>) -> Self {
        Self { session, backend }
    }

    /// The id of this client's session.
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> CoordinationResult<String> {
        self.backend.create(self.session, path, data, mode).await
    }

    pub async fn ensure_path(&self, path: &str) -> CoordinationResult<()> {
        self.backend.ensure_path(self.session, path).await
    }

    pub async fn set_data(&self, path: &str, data: Vec<u8>) -> CoordinationResult<()> {
        self.backend.set_data(self.session, path, data).await
    }

    pub async fn get_data(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        self.backend.get_data(self.session, path).await
    }

    pub async fn get_children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.backend.get_children(self.session, path).await
    }

    pub async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        self.backend.exists(self.session, path).await
    }

    pub async fn delete(&self, path: &str) -> CoordinationResult<()> {
        self.backend.delete(self.session, path).await
    }

    /// Delete a znode, treating an already-absent node as success.
    pub async fn delete_if_exists(&self, path: &str) -> CoordinationResult<()> {
        match self.backend.delete(self.session, path).await {
            Ok(()) | Err(CoordinationError::NoNode(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Create a znode, or replace its data if it already exists.
    pub async fn create_or_set(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> CoordinationResult<()> {
        match self.backend.create(self.session, path, data.clone(), mode).await {
            Ok(_) => Ok(()),
            Err(CoordinationError::NodeExists(_)) => self.backend.set_data(self.session, path, data).await,
            Err(err) => Err(err),
        }
    }

    /// Subscribe to the event feed of this session.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CoordinationEvent> {
        self.backend.subscribe(self.session)
    }

    /// The current state of this client's session.
    pub fn session_state(&self) -> SessionState {
        self.backend.session_state(self.session)
    }

    pub fn is_connected(&self) -> bool {
        self.session_state() == SessionState::Connected
    }

    /// Re-establish this client's session after expiry.
    pub async fn reconnect(&self) -> CoordinationResult<()> {
        self.backend.reconnect(self.session).await
    }

    /// Close this client's session, dropping its ephemerals.
    pub async fn close(&self) {
        self.backend.close(self.session).await
    }
}
