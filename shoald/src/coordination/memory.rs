//! The embedded in-memory coordination service.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::coordination::{CoordinationBackend, CoordinationClient, CoordinationEvent, CoordinationResult, CreateMode, SessionId, SessionState};
use crate::utils;
use shoal_core::CoordinationError;

/// An in-process coordination service.
///
/// Implements the full hierarchical store semantics: persistent and ephemeral
/// znodes, per-parent 10-digit sequential suffixes, level-style event fan-out,
/// and observable session state. `expire_session` and `set_connected` allow
/// tests to exercise session-loss paths.
#[derive(Clone)]
pub struct MemoryCoordination {
    inner: Arc<Mutex<State>>,
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct State {
    /// All znodes, keyed by full path. `BTreeMap` keeps children sorted.
    nodes: BTreeMap<String, Znode>,
    /// Sequence counters for sequential creations, keyed by parent path.
    sequences: HashMap<String, u64>,
    /// All known sessions.
    sessions: HashMap<SessionId, Session>,
    /// Whether the service is reachable; toggled by tests to simulate
    /// connection loss.
    connected: bool,
}

struct Znode {
    data: Vec<u8>,
    /// The owning session for ephemeral znodes.
    ephemeral_owner: Option<SessionId>,
}

#[derive(Default)]
struct Session {
    expired: bool,
    subscribers: Vec<mpsc::UnboundedSender<CoordinationEvent>>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(State {
            connected: true,
            ..Default::default()
        }));
        Self { inner }
    }

    /// Establish a new client session.
    pub fn connect(&self) -> CoordinationClient {
        let session = Uuid::new_v4();
        {
            let mut state = self.inner.lock().expect("coordination state lock poisoned");
            state.sessions.insert(session, Session::default());
        }
        CoordinationClient::new(session, Arc::new(self.clone()))
    }

    /// Expire the given client's session, dropping all of its ephemerals.
    ///
    /// Test hook modelling a session timeout on the ensemble side.
    pub fn expire_session(&self, client: &CoordinationClient) {
        let session = client.session_id();
        let mut state = self.inner.lock().expect("coordination state lock poisoned");
        state.drop_session_ephemerals(session);
        if let Some(entry) = state.sessions.get_mut(&session) {
            entry.expired = true;
        }
        state.notify_session(session, SessionState::Expired);
    }

    /// Simulate losing or regaining the connection to the service.
    ///
    /// Test hook; while disconnected every operation fails with a transient
    /// error and no events flow.
    pub fn set_connected(&self, connected: bool) {
        let mut state = self.inner.lock().expect("coordination state lock poisoned");
        if state.connected == connected {
            return;
        }
        state.connected = connected;
        let transition = if connected { SessionState::Connected } else { SessionState::Disconnected };
        let sessions: Vec<_> = state.sessions.keys().copied().collect();
        for session in sessions {
            state.notify_session(session, transition);
        }
    }
}

impl State {
    /// Check the session is usable, erroring out for disconnects and expiry.
    fn check_session(&self, session: SessionId) -> CoordinationResult<()> {
        if !self.connected {
            return Err(CoordinationError::Disconnected);
        }
        match self.sessions.get(&session) {
            Some(entry) if entry.expired => Err(CoordinationError::SessionExpired),
            Some(_) => Ok(()),
            None => Err(CoordinationError::Closed),
        }
    }

    fn broadcast(&mut self, event: CoordinationEvent) {
        for entry in self.sessions.values_mut() {
            entry.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn notify_session(&mut self, session: SessionId, transition: SessionState) {
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.subscribers.retain(|tx| tx.send(CoordinationEvent::Session(transition)).is_ok());
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.nodes.range(prefix.clone()..).next().map(|(key, _)| key.starts_with(&prefix)).unwrap_or(false)
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            self.broadcast(CoordinationEvent::NodeDeleted(path.to_string()));
            if let Some(parent) = utils::parent_path(path) {
                let parent = parent.to_string();
                self.broadcast(CoordinationEvent::ChildrenChanged(parent));
            }
        }
    }

    fn drop_session_ephemerals(&mut self, session: SessionId) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        // Deepest first, so parents are only removed once childless.
        for path in owned.into_iter().rev() {
            self.remove_node(&path);
        }
    }

    fn parent_exists(&self, path: &str) -> bool {
        match utils::parent_path(path) {
            // Top-level znodes hang off the implicit root.
            None => true,
            Some(parent) => self.nodes.contains_key(parent),
        }
    }
}

#[async_trait]
impl CoordinationBackend for MemoryCoordination {
    async fn create(&self, session: SessionId, path: &str, data: Vec<u8>, mode: CreateMode) -> CoordinationResult<String> {
        let mut state = self.inner.lock().expect("coordination state lock poisoned");
        state.check_session(session)?;
        if !path.starts_with('/') || path.ends_with('/') {
            return Err(CoordinationError::BadData(path.to_string()));
        }
        if !state.parent_exists(path) {
            let parent = utils::parent_path(path).unwrap_or("/").to_string();
            return Err(CoordinationError::NoNode(parent));
        }

        let real_path = if mode.is_sequential() {
            let parent = utils::parent_path(path).unwrap_or("").to_string();
            let seq = state.sequences.entry(parent).or_insert(0);
            let real = format!("{}{:010}", path, *seq);
            *seq += 1;
            real
        } else {
            path.to_string()
        };
        if state.nodes.contains_key(&real_path) {
            return Err(CoordinationError::NodeExists(real_path));
        }

        let ephemeral_owner = mode.is_ephemeral().then(|| session);
        state.nodes.insert(real_path.clone(), Znode { data: data.clone(), ephemeral_owner });
        state.broadcast(CoordinationEvent::NodeCreated { path: real_path.clone(), data });
        if let Some(parent) = utils::parent_path(&real_path) {
            let parent = parent.to_string();
            state.broadcast(CoordinationEvent::ChildrenChanged(parent));
        }
        Ok(real_path)
    }

    async fn ensure_path(&self, session: SessionId, path: &str) -> CoordinationResult<()> {
        let mut state = self.inner.lock().expect("coordination state lock poisoned");
        state.check_session(session)?;
        if !path.starts_with('/') || path.ends_with('/') {
            return Err(CoordinationError::BadData(path.to_string()));
        }
        let mut current = String::new();
        for segment in path.split('/').filter(|seg| !seg.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if !state.nodes.contains_key(&current) {
                state.nodes.insert(current.clone(), Znode { data: Vec::new(), ephemeral_owner: None });
                state.broadcast(CoordinationEvent::NodeCreated { path: current.clone(), data: Vec::new() });
                if let Some(parent) = utils::parent_path(&current) {
                    let parent = parent.to_string();
                    state.broadcast(CoordinationEvent::ChildrenChanged(parent));
                }
            }
        }
        Ok(())
    }

    async fn set_data(&self, session: SessionId, path: &str, data: Vec<u8>) -> CoordinationResult<()> {
        let mut state = self.inner.lock().expect("coordination state lock poisoned");
        state.check_session(session)?;
        match state.nodes.get_mut(path) {
            Some(node) => node.data = data.clone(),
            None => return Err(CoordinationError::NoNode(path.to_string())),
        }
        state.broadcast(CoordinationEvent::DataChanged { path: path.to_string(), data });
        Ok(())
    }

    async fn get_data(&self, session: SessionId, path: &str) -> CoordinationResult<Vec<u8>> {
        let state = self.inner.lock().expect("coordination state lock poisoned");
        state.check_session(session)?;
        state.nodes.get(path).map(|node| node.data.clone()).ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    async fn get_children(&self, session: SessionId, path: &str) -> CoordinationResult<Vec<String>> {
        let state = self.inner.lock().expect("coordination state lock poisoned");
        state.check_session(session)?;
        if !state.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        let prefix = format!("{}/", path);
        let children = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(children)
    }

    async fn exists(&self, session: SessionId, path: &str) -> CoordinationResult<bool> {
        let state = self.inner.lock().expect("coordination state lock poisoned");
        state.check_session(session)?;
        Ok(state.nodes.contains_key(path))
    }

    async fn delete(&self, session: SessionId, path: &str) -> CoordinationResult<()> {
        let mut state = self.inner.lock().expect("coordination state lock poisoned");
        state.check_session(session)?;
        if !state.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        if state.has_children(path) {
            return Err(CoordinationError::NotEmpty(path.to_string()));
        }
        state.remove_node(path);
        Ok(())
    }

    fn subscribe(&self, session: SessionId) -> mpsc::UnboundedReceiver<CoordinationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock().expect("coordination state lock poisoned");
        if let Some(entry) = state.sessions.get_mut(&session) {
            entry.subscribers.push(tx);
        }
        rx
    }

    fn session_state(&self, session: SessionId) -> SessionState {
        let state = self.inner.lock().expect("coordination state lock poisoned");
        if !state.connected {
            return SessionState::Disconnected;
        }
        match state.sessions.get(&session) {
            Some(entry) if entry.expired => SessionState::Expired,
            Some(_) => SessionState::Connected,
            None => SessionState::Expired,
        }
    }

    async fn reconnect(&self, session: SessionId) -> CoordinationResult<()> {
        let mut state = self.inner.lock().expect("coordination state lock poisoned");
        if !state.connected {
            return Err(CoordinationError::Disconnected);
        }
        match state.sessions.get_mut(&session) {
            Some(entry) => entry.expired = false,
            None => return Err(CoordinationError::Closed),
        }
        state.notify_session(session, SessionState::Connected);
        Ok(())
    }

    async fn close(&self, session: SessionId) {
        let mut state = self.inner.lock().expect("coordination state lock poisoned");
        state.drop_session_ephemerals(session);
        state.sessions.remove(&session);
    }
}
