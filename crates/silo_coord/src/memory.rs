//! In-process coordination store.
//!
//! One `MemoryCoordStore` plays the role of the external coordination service
//! for a whole test cluster: every process-like participant (master, region
//! servers) connects its own session and sees the same namespace. A single
//! mutex orders all mutations, which gives watch delivery a total order per
//! session for free.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::{split_path, validate_path, CoordError, CoordResult, NodeValue, WatchEvent, WatchKind};

pub type SessionId = u64;

struct NodeRecord {
    data: Vec<u8>,
    version: u64,
    ephemeral_owner: Option<SessionId>,
}

struct SessionRecord {
    expired: bool,
    events: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct WatchTable {
    exists: HashMap<String, Vec<SessionId>>,
    data: HashMap<String, Vec<SessionId>>,
    children: HashMap<String, Vec<SessionId>>,
}

#[derive(Default)]
struct Registry {
    nodes: BTreeMap<String, NodeRecord>,
    sessions: HashMap<SessionId, SessionRecord>,
    watches: WatchTable,
    next_session: SessionId,
}

impl Registry {
    /// Drain one watch list and deliver `kind` to every live watcher.
    fn fire(list: &mut HashMap<String, Vec<SessionId>>, sessions: &HashMap<SessionId, SessionRecord>, path: &str, kind: WatchKind) {
        let Some(watchers) = list.remove(path) else {
            return;
        };
        for session in watchers {
            if let Some(record) = sessions.get(&session) {
                if !record.expired {
                    let _ = record.events.send(WatchEvent::new(path, kind));
                }
            }
        }
    }

    fn fire_node(&mut self, path: &str, kind: WatchKind) {
        Self::fire(&mut self.watches.data, &self.sessions, path, kind);
        Self::fire(&mut self.watches.exists, &self.sessions, path, kind);
    }

    fn fire_children(&mut self, parent: &str) {
        Self::fire(
            &mut self.watches.children,
            &self.sessions,
            parent,
            WatchKind::ChildrenChanged,
        );
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .map(|(p, _)| p[prefix.len()..].to_string())
            .collect()
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .next()
            .map(|(p, _)| p.starts_with(&prefix))
            .unwrap_or(false)
    }

    /// Remove a node unconditionally, firing the same watches a client
    /// delete would. Used for ephemeral teardown.
    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        self.fire_node(path, WatchKind::NodeDeleted);
        Self::fire(
            &mut self.watches.children,
            &self.sessions,
            path,
            WatchKind::NodeDeleted,
        );
        if let Some((parent, _)) = split_path(path) {
            if !parent.is_empty() {
                self.fire_children(parent);
            }
        }
    }
}

/// Shared in-process coordination store. Cheap to clone; all clones see the
/// same namespace.
#[derive(Clone, Default)]
pub struct MemoryCoordStore {
    inner: Arc<Mutex<Registry>>,
}

impl MemoryCoordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session. The returned receiver carries every watch event
    /// registered through the session, plus a final `SessionExpired`.
    pub fn connect(&self) -> (CoordSession, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reg = self.inner.lock().expect("coord registry poisoned");
        reg.next_session += 1;
        let id = reg.next_session;
        reg.sessions.insert(
            id,
            SessionRecord {
                expired: false,
                events: tx,
            },
        );
        (
            CoordSession {
                store: self.clone(),
                id,
            },
            rx,
        )
    }

    /// Expire a session as if its heartbeat lapsed: ephemerals are deleted
    /// (firing other sessions' watches), its own watches are dropped, and a
    /// final `SessionExpired` event is delivered on its channel.
    pub fn expire_session(&self, id: SessionId) {
        let mut reg = self.inner.lock().expect("coord registry poisoned");
        let Some(record) = reg.sessions.get_mut(&id) else {
            return;
        };
        if record.expired {
            return;
        }
        record.expired = true;
        let notify = record.events.clone();

        let ephemerals: Vec<String> = reg
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(id))
            .map(|(p, _)| p.clone())
            .collect();
        tracing::debug!(
            session = id,
            ephemerals = ephemerals.len(),
            "coordination session expired"
        );
        for path in ephemerals {
            reg.remove_node(&path);
        }
        for watchers in reg.watches.exists.values_mut() {
            watchers.retain(|s| *s != id);
        }
        for watchers in reg.watches.data.values_mut() {
            watchers.retain(|s| *s != id);
        }
        for watchers in reg.watches.children.values_mut() {
            watchers.retain(|s| *s != id);
        }
        let _ = notify.send(WatchEvent::new("", WatchKind::SessionExpired));
    }

    /// True while the session is connected and not expired.
    pub fn session_alive(&self, id: SessionId) -> bool {
        let reg = self.inner.lock().expect("coord registry poisoned");
        reg.sessions.get(&id).map(|s| !s.expired).unwrap_or(false)
    }
}

/// One client session against a [`MemoryCoordStore`].
#[derive(Clone)]
pub struct CoordSession {
    store: MemoryCoordStore,
    id: SessionId,
}

impl CoordSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    fn locked(&self) -> CoordResult<std::sync::MutexGuard<'_, Registry>> {
        let reg = self
            .store
            .inner
            .lock()
            .map_err(|_| CoordError::Unavailable("coord registry poisoned".into()))?;
        match reg.sessions.get(&self.id) {
            Some(record) if !record.expired => Ok(reg),
            _ => Err(CoordError::SessionExpired),
        }
    }

    pub fn get(&self, path: &str) -> CoordResult<NodeValue> {
        validate_path(path)?;
        let reg = self.locked()?;
        let node = reg
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NotFound(path.to_string()))?;
        Ok(NodeValue {
            data: node.data.clone(),
            version: node.version,
        })
    }

    pub fn exists(&self, path: &str) -> CoordResult<bool> {
        validate_path(path)?;
        let reg = self.locked()?;
        Ok(reg.nodes.contains_key(path))
    }

    /// Create a node at version 1. The parent must already exist for nested
    /// paths; root-level nodes need no parent.
    pub fn create(&self, path: &str, data: Vec<u8>, ephemeral: bool) -> CoordResult<()> {
        validate_path(path)?;
        let mut reg = self.locked()?;
        if reg.nodes.contains_key(path) {
            return Err(CoordError::NodeExists(path.to_string()));
        }
        let (parent, _) = split_path(path).ok_or_else(|| CoordError::NotFound(path.to_string()))?;
        if !parent.is_empty() && !reg.nodes.contains_key(parent) {
            return Err(CoordError::NotFound(parent.to_string()));
        }
        let owner = ephemeral.then_some(self.id);
        reg.nodes.insert(
            path.to_string(),
            NodeRecord {
                data,
                version: 1,
                ephemeral_owner: owner,
            },
        );
        reg.fire_node(path, WatchKind::NodeCreated);
        if !parent.is_empty() {
            reg.fire_children(parent);
        }
        Ok(())
    }

    /// Conditional write: succeeds only when the node's version still equals
    /// `expected_version`, then bumps it by one.
    pub fn set_data(&self, path: &str, data: Vec<u8>, expected_version: u64) -> CoordResult<u64> {
        validate_path(path)?;
        let mut reg = self.locked()?;
        let node = reg
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordError::NotFound(path.to_string()))?;
        if node.version != expected_version {
            return Err(CoordError::BadVersion {
                path: path.to_string(),
                expected: expected_version,
                actual: node.version,
            });
        }
        node.data = data;
        node.version += 1;
        let new_version = node.version;
        reg.fire_node(path, WatchKind::NodeDataChanged);
        Ok(new_version)
    }

    /// Conditional delete. Nodes with children cannot be deleted.
    pub fn delete(&self, path: &str, expected_version: u64) -> CoordResult<()> {
        validate_path(path)?;
        let mut reg = self.locked()?;
        let node = reg
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NotFound(path.to_string()))?;
        if node.version != expected_version {
            return Err(CoordError::BadVersion {
                path: path.to_string(),
                expected: expected_version,
                actual: node.version,
            });
        }
        if reg.has_children(path) {
            return Err(CoordError::Unavailable(format!(
                "cannot delete {path}: node has children"
            )));
        }
        reg.remove_node(path);
        Ok(())
    }

    /// Child names (leaf only), sorted.
    pub fn list(&self, path: &str) -> CoordResult<Vec<String>> {
        validate_path(path)?;
        let reg = self.locked()?;
        if !reg.nodes.contains_key(path) {
            return Err(CoordError::NotFound(path.to_string()));
        }
        Ok(reg.children_of(path))
    }

    /// Register a one-shot existence watch; returns whether the node exists
    /// right now.
    pub fn watch_exists(&self, path: &str) -> CoordResult<bool> {
        validate_path(path)?;
        let mut reg = self.locked()?;
        reg.watches
            .exists
            .entry(path.to_string())
            .or_default()
            .push(self.id);
        Ok(reg.nodes.contains_key(path))
    }

    /// Register a one-shot data watch; the node must exist. Returns the
    /// current value so the caller never acts on a stale cache.
    pub fn watch_data(&self, path: &str) -> CoordResult<NodeValue> {
        validate_path(path)?;
        let mut reg = self.locked()?;
        let node = reg
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NotFound(path.to_string()))?;
        let value = NodeValue {
            data: node.data.clone(),
            version: node.version,
        };
        reg.watches
            .data
            .entry(path.to_string())
            .or_default()
            .push(self.id);
        Ok(value)
    }

    /// Register a one-shot children watch; returns the current child list.
    pub fn watch_children(&self, path: &str) -> CoordResult<Vec<String>> {
        validate_path(path)?;
        let mut reg = self.locked()?;
        if !reg.nodes.contains_key(path) {
            return Err(CoordError::NotFound(path.to_string()));
        }
        let children = reg.children_of(path);
        reg.watches
            .children
            .entry(path.to_string())
            .or_default()
            .push(self.id);
        Ok(children)
    }

    /// Orderly close: same teardown as expiry. Further operations on this
    /// session fail with `SessionExpired`.
    pub fn close(&self) {
        self.store.expire_session(self.id);
    }
}
