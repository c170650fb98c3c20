//! Coordination-store capability layer.
//!
//! The assignment core offloads consensus to a strongly-consistent metadata
//! service with a hierarchical namespace: versioned nodes, compare-and-set
//! updates, session-bound ephemeral nodes, and one-shot watches. This crate
//! exposes that capability surface plus an in-process implementation
//! ([`MemoryCoordStore`]) used by tests, the demo binary, and embedded
//! deployments.
//!
//! Semantics intentionally mirror the usual coordination-service contract:
//! - every node carries a version that increases by one per data change;
//! - `set_data`/`delete` are conditional on the caller's expected version;
//! - ephemeral nodes vanish when their owning session expires;
//! - each watch registration delivers at most one event, on the session's
//!   single event channel, in the order the triggering mutations happened.

mod memory;

pub use memory::{CoordSession, MemoryCoordStore, SessionId};

use thiserror::Error;

/// Errors surfaced by coordination-store operations.
///
/// Callers branch on these variants: `BadVersion` means "reconcile from the
/// current state, never overwrite blindly"; `SessionExpired` means "abort and
/// restart watches after reconnect".
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("coord node not found: {0}")]
    NotFound(String),

    #[error("coord node already exists: {0}")]
    NodeExists(String),

    #[error("bad version on {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("coordination session expired")]
    SessionExpired,

    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

pub type CoordResult<T> = Result<T, CoordError>;

/// A node read: payload bytes plus the version to use for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeValue {
    pub data: Vec<u8>,
    pub version: u64,
}

/// What a fired watch observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    NodeCreated,
    NodeDataChanged,
    NodeDeleted,
    ChildrenChanged,
    /// The watching session itself is gone. Delivered once, last.
    SessionExpired,
}

/// A single watch notification. `path` is the registered path (for a
/// children watch, the parent).
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchKind,
}

impl WatchEvent {
    pub(crate) fn new(path: impl Into<String>, kind: WatchKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Split `/a/b/c` into parent `/a/b` and leaf `c`. Root-level nodes have the
/// empty string as parent.
pub(crate) fn split_path(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind('/')?;
    Some((&path[..idx], &path[idx + 1..]))
}

/// Reject paths that are not absolute, normalized node paths.
pub(crate) fn validate_path(path: &str) -> CoordResult<()> {
    let ok = path.starts_with('/')
        && path.len() > 1
        && !path.ends_with('/')
        && !path.contains("//");
    if ok {
        Ok(())
    } else {
        Err(CoordError::Unavailable(format!("malformed path: {path:?}")))
    }
}
