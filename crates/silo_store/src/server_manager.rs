//! Live region-server tracking on the master.
//!
//! The `/rs` ephemerals are the failure detector: the set of children is the
//! set of live servers, and a departed child is a dead server. Before any of
//! a dead server's regions may be reopened elsewhere, its write-ahead log
//! must be recovered; that collaborator is behind the [`LogRecovery`] trait.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::region::ServerName;
use crate::rpc::{RegionServerRpc, RpcRegistry};

/// Startup metadata a region server publishes in its `/rs` ephemeral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStartupMeta {
    pub start_code: u64,
    pub version: String,
}

impl ServerStartupMeta {
    pub fn for_server(server: &ServerName) -> Self {
        Self {
            start_code: server.start_code,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// WAL replay collaborator. `recover` must complete before any of the dead
/// server's regions are opened on another server.
#[async_trait]
pub trait LogRecovery: Send + Sync {
    async fn recover(&self, server: &ServerName) -> anyhow::Result<()>;
}

/// Default recovery for deployments whose log splitting runs elsewhere.
pub struct NoopLogRecovery;

#[async_trait]
impl LogRecovery for NoopLogRecovery {
    async fn recover(&self, server: &ServerName) -> anyhow::Result<()> {
        tracing::debug!(server = %server, "no-op log recovery");
        Ok(())
    }
}

pub struct ServerManager {
    registry: Arc<RpcRegistry>,
    log_recovery: Arc<dyn LogRecovery>,
    live: Mutex<BTreeSet<ServerName>>,
}

impl ServerManager {
    pub fn new(registry: Arc<RpcRegistry>, log_recovery: Arc<dyn LogRecovery>) -> Self {
        Self {
            registry,
            log_recovery,
            live: Mutex::new(BTreeSet::new()),
        }
    }

    /// Replace the live set from a fresh `/rs` child listing. Returns
    /// `(joined, departed)` relative to the previous view.
    pub fn reconcile_live(&self, children: &[String]) -> (Vec<ServerName>, Vec<ServerName>) {
        let mut parsed = BTreeSet::new();
        for child in children {
            match ServerName::from_str(child) {
                Ok(name) => {
                    parsed.insert(name);
                }
                Err(err) => {
                    tracing::warn!(child = %child, error = %err, "ignoring malformed /rs child");
                }
            }
        }
        let mut live = self.live.lock().expect("server manager poisoned");
        let joined: Vec<ServerName> = parsed.difference(&live).cloned().collect();
        let departed: Vec<ServerName> = live.difference(&parsed).cloned().collect();
        *live = parsed;
        (joined, departed)
    }

    pub fn live_servers(&self) -> BTreeSet<ServerName> {
        self.live.lock().expect("server manager poisoned").clone()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().expect("server manager poisoned").len()
    }

    pub fn is_live(&self, server: &ServerName) -> bool {
        self.live
            .lock()
            .expect("server manager poisoned")
            .contains(server)
    }

    pub fn endpoint(&self, server: &ServerName) -> anyhow::Result<Arc<dyn RegionServerRpc>> {
        self.registry.endpoint(server)
    }

    pub async fn recover_logs(&self, server: &ServerName) -> anyhow::Result<()> {
        self.log_recovery.recover(server).await
    }
}
