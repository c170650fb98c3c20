//! Master → region-server command surface.
//!
//! Wire encoding is out of scope for the assignment core; the trait is the
//! seam. The in-process implementation lives on `RegionServer` itself and is
//! looked up through an [`RpcRegistry`] shared by the whole test cluster,
//! which stands in for the network: deregistered servers are unreachable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::region::{RegionInfo, ServerName};

/// Commands a region server accepts from the master. `open_region` and
/// `close_region` are idempotent: repeating one against a server that has
/// already reached the requested state succeeds without a new transition.
#[async_trait]
pub trait RegionServerRpc: Send + Sync {
    async fn open_region(&self, region: &RegionInfo) -> anyhow::Result<()>;

    async fn close_region(&self, region: &RegionInfo) -> anyhow::Result<()>;

    /// Split with an explicit row, or let the server pick its own midpoint.
    async fn split_region(
        &self,
        region: &RegionInfo,
        split_row: Option<Vec<u8>>,
    ) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct RpcRegistry {
    endpoints: Mutex<HashMap<ServerName, Arc<dyn RegionServerRpc>>>,
}

impl RpcRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, server: ServerName, endpoint: Arc<dyn RegionServerRpc>) {
        self.endpoints
            .lock()
            .expect("rpc registry poisoned")
            .insert(server, endpoint);
    }

    pub fn deregister(&self, server: &ServerName) {
        self.endpoints
            .lock()
            .expect("rpc registry poisoned")
            .remove(server);
    }

    /// Fails with an "unreachable" error when the server has no endpoint;
    /// the caller treats that as possibly-dead and lets timeouts re-drive.
    pub fn endpoint(&self, server: &ServerName) -> anyhow::Result<Arc<dyn RegionServerRpc>> {
        self.endpoints
            .lock()
            .expect("rpc registry poisoned")
            .get(server)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("region server {server} unreachable"))
    }
}
