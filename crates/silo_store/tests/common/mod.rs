//! In-process cluster harness shared by the integration tests.
//!
//! One `MemoryCoordStore` plays the coordination service, the catalog and
//! region data live under a temp dir shared by every server (standing in for
//! the shared filesystem), and the RPC registry is the "network": crashed
//! servers drop out of it and become unreachable.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use silo_coord::MemoryCoordStore;
use silo_store::dispatcher::DispatcherConfig;
use silo_store::region_states::TransitionTimeouts;
use silo_store::{
    AssignmentConfig, Catalog, Master, MasterConfig, NoopLogRecovery, RegionInfo, RegionServer,
    RpcRegistry, ServerName,
};

pub struct TestCluster {
    pub store: MemoryCoordStore,
    pub catalog: Arc<Catalog>,
    pub registry: Arc<RpcRegistry>,
    pub servers: Vec<Arc<RegionServer>>,
    pub master: Option<Arc<Master>>,
    dir: tempfile::TempDir,
    master_incarnation: u64,
}

pub fn server_name(index: usize, start_code: u64) -> ServerName {
    ServerName::new(format!("rs{index}"), 8120, start_code)
}

pub fn fast_master_config(min_servers: usize) -> MasterConfig {
    MasterConfig {
        assignment: AssignmentConfig {
            timeouts: TransitionTimeouts {
                offline: Duration::from_millis(300),
                opening: Duration::from_secs(3),
                opened: Duration::from_secs(3),
                closing: Duration::from_secs(3),
                closed: Duration::from_secs(3),
            },
            min_servers_to_start: min_servers,
            startup_wait: Duration::from_secs(5),
            ..AssignmentConfig::default()
        },
        dispatcher: DispatcherConfig {
            timeout_scan_interval: Duration::from_millis(50),
            // Balancing is triggered explicitly by the tests.
            balance_interval: Duration::from_secs(3600),
            ..DispatcherConfig::default()
        },
        admin_op_timeout: Duration::from_secs(30),
    }
}

impl TestCluster {
    /// Start `servers` region servers and one master, and wait for the
    /// system regions to come online.
    pub async fn start(servers: usize) -> anyhow::Result<TestCluster> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();

        let dir = tempfile::tempdir()?;
        let store = MemoryCoordStore::new();
        let catalog = Arc::new(Catalog::open(dir.path().join("catalog"))?);
        let registry = RpcRegistry::new();

        let mut cluster = TestCluster {
            store,
            catalog,
            registry,
            servers: Vec::new(),
            master: None,
            dir,
            master_incarnation: 0,
        };
        for index in 0..servers {
            cluster.start_server(index, 1)?;
        }
        cluster.start_master(servers).await?;
        cluster.wait_for_system_regions().await?;
        Ok(cluster)
    }

    pub fn data_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("data")
    }

    pub fn start_server(&mut self, index: usize, start_code: u64) -> anyhow::Result<()> {
        let server = RegionServer::start(
            &self.store,
            server_name(index, start_code),
            self.catalog.clone(),
            self.registry.clone(),
            self.data_dir(),
        )?;
        self.servers.push(server);
        Ok(())
    }

    pub async fn start_master(&mut self, min_servers: usize) -> anyhow::Result<()> {
        self.master_incarnation += 1;
        let master = Master::start(
            &self.store,
            self.catalog.clone(),
            self.registry.clone(),
            Arc::new(NoopLogRecovery),
            ServerName::new("master", 8100, self.master_incarnation),
            fast_master_config(min_servers),
        )
        .await?;
        self.master = Some(master);
        Ok(())
    }

    pub fn master(&self) -> &Arc<Master> {
        self.master.as_ref().expect("master running")
    }

    /// Crash a server abruptly; returns its handle for post-mortem asserts.
    pub fn kill_server(&mut self, index: usize) -> Arc<RegionServer> {
        let server = self.servers.remove(index);
        server.crash();
        server
    }

    pub fn server_hosting(&self, encoded: &str) -> Option<&Arc<RegionServer>> {
        self.servers
            .iter()
            .find(|server| server.hosted(encoded).is_some())
    }

    /// How many of the running servers host each region. Any value above 1
    /// is a safety violation.
    pub fn owner_counts(&self, regions: &[RegionInfo]) -> BTreeMap<String, usize> {
        regions
            .iter()
            .map(|region| {
                let encoded = region.encoded_name();
                let hosts = self
                    .servers
                    .iter()
                    .filter(|server| server.hosted(encoded).is_some())
                    .count();
                (encoded.to_string(), hosts)
            })
            .collect()
    }

    pub fn catalog_owner(&self, region: &RegionInfo) -> Option<ServerName> {
        self.catalog
            .row(region)
            .ok()
            .flatten()
            .and_then(|row| row.server)
    }

    async fn wait_for_system_regions(&self) -> anyhow::Result<()> {
        let master = self.master();
        let root = RegionInfo::root();
        let meta = RegionInfo::meta();
        master
            .wait_until(
                "root and meta online",
                || {
                    master.states().online_owner(root.encoded_name()).is_some()
                        && master.states().online_owner(meta.encoded_name()).is_some()
                },
                Duration::from_secs(30),
            )
            .await
    }

    /// Wait until every listed region is open on some running server and
    /// the master agrees.
    pub async fn wait_assigned(&self, regions: &[RegionInfo]) -> anyhow::Result<()> {
        let master = self.master();
        master
            .wait_until(
                "regions assigned",
                || {
                    regions.iter().all(|region| {
                        master.states().online_owner(region.encoded_name()).is_some()
                            && self.server_hosting(region.encoded_name()).is_some()
                    })
                },
                Duration::from_secs(30),
            )
            .await
    }
}

pub async fn wait_until<F>(what: &str, timeout: Duration, cond: F) -> anyhow::Result<()>
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("timed out waiting for {what}")
}

/// Per-table split keys `k0001 … k{n-1}`, giving `n` regions.
pub fn split_keys(regions: usize) -> Vec<Vec<u8>> {
    (1..regions)
        .map(|i| format!("k{i:04}").into_bytes())
        .collect()
}
