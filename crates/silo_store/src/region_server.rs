//! Region server runtime: hosted regions on disk, the server's online map,
//! and the server-side half of the transition protocol.
//!
//! All coord-store writes a region server makes are the four authoritative
//! transitions: create `CLOSING`, CAS `OFFLINE → OPENING`, CAS
//! `CLOSING → CLOSED`, CAS `OPENING → OPENED`. The CAS steps are what make
//! racing servers safe: only one wins `OFFLINE → OPENING`, the loser aborts
//! its open.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;

use silo_coord::{CoordError, CoordSession, MemoryCoordStore, WatchKind};

use crate::catalog::Catalog;
use crate::layout::{self, TransitionNode};
use crate::region::{now_unix_ms, RegionInfo, RegionState, ServerName};
use crate::rpc::{RegionServerRpc, RpcRegistry};
use crate::server_manager::ServerStartupMeta;
use crate::split_transaction::{self, InjectedCrash, RegionHost, SplitTransaction};
use crate::storefile;

/// One region materialized on this server's disk.
///
/// The lock is the region's structural lock: data-plane reads and writes
/// take it shared, close and split take it exclusive.
pub struct HostedRegion {
    info: RegionInfo,
    data_dir: PathBuf,
    pub lock: tokio::sync::RwLock<()>,
    closing: AtomicBool,
    closed: AtomicBool,
    flush_seq: AtomicU64,
}

impl HostedRegion {
    pub fn new(data_dir: PathBuf, info: RegionInfo) -> Self {
        Self {
            info,
            data_dir,
            lock: tokio::sync::RwLock::new(()),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            flush_seq: AtomicU64::new(0),
        }
    }

    pub fn info(&self) -> &RegionInfo {
        &self.info
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn table_dir(&self) -> PathBuf {
        storefile::table_dir(&self.data_dir, &self.info.table)
    }

    pub fn region_dir(&self) -> PathBuf {
        storefile::region_dir(&self.data_dir, &self.info)
    }

    pub fn store_dir(&self) -> PathBuf {
        storefile::store_dir(&self.region_dir())
    }

    pub fn split_dir(&self) -> PathBuf {
        storefile::split_dir(&self.region_dir())
    }

    /// Bring the region online locally: create its directories, clean any
    /// split detritus from a previous deploy, clear the closed flags.
    pub fn initialize(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.store_dir())
            .with_context(|| format!("create region dirs for {}", self.info.region_name()))?;
        split_transaction::cleanup_split_detritus(&self.region_dir(), &self.table_dir())?;
        self.closing.store(false, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_closing(&self, value: bool) {
        self.closing.store(value, Ordering::SeqCst);
    }

    /// Close locally and report the store files present. The caller must
    /// hold the region's write lock.
    pub fn close(&self) -> anyhow::Result<Vec<String>> {
        self.closed.store(true, Ordering::SeqCst);
        let mut files = Vec::new();
        let store = self.store_dir();
        if store.exists() {
            for entry in std::fs::read_dir(&store).with_context(|| format!("list {store:?}"))? {
                let path = entry?.path();
                if storefile::is_store_file(&path) || storefile::is_reference_file(&path) {
                    files.push(
                        path.file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or_default()
                            .to_string(),
                    );
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Append a batch of rows as one new store file.
    pub async fn put_batch(&self, rows: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<()> {
        let _guard = self.lock.read().await;
        if self.is_closed() || self.is_closing() {
            anyhow::bail!("region {} is closing", self.info.region_name());
        }
        let seq = self.flush_seq.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{seq:06}.sf", now_unix_ms());
        storefile::write_store_file(&self.store_dir().join(name), rows)
    }

    /// All rows in `[start, end)` (empty `end` = unbounded), in key order.
    pub async fn scan(&self, start: &[u8], end: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let _guard = self.lock.read().await;
        if self.is_closed() {
            anyhow::bail!("region {} is closed", self.info.region_name());
        }
        let mut merged: std::collections::BTreeMap<Vec<u8>, Vec<u8>> =
            storefile::load_store_rows(&self.store_dir(), &self.table_dir())?
                .into_iter()
                .collect();
        merged.retain(|key, _| key.as_slice() >= start && (end.is_empty() || key.as_slice() < end));
        Ok(merged.into_iter().collect())
    }

    pub fn store_file_count(&self) -> anyhow::Result<usize> {
        Ok(self.list_store_files()?.len())
    }

    pub fn list_store_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        let store = self.store_dir();
        if !store.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&store)
            .with_context(|| format!("list {store:?}"))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| storefile::is_store_file(p) || storefile::is_reference_file(p))
            .collect();
        files.sort();
        Ok(files)
    }
}

pub struct RegionServer {
    name: ServerName,
    session: CoordSession,
    catalog: Arc<Catalog>,
    registry: Arc<RpcRegistry>,
    data_dir: PathBuf,
    online: Mutex<HashMap<String, Arc<HostedRegion>>>,
    cancelled: AtomicBool,
    aborted: AtomicBool,
}

impl RegionServer {
    /// Connect a session, publish the `/rs` ephemeral, and register the RPC
    /// endpoint. The server is live once this returns.
    pub fn start(
        store: &MemoryCoordStore,
        name: ServerName,
        catalog: Arc<Catalog>,
        registry: Arc<RpcRegistry>,
        data_dir: PathBuf,
    ) -> anyhow::Result<Arc<Self>> {
        let (session, mut events) = store.connect();
        layout::ensure_base_paths(&session)?;
        let meta = serde_json::to_vec(&ServerStartupMeta::for_server(&name))
            .context("encode startup metadata")?;
        session
            .create(&layout::rs_node(&name), meta, true)
            .with_context(|| format!("publish /rs ephemeral for {name}"))?;

        let server = Arc::new(Self {
            name: name.clone(),
            session,
            catalog,
            registry: registry.clone(),
            data_dir,
            online: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        });
        registry.register(name.clone(), server.clone());

        // Session watcher: on expiry every in-flight open/close is cancelled
        // and this server stops touching the coord-store for good.
        let watcher = Arc::downgrade(&server);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event.kind == WatchKind::SessionExpired {
                    if let Some(server) = watcher.upgrade() {
                        tracing::warn!(server = %server.name, "coordination session expired, cancelling region work");
                        server.cancelled.store(true, Ordering::SeqCst);
                    }
                    return;
                }
            }
        });
        tracing::info!(server = %name, "region server started");
        Ok(server)
    }

    pub fn name(&self) -> &ServerName {
        &self.name
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn online_regions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .online
            .lock()
            .expect("online map poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn hosted(&self, encoded: &str) -> Option<Arc<HostedRegion>> {
        self.online
            .lock()
            .expect("online map poisoned")
            .get(encoded)
            .cloned()
    }

    /// Simulate abrupt process death: the session expires (dropping the
    /// ephemeral), the endpoint becomes unreachable, nothing is closed
    /// cleanly.
    pub fn crash(&self) {
        tracing::warn!(server = %self.name, "simulating region server crash");
        self.cancelled.store(true, Ordering::SeqCst);
        self.registry.deregister(&self.name);
        self.session.close();
        self.online.lock().expect("online map poisoned").clear();
    }

    fn check_live(&self) -> anyhow::Result<()> {
        if self.cancelled.load(Ordering::SeqCst) || self.aborted.load(Ordering::SeqCst) {
            anyhow::bail!("region server {} is shutting down", self.name);
        }
        Ok(())
    }

    async fn handle_open_region(&self, region: &RegionInfo) -> anyhow::Result<()> {
        self.check_live()?;
        let encoded = region.encoded_name();
        if self.hosted(encoded).is_some() {
            tracing::info!(server = %self.name, region = %region.region_name(), "open request for already-open region");
            return Ok(());
        }

        let path = layout::unassigned_node(encoded);
        let value = self
            .session
            .get(&path)
            .with_context(|| format!("open of {} with no transition node", region.region_name()))?;
        let node = TransitionNode::decode(&value.data)?;
        match node.state {
            RegionState::Offline => {}
            RegionState::Opening if node.server == self.name => {
                // Retried RPC while our own open is still in flight.
                return Ok(());
            }
            other => anyhow::bail!(
                "invalid transition: open of {} found node in {other} for {}",
                region.region_name(),
                node.server
            ),
        }
        if node.server != self.name {
            anyhow::bail!(
                "open of {} intended for {}, not {}",
                region.region_name(),
                node.server,
                self.name
            );
        }

        // The race decider: exactly one server wins this CAS.
        let opening = TransitionNode::new(RegionState::Opening, self.name.clone(), now_unix_ms());
        let opening_version = match self.session.set_data(&path, opening.encode(), value.version) {
            Ok(version) => version,
            Err(CoordError::BadVersion { .. }) => {
                tracing::warn!(
                    server = %self.name,
                    region = %region.region_name(),
                    "lost the opening race, aborting open"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let hosted = Arc::new(HostedRegion::new(self.data_dir.clone(), region.clone()));
        hosted.initialize()?;
        self.check_live()?;

        // Commit order: catalog first, then the OPENED transition, then our
        // own online map. If the master timed out and forced the node back
        // to OFFLINE meanwhile, the CAS loses and we never go online.
        self.post_open_deploy(region)?;
        let opened = TransitionNode::new(RegionState::Opened, self.name.clone(), now_unix_ms());
        match self.session.set_data(&path, opened.encode(), opening_version) {
            Ok(_) => {}
            Err(CoordError::BadVersion { .. }) => {
                tracing::warn!(
                    server = %self.name,
                    region = %region.region_name(),
                    "transition reclaimed before OPENED, abandoning open"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        self.online
            .lock()
            .expect("online map poisoned")
            .insert(encoded.to_string(), hosted);
        tracing::info!(server = %self.name, region = %region.region_name(), "region opened");
        Ok(())
    }

    async fn handle_close_region(&self, region: &RegionInfo) -> anyhow::Result<()> {
        self.check_live()?;
        let encoded = region.encoded_name();
        let Some(hosted) = self.hosted(encoded) else {
            tracing::info!(server = %self.name, region = %region.region_name(), "close request for region not open here");
            return Ok(());
        };

        let path = layout::unassigned_node(encoded);
        let closing = TransitionNode::new(RegionState::Closing, self.name.clone(), now_unix_ms());
        let closing_version = match self.session.create(&path, closing.encode(), false) {
            Ok(()) => 1,
            Err(CoordError::NodeExists(_)) => {
                let value = self.session.get(&path)?;
                let node = TransitionNode::decode(&value.data)?;
                if node.state == RegionState::Closing && node.server == self.name {
                    value.version
                } else {
                    anyhow::bail!(
                        "invalid transition: close of {} found node in {} for {}",
                        region.region_name(),
                        node.state,
                        node.server
                    );
                }
            }
            Err(err) => return Err(err.into()),
        };

        hosted.set_closing(true);
        {
            let _guard = hosted.lock.write().await;
            hosted.close()?;
            self.online
                .lock()
                .expect("online map poisoned")
                .remove(encoded);
        }
        self.check_live()?;

        let closed = TransitionNode::new(RegionState::Closed, self.name.clone(), now_unix_ms());
        match self.session.set_data(&path, closed.encode(), closing_version) {
            Ok(_) => {}
            Err(CoordError::BadVersion { .. }) => {
                // Master already forced the node onward; the close itself is
                // done, so there is nothing left to report.
                tracing::warn!(
                    server = %self.name,
                    region = %region.region_name(),
                    "transition reclaimed before CLOSED"
                );
            }
            Err(err) => return Err(err.into()),
        }
        tracing::info!(server = %self.name, region = %region.region_name(), "region closed");
        Ok(())
    }

    async fn handle_split_region(
        &self,
        region: &RegionInfo,
        split_row: Option<Vec<u8>>,
    ) -> anyhow::Result<()> {
        self.check_live()?;
        let hosted = self
            .hosted(region.encoded_name())
            .ok_or_else(|| anyhow::anyhow!("split of {} not open here", region.region_name()))?;
        let split_row = match split_row {
            Some(row) => row,
            None => self.pick_split_row(&hosted).await?,
        };

        let txn = SplitTransaction::new(hosted, split_row);
        match txn.run(self).await {
            Ok(_) => Ok(()),
            Err(err) if err.downcast_ref::<InjectedCrash>().is_some() => {
                self.crash();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Server-side split point: the median key of the region's rows.
    async fn pick_split_row(&self, hosted: &HostedRegion) -> anyhow::Result<Vec<u8>> {
        let rows = hosted
            .scan(&hosted.info().start_key.clone(), &hosted.info().end_key.clone())
            .await?;
        let midpoint = rows
            .get(rows.len() / 2)
            .map(|(key, _)| key.clone())
            .filter(|key| key != &hosted.info().start_key)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no usable split point in {}",
                    hosted.info().region_name()
                )
            })?;
        Ok(midpoint)
    }

    fn post_open_deploy(&self, region: &RegionInfo) -> anyhow::Result<()> {
        self.catalog.update_region_location(region, &self.name)
    }
}

#[async_trait]
impl RegionServerRpc for RegionServer {
    async fn open_region(&self, region: &RegionInfo) -> anyhow::Result<()> {
        self.handle_open_region(region).await
    }

    async fn close_region(&self, region: &RegionInfo) -> anyhow::Result<()> {
        self.handle_close_region(region).await
    }

    async fn split_region(
        &self,
        region: &RegionInfo,
        split_row: Option<Vec<u8>>,
    ) -> anyhow::Result<()> {
        self.handle_split_region(region, split_row).await
    }
}

impl RegionHost for RegionServer {
    fn server_name(&self) -> &ServerName {
        &self.name
    }

    fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn remove_from_online(&self, encoded: &str) {
        self.online
            .lock()
            .expect("online map poisoned")
            .remove(encoded);
    }

    fn add_to_online(&self, region: Arc<HostedRegion>) {
        self.online
            .lock()
            .expect("online map poisoned")
            .insert(region.info().encoded_name().to_string(), region);
    }

    fn abort_process(&self, reason: &str) {
        tracing::error!(server = %self.name, reason, "aborting region server");
        self.aborted.store(true, Ordering::SeqCst);
        self.registry.deregister(&self.name);
        self.session.close();
        self.online.lock().expect("online map poisoned").clear();
    }
}
