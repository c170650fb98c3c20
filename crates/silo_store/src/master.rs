//! The active master: acquires `/master`, bootstraps or takes over the
//! cluster, runs the event loop, and exposes the admin surface.
//!
//! Assignment state lives for exactly as long as the `/master` tenure: it is
//! built after the ephemeral is acquired and abandoned when the session
//! ends, at which point a successor rebuilds its own view from the
//! coord-store and the catalog.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use silo_coord::{CoordError, CoordSession, MemoryCoordStore, WatchKind};

use crate::assignment_manager::{AssignmentConfig, AssignmentManager};
use crate::catalog::Catalog;
use crate::dispatcher::{self, DispatcherConfig, MasterEvent};
use crate::layout;
use crate::region::{now_unix_ms, RegionInfo, ServerName, TableState};
use crate::region_states::RegionStateStore;
use crate::rpc::RpcRegistry;
use crate::server_manager::{LogRecovery, ServerManager};

#[derive(Debug, Clone, Copy)]
pub struct MasterConfig {
    pub assignment: AssignmentConfig,
    pub dispatcher: DispatcherConfig,
    /// How long blocking admin operations wait for their terminal state.
    pub admin_op_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            assignment: AssignmentConfig::default(),
            dispatcher: DispatcherConfig::default(),
            admin_op_timeout: Duration::from_secs(60),
        }
    }
}

pub struct Master {
    name: ServerName,
    session: CoordSession,
    catalog: Arc<Catalog>,
    servers: Arc<ServerManager>,
    states: Arc<RegionStateStore>,
    am: Arc<AssignmentManager>,
    cfg: MasterConfig,
}

impl Master {
    /// Acquire mastership and start the event loop. On a fresh cluster this
    /// also kicks off the bootstrap assignment; on takeover it adopts the
    /// in-flight transitions first, then enables handlers.
    pub async fn start(
        store: &MemoryCoordStore,
        catalog: Arc<Catalog>,
        registry: Arc<RpcRegistry>,
        log_recovery: Arc<dyn LogRecovery>,
        name: ServerName,
        cfg: MasterConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let (session, events) = store.connect();
        layout::ensure_base_paths(&session)?;
        acquire_mastership(&session, &name, cfg.admin_op_timeout).await?;

        let servers = Arc::new(ServerManager::new(registry, log_recovery));
        let states = Arc::new(RegionStateStore::new());
        let am = Arc::new(AssignmentManager::new(
            session.clone(),
            catalog.clone(),
            servers.clone(),
            states.clone(),
            cfg.assignment,
        ));
        let master = Arc::new(Self {
            name: name.clone(),
            session: session.clone(),
            catalog,
            servers,
            states,
            am,
            cfg,
        });

        // Fresh start vs takeover: if the meta region has never been placed
        // and nothing is in transition, no previous master got anywhere and
        // this is a fresh cluster.
        let rs_children = session.list(layout::RS_BASE)?;
        let unassigned = session.list(layout::UNASSIGNED_BASE)?;
        let meta_placed = master
            .catalog
            .row(&RegionInfo::meta())?
            .map(|row| row.server.is_some())
            .unwrap_or(false);
        let fresh_start = unassigned.is_empty() && !meta_placed;

        master.am.scan_servers().await?;
        if fresh_start {
            tracing::info!(master = %name, live_servers = rs_children.len(), "fresh cluster start");
        } else {
            tracing::info!(
                master = %name,
                live_servers = rs_children.len(),
                in_transition = unassigned.len(),
                "master takeover"
            );
            master.states.register_region(&RegionInfo::root());
            master.states.register_region(&RegionInfo::meta());
            master.am.reconcile_from_catalog()?;
            master.am.process_existing_transitions().await?;
            master.am.assign_orphaned_regions().await?;
        }

        let rx = dispatcher::spawn(events, master.cfg.dispatcher);
        tokio::spawn(master.clone().run(rx));
        if fresh_start {
            tokio::spawn(master.clone().bootstrap_task());
        }
        Ok(master)
    }

    async fn run(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<MasterEvent>) {
        while let Some(event) = rx.recv().await {
            let result = match event {
                MasterEvent::Coord(ev) => {
                    if ev.kind == WatchKind::SessionExpired {
                        tracing::error!(master = %self.name, "master session expired, yielding");
                        break;
                    }
                    self.am.handle_coord_event(&ev).await
                }
                MasterEvent::TimeoutScan => self.am.process_timeouts().await,
                MasterEvent::Balance => self.am.balance_once().await,
            };
            if let Err(err) = result {
                if err.downcast_ref::<CoordError>().map(|e| matches!(e, CoordError::SessionExpired))
                    == Some(true)
                {
                    tracing::error!(master = %self.name, "master session expired, yielding");
                    break;
                }
                tracing::warn!(master = %self.name, error = %err, "event handler failed");
            }
        }
        tracing::info!(master = %self.name, "master event loop stopped");
    }

    async fn bootstrap_task(self: Arc<Self>) {
        if let Err(err) = self.bootstrap().await {
            tracing::error!(master = %self.name, error = %err, "cluster bootstrap failed");
        }
    }

    /// Fresh-start assignment: wait for servers, clear stale transition
    /// nodes, open root and meta, then bulk-assign the user regions.
    async fn bootstrap(&self) -> anyhow::Result<()> {
        self.wait_for_min_servers().await?;
        self.am.clear_unassigned()?;
        self.am.scan_unassigned().await?;

        for system in [RegionInfo::root(), RegionInfo::meta()] {
            self.states.register_region(&system);
            self.am.assign_system_region(&system).await?;
            let encoded = system.encoded_name().to_string();
            self.wait_until(
                &format!("{} open", system.region_name()),
                || self.states.online_owner(&encoded).is_some(),
                self.cfg.admin_op_timeout,
            )
            .await?;
        }

        let mut user_regions = Vec::new();
        for region in self.catalog.all_user_regions()? {
            match self.am.table_state(&region.table) {
                Some(TableState::Enabled) | None => user_regions.push(region),
                _ => {}
            }
        }
        if !user_regions.is_empty() {
            self.am.bulk_assign(user_regions).await?;
        }
        tracing::info!(master = %self.name, "cluster bootstrap complete");
        Ok(())
    }

    /// Block until `min_servers_to_start` servers are live, or the bounded
    /// wait after the first one lapses.
    async fn wait_for_min_servers(&self) -> anyhow::Result<()> {
        let min = self.cfg.assignment.min_servers_to_start.max(1);
        let mut first_seen: Option<Instant> = None;
        loop {
            let count = self.session.list(layout::RS_BASE)?.len();
            if count >= min {
                break;
            }
            if count > 0 {
                let since = *first_seen.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.cfg.assignment.startup_wait {
                    tracing::warn!(
                        live = count,
                        wanted = min,
                        "starting assignment with fewer servers than configured"
                    );
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.am.scan_servers().await
    }

    pub fn name(&self) -> &ServerName {
        &self.name
    }

    pub fn states(&self) -> &RegionStateStore {
        &self.states
    }

    pub fn assignment_manager(&self) -> &AssignmentManager {
        &self.am
    }

    pub fn live_servers(&self) -> std::collections::BTreeSet<ServerName> {
        self.servers.live_servers()
    }

    /// Simulate master death: the session expires, `/master` vanishes, the
    /// event loop sees the expiry and stops.
    pub fn crash(&self) {
        tracing::warn!(master = %self.name, "simulating master crash");
        self.session.close();
    }

    /// Orderly shutdown yields mastership the same way.
    pub fn stop(&self) {
        self.session.close();
    }

    pub async fn wait_until<F>(&self, what: &str, cond: F, timeout: Duration) -> anyhow::Result<()>
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

    // ---- admin surface ----

    /// Create a table pre-split at `split_keys` and block until every region
    /// is open somewhere.
    pub async fn create_table(
        &self,
        table: &str,
        split_keys: &[Vec<u8>],
    ) -> anyhow::Result<Vec<RegionInfo>> {
        if !self.catalog.regions_of_table(table)?.is_empty() {
            anyhow::bail!("table {table} already exists");
        }
        let mut boundaries = vec![Vec::new()];
        boundaries.extend(split_keys.iter().cloned());
        boundaries.push(Vec::new());
        let region_id = now_unix_ms();
        let mut regions = Vec::new();
        for window in boundaries.windows(2) {
            let region = RegionInfo::new(table, window[0].clone(), window[1].clone(), region_id);
            self.catalog.insert_region(&region)?;
            regions.push(region);
        }
        self.am.set_table_state(table, TableState::Enabled)?;
        self.am.bulk_assign(regions.clone()).await?;
        self.wait_for_table_online(table).await?;
        Ok(regions)
    }

    /// Drop a disabled table's catalog rows.
    pub async fn delete_table(&self, table: &str) -> anyhow::Result<()> {
        match self.am.table_state(table) {
            Some(TableState::Disabled) => {}
            other => anyhow::bail!("table {table} must be disabled to delete (state {other:?})"),
        }
        for row in self.catalog.all_user_rows()? {
            if row.region.table == table {
                self.catalog.delete_region(&row.region)?;
            }
        }
        Ok(())
    }

    /// Enable: fabricate an assignment per region, block until all open.
    pub async fn enable_table(&self, table: &str) -> anyhow::Result<()> {
        if self.am.table_state(table) == Some(TableState::Enabled) {
            anyhow::bail!("table {table} is already enabled");
        }
        self.am.enable_table(table).await?;
        self.wait_for_table_online(table).await?;
        self.am.set_table_state(table, TableState::Enabled)
    }

    /// Disable: close every region with no reopen destination, block until
    /// none are online or in transition.
    pub async fn disable_table(&self, table: &str) -> anyhow::Result<()> {
        if self.am.table_state(table) == Some(TableState::Disabled) {
            anyhow::bail!("table {table} is already disabled");
        }
        self.am.disable_table(table).await?;
        let regions = self.catalog.regions_of_table(table)?;
        self.wait_until(
            &format!("table {table} offline"),
            || {
                regions.iter().all(|region| {
                    let encoded = region.encoded_name();
                    self.states.online_owner(encoded).is_none()
                        && self.states.transition(encoded).is_none()
                })
            },
            self.cfg.admin_op_timeout,
        )
        .await?;
        self.am.set_table_state(table, TableState::Disabled)
    }

    /// Move one region to `destination` (or a balancer-chosen server).
    pub async fn move_region(
        &self,
        region: &RegionInfo,
        destination: Option<ServerName>,
    ) -> anyhow::Result<()> {
        let destination = match destination {
            Some(server) => {
                if !self.servers.is_live(&server) {
                    anyhow::bail!("move destination {server} is not live");
                }
                server
            }
            None => self
                .pick_any_destination(region)
                .context("no destination available for move")?,
        };
        self.am.unassign(region, Some(destination)).await
    }

    /// Run one balancer round now.
    pub async fn balance(&self) -> anyhow::Result<()> {
        self.am.balance_once().await
    }

    /// Ask the hosting server to split a region, optionally at `split_row`.
    pub async fn split_region(
        &self,
        region: &RegionInfo,
        split_row: Option<Vec<u8>>,
    ) -> anyhow::Result<()> {
        let owner = self
            .states
            .online_owner(region.encoded_name())
            .ok_or_else(|| anyhow::anyhow!("{} is not open anywhere", region.region_name()))?;
        self.servers
            .endpoint(&owner)?
            .split_region(region, split_row)
            .await
    }

    async fn wait_for_table_online(&self, table: &str) -> anyhow::Result<()> {
        let regions = self.catalog.regions_of_table(table)?;
        self.wait_until(
            &format!("table {table} online"),
            || {
                regions
                    .iter()
                    .all(|region| self.states.online_owner(region.encoded_name()).is_some())
            },
            self.cfg.admin_op_timeout,
        )
        .await
    }

    fn pick_any_destination(&self, region: &RegionInfo) -> Option<ServerName> {
        let current = self.states.online_owner(region.encoded_name());
        self.servers
            .live_servers()
            .into_iter()
            .find(|server| Some(server) != current.as_ref())
    }
}

/// Take the `/master` ephemeral, waiting out a predecessor whose session has
/// not yet expired.
async fn acquire_mastership(
    session: &CoordSession,
    name: &ServerName,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match session.create(
            layout::MASTER_NODE,
            name.to_string().into_bytes(),
            true,
        ) {
            Ok(()) => {
                tracing::info!(master = %name, "acquired mastership");
                return Ok(());
            }
            Err(CoordError::NodeExists(_)) => {
                if Instant::now() >= deadline {
                    anyhow::bail!("another master is active, gave up waiting");
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(err) => return Err(err).context("acquire /master"),
        }
    }
}
