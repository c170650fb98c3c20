//! The region-transition state machine.
//!
//! The master drives regions between servers through `/unassigned` nodes:
//! it writes `OFFLINE` (the only state it has unilateral authority to force)
//! and reacts to the server-written states it observes. Every reaction here
//! is idempotent against re-delivered watch events, because the node is
//! re-read at its current version before acting and every coord-store write
//! is version-checked. In-flight transitions that stall are caught by the
//! timeout scan and forced back to `OFFLINE`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::stream::{self, StreamExt};
use rand::thread_rng;
use silo_coord::{CoordError, CoordSession, WatchEvent, WatchKind};

use crate::balancer;
use crate::catalog::Catalog;
use crate::layout::{self, TransitionNode};
use crate::region::{now_unix_ms, RegionInfo, RegionState, ServerName, TableState};
use crate::region_states::{RegionPlan, RegionStateStore, TransitionTimeouts};
use crate::server_manager::ServerManager;

#[derive(Debug, Clone, Copy)]
pub struct AssignmentConfig {
    pub timeouts: TransitionTimeouts,
    /// Parallelism cap for bulk OPEN fan-out at cluster start.
    pub bulk_open_concurrency: usize,
    pub min_servers_to_start: usize,
    /// Bounded wait for more servers after the first one appears.
    pub startup_wait: Duration,
    pub force_offline_retries: usize,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            timeouts: TransitionTimeouts::default(),
            bulk_open_concurrency: 16,
            min_servers_to_start: 1,
            startup_wait: Duration::from_secs(30),
            force_offline_retries: 5,
        }
    }
}

pub struct AssignmentManager {
    session: CoordSession,
    catalog: Arc<Catalog>,
    servers: Arc<ServerManager>,
    states: Arc<RegionStateStore>,
    cfg: AssignmentConfig,
}

impl AssignmentManager {
    pub fn new(
        session: CoordSession,
        catalog: Arc<Catalog>,
        servers: Arc<ServerManager>,
        states: Arc<RegionStateStore>,
        cfg: AssignmentConfig,
    ) -> Self {
        Self {
            session,
            catalog,
            servers,
            states,
            cfg,
        }
    }

    pub fn states(&self) -> &RegionStateStore {
        &self.states
    }

    // ---- event entry points (dispatcher thread) ----

    pub async fn handle_coord_event(&self, event: &WatchEvent) -> anyhow::Result<()> {
        match event.kind {
            WatchKind::SessionExpired => {
                anyhow::bail!("assignment manager session expired")
            }
            _ => {}
        }
        if event.path == layout::UNASSIGNED_BASE {
            self.scan_unassigned().await
        } else if event.path == layout::RS_BASE {
            self.scan_servers().await
        } else if let Some(encoded) = event.path.strip_prefix("/unassigned/") {
            if event.kind == WatchKind::NodeDeleted {
                // Deletions are performed by their handler; nothing to do.
                return Ok(());
            }
            self.examine_region(encoded).await
        } else {
            tracing::debug!(path = %event.path, "ignoring watch event outside assignment namespace");
            Ok(())
        }
    }

    /// Re-register the `/unassigned` children watch and examine every child.
    pub async fn scan_unassigned(&self) -> anyhow::Result<()> {
        let children = self
            .session
            .watch_children(layout::UNASSIGNED_BASE)
            .context("watch /unassigned children")?;
        for encoded in children {
            self.examine_region(&encoded).await?;
        }
        Ok(())
    }

    /// Re-register the `/rs` children watch, reconcile the live set, and
    /// process any departures.
    pub async fn scan_servers(&self) -> anyhow::Result<()> {
        let children = self
            .session
            .watch_children(layout::RS_BASE)
            .context("watch /rs children")?;
        let (joined, departed) = self.servers.reconcile_live(&children);
        for server in joined {
            tracing::info!(server = %server, "region server joined");
        }
        for server in departed {
            self.handle_server_down(&server).await?;
        }
        Ok(())
    }

    /// Read a region's transition node at its current version (registering
    /// a fresh watch) and react to the state found there.
    pub async fn examine_region(&self, encoded: &str) -> anyhow::Result<()> {
        let path = layout::unassigned_node(encoded);
        let value = match self.session.watch_data(&path) {
            Ok(value) => value,
            Err(CoordError::NotFound(_)) => return Ok(()),
            Err(CoordError::SessionExpired) => return Err(CoordError::SessionExpired.into()),
            Err(err) => {
                tracing::warn!(region = encoded, error = %err, "failed reading transition node");
                return Ok(());
            }
        };
        let node = match TransitionNode::decode(&value.data) {
            Ok(node) => node,
            Err(err) => {
                tracing::warn!(region = encoded, error = %err, "malformed transition node");
                return Ok(());
            }
        };
        match node.state {
            RegionState::Offline | RegionState::Opening | RegionState::Closing => {
                self.states
                    .update_transition(encoded, node.state, node.server);
                Ok(())
            }
            RegionState::Opened => self.region_opened(encoded, &node, value.version).await,
            RegionState::Closed => self.region_closed(encoded, &node).await,
        }
    }

    /// Commit an observed `OPENED`: catalog first, then delete the node,
    /// then the in-memory bookkeeping.
    async fn region_opened(
        &self,
        encoded: &str,
        node: &TransitionNode,
        version: u64,
    ) -> anyhow::Result<()> {
        let Some(region) = self.lookup_region(encoded) else {
            tracing::error!(region = encoded, "OPENED for unknown region, deleting node");
            self.delete_node(&layout::unassigned_node(encoded), version)?;
            self.states.clear_transition(encoded);
            return Ok(());
        };
        self.catalog.update_region_location(&region, &node.server)?;
        self.delete_node(&layout::unassigned_node(encoded), version)?;
        self.states.clear_transition(encoded);
        self.states.set_online(encoded, &node.server);
        self.states.clear_plan(encoded);
        tracing::info!(
            region = %region.region_name(),
            server = %node.server,
            "region open committed"
        );
        Ok(())
    }

    /// React to an observed `CLOSED` according to the plan: stop (disable),
    /// or drive onward to `OFFLINE` and reopen at the destination.
    async fn region_closed(&self, encoded: &str, node: &TransitionNode) -> anyhow::Result<()> {
        self.states
            .update_transition(encoded, RegionState::Closed, node.server.clone());
        self.states.set_offline(encoded);

        let plan = self.states.plan(encoded);
        match plan.as_ref().map(|p| p.destination.clone()) {
            Some(None) => {
                // Disable: the region stays down.
                let value = self.session.get(&layout::unassigned_node(encoded));
                if let Ok(value) = value {
                    self.delete_node(&layout::unassigned_node(encoded), value.version)?;
                }
                self.states.clear_transition(encoded);
                self.states.clear_plan(encoded);
                tracing::info!(region = encoded, "region closed and kept offline");
                Ok(())
            }
            Some(Some(_)) | None => self.redrive(encoded).await,
        }
    }

    // ---- assignment primitives ----

    /// Steady-state assign: force the node to `OFFLINE` naming the
    /// destination, record the plan, and issue the OPEN.
    pub async fn assign(&self, region: &RegionInfo, destination: &ServerName) -> anyhow::Result<()> {
        let encoded = region.encoded_name().to_string();
        self.states.register_region(region);
        self.states.set_plan(RegionPlan {
            region: region.clone(),
            source: self.states.online_owner(&encoded),
            destination: Some(destination.clone()),
        });
        self.force_offline(region, destination)?;
        self.watch_region(&encoded);
        self.send_open(region, destination).await;
        Ok(())
    }

    /// Close a region on its current owner. `destination: None` means "do
    /// not reopen" (table disable); otherwise the region continues to the
    /// destination once `CLOSED` is observed.
    pub async fn unassign(
        &self,
        region: &RegionInfo,
        destination: Option<ServerName>,
    ) -> anyhow::Result<()> {
        let encoded = region.encoded_name().to_string();
        self.states.register_region(region);
        let source = match self.states.online_owner(&encoded) {
            Some(server) => Some(server),
            None => self.catalog.row(region)?.and_then(|row| row.server),
        };
        self.states.set_plan(RegionPlan {
            region: region.clone(),
            source: source.clone(),
            destination,
        });

        let Some(owner) = source else {
            tracing::warn!(region = %region.region_name(), "unassign with no known owner");
            return Ok(());
        };
        // The owner creates the CLOSING node; watch for it to appear.
        if let Err(err) = self.session.watch_exists(&layout::unassigned_node(&encoded)) {
            tracing::warn!(region = %region.region_name(), error = %err, "failed to watch for close");
        }
        match self.servers.endpoint(&owner) {
            Ok(endpoint) => {
                if let Err(err) = endpoint.close_region(region).await {
                    tracing::warn!(
                        region = %region.region_name(),
                        server = %owner,
                        error = %err,
                        "close rpc failed, timeout will re-drive"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    region = %region.region_name(),
                    server = %owner,
                    error = %err,
                    "close target unreachable, treating as possibly dead"
                );
            }
        }
        Ok(())
    }

    /// Write `OFFLINE` into the region's node whatever its current state.
    /// Every write is version-checked; a concurrent writer only costs a
    /// retry, never a blind overwrite.
    fn force_offline(&self, region: &RegionInfo, destination: &ServerName) -> anyhow::Result<()> {
        let encoded = region.encoded_name();
        let path = layout::unassigned_node(encoded);
        let payload =
            TransitionNode::new(RegionState::Offline, destination.clone(), now_unix_ms()).encode();
        for _ in 0..self.cfg.force_offline_retries.max(1) {
            match self.session.create(&path, payload.clone(), false) {
                Ok(()) => {
                    self.states
                        .update_transition(encoded, RegionState::Offline, destination.clone());
                    return Ok(());
                }
                Err(CoordError::NodeExists(_)) => {}
                Err(err) => return Err(err).context("create OFFLINE node"),
            }
            let value = match self.session.get(&path) {
                Ok(value) => value,
                Err(CoordError::NotFound(_)) => continue,
                Err(err) => return Err(err).context("read node for force OFFLINE"),
            };
            match self.session.set_data(&path, payload.clone(), value.version) {
                Ok(_) => {
                    self.states
                        .update_transition(encoded, RegionState::Offline, destination.clone());
                    return Ok(());
                }
                Err(CoordError::BadVersion { .. }) => continue,
                Err(err) => return Err(err).context("CAS node to OFFLINE"),
            }
        }
        anyhow::bail!(
            "could not force {} OFFLINE after {} attempts",
            region.region_name(),
            self.cfg.force_offline_retries
        )
    }

    fn watch_region(&self, encoded: &str) {
        if let Err(err) = self.session.watch_data(&layout::unassigned_node(encoded)) {
            tracing::debug!(region = encoded, error = %err, "could not watch transition node");
        }
    }

    async fn send_open(&self, region: &RegionInfo, destination: &ServerName) {
        match self.servers.endpoint(destination) {
            Ok(endpoint) => {
                if let Err(err) = endpoint.open_region(region).await {
                    tracing::warn!(
                        region = %region.region_name(),
                        server = %destination,
                        error = %err,
                        "open rpc failed, timeout will re-drive"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    region = %region.region_name(),
                    server = %destination,
                    error = %err,
                    "open target unreachable, timeout will re-drive"
                );
            }
        }
    }

    /// Force a stalled or orphaned region back to `OFFLINE` and reopen it at
    /// its planned destination, or a fresh one when the plan is unusable.
    async fn redrive(&self, encoded: &str) -> anyhow::Result<()> {
        let Some(region) = self.lookup_region(encoded) else {
            tracing::warn!(region = encoded, "cannot re-drive unknown region");
            return Ok(());
        };
        // A row marked offline is a split parent (or disabled remnant); its
        // daughters own the range now and reopening it would fork history.
        if let Some(row) = self.catalog.row(&region)? {
            if row.offline {
                tracing::info!(
                    region = %region.region_name(),
                    "catalog marks region offline, not reassigning"
                );
                self.states.clear_plan(encoded);
                return Ok(());
            }
        }
        let planned = self
            .states
            .plan(encoded)
            .and_then(|p| p.destination)
            .filter(|dest| self.servers.is_live(dest));
        let destination = match planned.or_else(|| self.pick_destination()) {
            Some(dest) => dest,
            None => {
                tracing::warn!(region = %region.region_name(), "no live servers to re-drive onto");
                return Ok(());
            }
        };
        self.assign(&region, &destination).await
    }

    fn pick_destination(&self) -> Option<ServerName> {
        let loads = self.states.server_loads(&self.servers.live_servers());
        balancer::random_assignment(&loads, &mut thread_rng())
    }

    // ---- failure handling ----

    /// A region server's ephemeral is gone. Its log is recovered first, then
    /// everything it hosted or was involved in moving gets re-driven.
    pub async fn handle_server_down(&self, server: &ServerName) -> anyhow::Result<()> {
        tracing::warn!(server = %server, "region server down");
        if let Err(err) = self.servers.recover_logs(server).await {
            // Replay failure policy is an open problem; reassigning anyway
            // keeps availability at the cost of unreplayed edits.
            tracing::error!(server = %server, error = %err, "log recovery failed, reassigning regardless");
        }

        let hosted = self.states.remove_server(server);
        for (encoded, transition) in self.states.transitions_snapshot() {
            let plan = self.states.plan(&encoded);
            let dead_wrote_node = &transition.server == server;
            let dead_is_destination =
                plan.as_ref().and_then(|p| p.destination.as_ref()) == Some(server);
            match transition.state {
                RegionState::Offline => {
                    if dead_wrote_node || dead_is_destination {
                        self.redrive(&encoded).await?;
                    }
                }
                RegionState::Opening | RegionState::Opened => {
                    if dead_wrote_node {
                        self.redrive(&encoded).await?;
                    }
                }
                RegionState::Closing => {
                    if dead_wrote_node {
                        // The closing owner died; force OFFLINE and re-plan.
                        self.redrive(&encoded).await?;
                    } else if dead_is_destination {
                        // Close continues on the live source; retarget only.
                        if let Some(mut plan) = plan {
                            plan.destination = self.pick_destination();
                            self.states.set_plan(plan);
                        }
                    }
                }
                RegionState::Closed => {
                    if dead_is_destination {
                        self.redrive(&encoded).await?;
                    }
                    // Dead source: the normal CLOSED handler proceeds.
                }
            }
        }

        for encoded in hosted {
            if self.states.transition(&encoded).is_none() {
                self.redrive(&encoded).await?;
            }
        }
        Ok(())
    }

    /// Timeout scan: anything that has sat in one state past its budget is
    /// re-examined (terminal states) or forced back to `OFFLINE`.
    pub async fn process_timeouts(&self) -> anyhow::Result<()> {
        let expired = self
            .states
            .expired_transitions(Instant::now(), &self.cfg.timeouts);
        for (encoded, transition) in expired {
            tracing::warn!(
                region = %encoded,
                state = %transition.state,
                "transition timed out"
            );
            match transition.state {
                RegionState::Opened | RegionState::Closed => {
                    // A missed event; re-read the node and run its handler.
                    self.examine_region(&encoded).await?;
                }
                RegionState::Offline | RegionState::Opening | RegionState::Closing => {
                    self.redrive(&encoded).await?;
                }
            }
        }
        Ok(())
    }

    // ---- bulk operations ----

    /// Plan all `regions` across the live servers and open them with bounded
    /// parallelism.
    pub async fn bulk_assign(&self, regions: Vec<RegionInfo>) -> anyhow::Result<()> {
        let live: Vec<ServerName> = self.servers.live_servers().into_iter().collect();
        if live.is_empty() {
            anyhow::bail!("bulk assign with no live region servers");
        }
        let plan = balancer::bulk_assignment(&regions, &live);
        let assignments: Vec<(RegionInfo, ServerName)> = plan
            .into_iter()
            .flat_map(|(server, regions)| regions.into_iter().map(move |r| (r, server.clone())))
            .collect();
        tracing::info!(
            regions = assignments.len(),
            servers = live.len(),
            "bulk assigning regions"
        );
        stream::iter(assignments)
            .map(|(region, server)| async move {
                if let Err(err) = self.assign(&region, &server).await {
                    tracing::warn!(
                        region = %region.region_name(),
                        server = %server,
                        error = %err,
                        "bulk assign entry failed"
                    );
                }
            })
            .buffer_unordered(self.cfg.bulk_open_concurrency.max(1))
            .collect::<Vec<()>>()
            .await;
        Ok(())
    }

    /// Assign a system region by two-server random choice.
    pub async fn assign_system_region(&self, region: &RegionInfo) -> anyhow::Result<()> {
        let loads = self.states.server_loads(&self.servers.live_servers());
        let destination = balancer::random_assignment(&loads, &mut thread_rng())
            .ok_or_else(|| anyhow::anyhow!("no live servers for {}", region.region_name()))?;
        self.assign(region, &destination).await
    }

    // ---- table lifecycle ----

    pub async fn enable_table(&self, table: &str) -> anyhow::Result<()> {
        self.set_table_state(table, TableState::Enabling)?;
        let regions = self.catalog.regions_of_table(table)?;
        if regions.is_empty() {
            anyhow::bail!("table {table} has no catalog regions");
        }
        self.bulk_assign(regions).await
    }

    pub async fn disable_table(&self, table: &str) -> anyhow::Result<()> {
        self.set_table_state(table, TableState::Disabling)?;
        for region in self.catalog.regions_of_table(table)? {
            self.unassign(&region, None).await?;
        }
        Ok(())
    }

    pub fn set_table_state(&self, table: &str, state: TableState) -> anyhow::Result<()> {
        let path = layout::table_node(table);
        let payload = state.as_str().as_bytes().to_vec();
        match self.session.create(&path, payload.clone(), false) {
            Ok(()) => return Ok(()),
            Err(CoordError::NodeExists(_)) => {}
            Err(err) => return Err(err).context("create table state node"),
        }
        for _ in 0..self.cfg.force_offline_retries.max(1) {
            let value = self.session.get(&path).context("read table state node")?;
            match self.session.set_data(&path, payload.clone(), value.version) {
                Ok(_) => return Ok(()),
                Err(CoordError::BadVersion { .. }) => continue,
                Err(err) => return Err(err).context("update table state node"),
            }
        }
        anyhow::bail!("could not update table state for {table}")
    }

    pub fn table_state(&self, table: &str) -> Option<TableState> {
        let value = self.session.get(&layout::table_node(table)).ok()?;
        TableState::parse(std::str::from_utf8(&value.data).ok()?).ok()
    }

    // ---- balancing ----

    /// One balancer round: refresh placement from the catalog, then enact
    /// the advisory moves. Skipped while anything is already in transition.
    pub async fn balance_once(&self) -> anyhow::Result<()> {
        self.reconcile_from_catalog()?;
        if self.states.in_transition_count() > 0 {
            tracing::debug!("skipping balance while regions are in transition");
            return Ok(());
        }
        let placement = self.states.placement_snapshot(&self.servers.live_servers());
        let moves = balancer::balance(&placement, &HashMap::new());
        if moves.is_empty() {
            return Ok(());
        }
        tracing::info!(moves = moves.len(), "enacting balancer plan");
        for mv in moves {
            let Some(region) = self.lookup_region(&mv.region) else {
                continue;
            };
            self.unassign(&region, Some(mv.destination)).await?;
        }
        Ok(())
    }

    /// Fold committed catalog placement into the in-memory view: split
    /// daughters appear, split parents disappear. Regions mid-transition and
    /// tables that are not enabled are left alone.
    pub fn reconcile_from_catalog(&self) -> anyhow::Result<()> {
        let mut rows = self.catalog.all_user_rows()?;
        for system in [RegionInfo::root(), RegionInfo::meta()] {
            if let Some(row) = self.catalog.row(&system)? {
                rows.push(row);
            }
        }
        for row in rows {
            let encoded = row.region.encoded_name().to_string();
            if row.offline {
                if self.states.transition(&encoded).is_none() {
                    self.states.set_offline(&encoded);
                }
                continue;
            }
            if !row.region.is_system() {
                match self.table_state(&row.region.table) {
                    Some(TableState::Enabled) | None => {}
                    _ => continue,
                }
            }
            self.states.register_region(&row.region);
            if let Some(server) = &row.server {
                if self.servers.is_live(server)
                    && self.states.transition(&encoded).is_none()
                    && self.states.online_owner(&encoded).is_none()
                {
                    self.states.set_online(&encoded, server);
                }
            }
        }
        Ok(())
    }

    /// Takeover sweep for regions with no live home: committed rows whose
    /// recorded server is dead (or absent) and that are not mid-transition
    /// get re-driven. Disabled tables and split parents are left alone.
    pub async fn assign_orphaned_regions(&self) -> anyhow::Result<()> {
        let mut rows = self.catalog.all_user_rows()?;
        for system in [RegionInfo::root(), RegionInfo::meta()] {
            // A system region with no row yet has never been placed; it is
            // the most orphaned of all.
            rows.push(self.catalog.row(&system)?.unwrap_or(crate::catalog::CatalogRow {
                region: system,
                server: None,
                offline: false,
                split: false,
                daughters: None,
            }));
        }
        for row in rows {
            if row.offline {
                continue;
            }
            let encoded = row.region.encoded_name().to_string();
            if self.states.transition(&encoded).is_some() {
                continue;
            }
            if !row.region.is_system() {
                match self.table_state(&row.region.table) {
                    Some(TableState::Enabled) | None => {}
                    _ => continue,
                }
            }
            let homeless = match &row.server {
                Some(server) => !self.servers.is_live(server),
                None => true,
            };
            if homeless {
                tracing::info!(region = %row.region.region_name(), "re-driving orphaned region");
                self.redrive(&encoded).await?;
            }
        }
        Ok(())
    }

    // ---- master failover ----

    /// Failover scan, run before handlers are enabled: adopt every existing
    /// transition node. `OFFLINE`/`CLOSED` are re-driven immediately,
    /// `OPENING`/`CLOSING` are left for their owners or the timeout scan,
    /// `OPENED` is committed.
    pub async fn process_existing_transitions(&self) -> anyhow::Result<()> {
        let children = self
            .session
            .watch_children(layout::UNASSIGNED_BASE)
            .context("scan /unassigned on takeover")?;
        for encoded in children {
            let path = layout::unassigned_node(&encoded);
            let value = match self.session.watch_data(&path) {
                Ok(value) => value,
                Err(CoordError::NotFound(_)) => continue,
                Err(err) => return Err(err).context("read transition on takeover"),
            };
            let node = match TransitionNode::decode(&value.data) {
                Ok(node) => node,
                Err(err) => {
                    tracing::warn!(region = %encoded, error = %err, "malformed node on takeover");
                    continue;
                }
            };
            tracing::info!(region = %encoded, state = %node.state, "adopting in-flight transition");
            self.states
                .update_transition(&encoded, node.state, node.server.clone());
            match node.state {
                RegionState::Offline | RegionState::Closed => self.redrive(&encoded).await?,
                RegionState::Opening | RegionState::Closing => {}
                RegionState::Opened => self.region_opened(&encoded, &node, value.version).await?,
            }
        }
        Ok(())
    }

    /// Fresh start only: clear stale transition nodes from a previous
    /// incarnation of the cluster.
    pub fn clear_unassigned(&self) -> anyhow::Result<()> {
        let children = self
            .session
            .list(layout::UNASSIGNED_BASE)
            .context("list /unassigned for fresh start")?;
        for encoded in children {
            let path = layout::unassigned_node(&encoded);
            if let Ok(value) = self.session.get(&path) {
                self.delete_node(&path, value.version)?;
            }
        }
        Ok(())
    }

    // ---- helpers ----

    fn lookup_region(&self, encoded: &str) -> Option<RegionInfo> {
        if let Some(region) = self.states.region(encoded) {
            return Some(region);
        }
        for system in [RegionInfo::root(), RegionInfo::meta()] {
            if system.encoded_name() == encoded {
                return Some(system);
            }
        }
        self.catalog
            .all_user_rows()
            .ok()?
            .into_iter()
            .map(|row| row.region)
            .find(|region| region.encoded_name() == encoded)
    }

    /// Versioned delete with reconcile-and-retry on interleaved writes.
    fn delete_node(&self, path: &str, version: u64) -> anyhow::Result<()> {
        let mut expected = version;
        for _ in 0..self.cfg.force_offline_retries.max(1) {
            match self.session.delete(path, expected) {
                Ok(()) | Err(CoordError::NotFound(_)) => return Ok(()),
                Err(CoordError::BadVersion { actual, .. }) => {
                    expected = actual;
                }
                Err(err) => return Err(err).with_context(|| format!("delete node {path}")),
            }
        }
        anyhow::bail!("could not delete node {path}")
    }
}
