//! Master-side in-memory view of assignment state: regions in transition,
//! current plans, and which server each open region is believed to be on.
//!
//! Everything lives behind one lock. After reconciliation the
//! `in_transition` map matches the set of live coord-store transition nodes;
//! a region absent from it is either open (tracked in `online`) or not part
//! of the cluster at all.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::region::{RegionInfo, RegionState, ServerName};

/// Intended placement for one region. `destination: None` encodes "do not
/// reopen" and drives table disable.
#[derive(Debug, Clone)]
pub struct RegionPlan {
    pub region: RegionInfo,
    pub source: Option<ServerName>,
    pub destination: Option<ServerName>,
}

#[derive(Debug, Clone)]
pub struct RegionTransition {
    pub state: RegionState,
    pub server: ServerName,
    pub start: Instant,
    pub last_update: Instant,
}

/// Per-state transition deadlines. A region that sits in one state longer
/// than its budget is forced back to `OFFLINE` and re-driven.
#[derive(Debug, Clone, Copy)]
pub struct TransitionTimeouts {
    pub offline: Duration,
    pub opening: Duration,
    pub opened: Duration,
    pub closing: Duration,
    pub closed: Duration,
}

impl Default for TransitionTimeouts {
    fn default() -> Self {
        Self {
            offline: Duration::from_secs(10),
            opening: Duration::from_secs(30),
            opened: Duration::from_secs(30),
            closing: Duration::from_secs(30),
            closed: Duration::from_secs(30),
        }
    }
}

impl TransitionTimeouts {
    fn budget(&self, state: RegionState) -> Duration {
        match state {
            RegionState::Offline => self.offline,
            RegionState::Opening => self.opening,
            RegionState::Opened => self.opened,
            RegionState::Closing => self.closing,
            RegionState::Closed => self.closed,
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Descriptor registry: every region the master currently knows about.
    regions: HashMap<String, RegionInfo>,
    in_transition: HashMap<String, RegionTransition>,
    plans: HashMap<String, RegionPlan>,
    online: HashMap<String, ServerName>,
    server_regions: HashMap<ServerName, BTreeSet<String>>,
}

#[derive(Default)]
pub struct RegionStateStore {
    inner: Mutex<Inner>,
}

impl RegionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("region state store poisoned")
    }

    pub fn register_region(&self, region: &RegionInfo) {
        self.locked()
            .regions
            .insert(region.encoded_name().to_string(), region.clone());
    }

    pub fn region(&self, encoded: &str) -> Option<RegionInfo> {
        self.locked().regions.get(encoded).cloned()
    }

    /// Record an observed transition. The start timestamp survives updates
    /// within one transition; `last_update` feeds the timeout scan.
    pub fn update_transition(&self, encoded: &str, state: RegionState, server: ServerName) {
        let now = Instant::now();
        let mut inner = self.locked();
        match inner.in_transition.get_mut(encoded) {
            Some(t) => {
                t.state = state;
                t.server = server;
                t.last_update = now;
            }
            None => {
                inner.in_transition.insert(
                    encoded.to_string(),
                    RegionTransition {
                        state,
                        server,
                        start: now,
                        last_update: now,
                    },
                );
            }
        }
    }

    pub fn clear_transition(&self, encoded: &str) -> Option<RegionTransition> {
        self.locked().in_transition.remove(encoded)
    }

    pub fn transition(&self, encoded: &str) -> Option<RegionTransition> {
        self.locked().in_transition.get(encoded).cloned()
    }

    pub fn transitions_snapshot(&self) -> Vec<(String, RegionTransition)> {
        self.locked()
            .in_transition
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn in_transition_count(&self) -> usize {
        self.locked().in_transition.len()
    }

    /// Transitions whose per-state budget has lapsed.
    pub fn expired_transitions(
        &self,
        now: Instant,
        timeouts: &TransitionTimeouts,
    ) -> Vec<(String, RegionTransition)> {
        self.locked()
            .in_transition
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_update) >= timeouts.budget(t.state))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn set_plan(&self, plan: RegionPlan) {
        let mut inner = self.locked();
        inner
            .regions
            .insert(plan.region.encoded_name().to_string(), plan.region.clone());
        inner
            .plans
            .insert(plan.region.encoded_name().to_string(), plan);
    }

    pub fn plan(&self, encoded: &str) -> Option<RegionPlan> {
        self.locked().plans.get(encoded).cloned()
    }

    pub fn clear_plan(&self, encoded: &str) -> Option<RegionPlan> {
        self.locked().plans.remove(encoded)
    }

    /// Mark a region open on `server`. Ownership is exclusive by
    /// construction: any previous owner entry is dropped first.
    pub fn set_online(&self, encoded: &str, server: &ServerName) {
        let mut inner = self.locked();
        if let Some(previous) = inner.online.insert(encoded.to_string(), server.clone()) {
            if let Some(set) = inner.server_regions.get_mut(&previous) {
                set.remove(encoded);
            }
        }
        inner
            .server_regions
            .entry(server.clone())
            .or_default()
            .insert(encoded.to_string());
    }

    pub fn set_offline(&self, encoded: &str) -> Option<ServerName> {
        let mut inner = self.locked();
        let previous = inner.online.remove(encoded);
        if let Some(server) = &previous {
            if let Some(set) = inner.server_regions.get_mut(server) {
                set.remove(encoded);
            }
        }
        previous
    }

    pub fn online_owner(&self, encoded: &str) -> Option<ServerName> {
        self.locked().online.get(encoded).cloned()
    }

    pub fn online_count(&self) -> usize {
        self.locked().online.len()
    }

    /// Drop a dead server's footprint; returns the regions it was hosting.
    pub fn remove_server(&self, server: &ServerName) -> BTreeSet<String> {
        let mut inner = self.locked();
        let regions = inner.server_regions.remove(server).unwrap_or_default();
        for encoded in &regions {
            inner.online.remove(encoded);
        }
        regions
    }

    pub fn regions_on(&self, server: &ServerName) -> BTreeSet<String> {
        self.locked()
            .server_regions
            .get(server)
            .cloned()
            .unwrap_or_default()
    }

    /// Placement snapshot restricted to `live` servers, for the balancer.
    /// Servers with no regions still appear, so they attract moves.
    pub fn placement_snapshot(
        &self,
        live: &BTreeSet<ServerName>,
    ) -> BTreeMap<ServerName, BTreeSet<String>> {
        let inner = self.locked();
        let mut snapshot: BTreeMap<ServerName, BTreeSet<String>> = live
            .iter()
            .map(|s| (s.clone(), BTreeSet::new()))
            .collect();
        for (server, regions) in &inner.server_regions {
            if let Some(slot) = snapshot.get_mut(server) {
                slot.extend(regions.iter().cloned());
            }
        }
        snapshot
    }

    pub fn server_loads(&self, live: &BTreeSet<ServerName>) -> BTreeMap<ServerName, usize> {
        self.placement_snapshot(live)
            .into_iter()
            .map(|(server, regions)| (server, regions.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(i: u32) -> ServerName {
        ServerName::new(format!("rs{i}"), 8120, 1)
    }

    #[test]
    fn online_ownership_is_exclusive() {
        let store = RegionStateStore::new();
        store.set_online("r1", &server(1));
        store.set_online("r1", &server(2));

        assert_eq!(store.online_owner("r1"), Some(server(2)));
        assert!(store.regions_on(&server(1)).is_empty());
        assert_eq!(store.regions_on(&server(2)).len(), 1);
    }

    #[test]
    fn transition_updates_keep_start_and_refresh_deadline() {
        let store = RegionStateStore::new();
        store.update_transition("r1", RegionState::Offline, server(1));
        let first = store.transition("r1").unwrap();
        store.update_transition("r1", RegionState::Opening, server(1));
        let second = store.transition("r1").unwrap();

        assert_eq!(second.state, RegionState::Opening);
        assert_eq!(second.start, first.start);
        assert!(second.last_update >= first.last_update);
    }

    #[test]
    fn expiry_uses_the_per_state_budget() {
        let store = RegionStateStore::new();
        store.update_transition("slow", RegionState::Offline, server(1));
        store.update_transition("fast", RegionState::Opening, server(1));

        let timeouts = TransitionTimeouts {
            offline: Duration::from_millis(0),
            opening: Duration::from_secs(3600),
            ..TransitionTimeouts::default()
        };
        let expired = store.expired_transitions(Instant::now(), &timeouts);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "slow");
    }

    #[test]
    fn dead_server_removal_reports_its_regions() {
        let store = RegionStateStore::new();
        store.set_online("r1", &server(1));
        store.set_online("r2", &server(1));
        store.set_online("r3", &server(2));

        let orphaned = store.remove_server(&server(1));
        assert_eq!(orphaned.len(), 2);
        assert_eq!(store.online_owner("r1"), None);
        assert_eq!(store.online_owner("r3"), Some(server(2)));

        let live: BTreeSet<ServerName> = [server(2), server(3)].into_iter().collect();
        let snapshot = store.placement_snapshot(&live);
        assert_eq!(snapshot[&server(2)].len(), 1);
        assert!(snapshot[&server(3)].is_empty());
    }
}
