//! Fresh-cluster bulk assignment: three servers, nine user regions. After
//! the bulk plan completes every server holds exactly three user regions,
//! the catalog names a live server for each, and no region has two hosts.

mod common;

use std::collections::BTreeMap;

use common::TestCluster;
use silo_store::{RegionInfo, ServerName};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_cluster_spreads_regions_evenly() {
    let cluster = TestCluster::start(3).await.expect("cluster");
    let master = cluster.master().clone();

    let regions = master
        .create_table("users", &common::split_keys(9))
        .await
        .expect("create table");
    assert_eq!(regions.len(), 9);
    cluster.wait_assigned(&regions).await.expect("assigned");

    // Placement is even: 9 user regions over 3 servers.
    let mut per_server: BTreeMap<ServerName, usize> = BTreeMap::new();
    for region in &regions {
        let owner = master
            .states()
            .online_owner(region.encoded_name())
            .expect("owner");
        *per_server.entry(owner).or_default() += 1;
    }
    assert_eq!(per_server.len(), 3);
    assert!(per_server.values().all(|count| *count == 3), "{per_server:?}");

    // The catalog reports every region at the server that actually hosts it.
    for region in &regions {
        let catalog_owner = cluster.catalog_owner(region).expect("catalog row");
        let host = cluster
            .server_hosting(region.encoded_name())
            .expect("hosted somewhere");
        assert_eq!(&catalog_owner, host.name());
    }

    // System regions bootstrapped first and are open too.
    for system in [RegionInfo::root(), RegionInfo::meta()] {
        assert!(master.states().online_owner(system.encoded_name()).is_some());
    }

    // Single-ownership invariant across the running servers.
    assert!(cluster
        .owner_counts(&regions)
        .values()
        .all(|count| *count == 1));

    // All transitions drained: no leftover /unassigned nodes tracked.
    assert_eq!(master.states().in_transition_count(), 0);
}
