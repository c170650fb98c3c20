//! Balancing after membership change: a server that joins an already-loaded
//! cluster attracts regions on the next balancer round, and every move goes
//! through the normal close/reopen transition.

mod common;

use std::time::Duration;

use common::TestCluster;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_server_attracts_regions_on_balance() {
    let mut cluster = TestCluster::start(2).await.expect("cluster");
    let master = cluster.master().clone();

    let regions = master
        .create_table("inventory", &common::split_keys(6))
        .await
        .expect("create table");
    cluster.wait_assigned(&regions).await.expect("assigned");

    // Third server joins empty.
    cluster.start_server(2, 1).expect("start rs2");
    let rs2 = cluster.servers.last().expect("rs2").clone();
    common::wait_until("rs2 live", Duration::from_secs(10), || {
        master.live_servers().contains(rs2.name())
    })
    .await
    .expect("membership");
    assert!(rs2.online_regions().is_empty());

    master.balance().await.expect("balance round");

    // The moves complete through close/reopen; rs2 ends up with its mean
    // share (6 user + 2 system regions over 3 servers ⇒ at least 2).
    common::wait_until("regions moved to rs2", Duration::from_secs(20), || {
        rs2.online_regions().len() >= 2 && master.states().in_transition_count() == 0
    })
    .await
    .expect("rebalanced");

    // Everything is still open exactly once and the catalog tracks it.
    cluster.wait_assigned(&regions).await.expect("still assigned");
    assert!(cluster
        .owner_counts(&regions)
        .values()
        .all(|count| *count == 1));
    for region in &regions {
        let host = cluster.server_hosting(region.encoded_name()).expect("hosted");
        assert_eq!(cluster.catalog_owner(region).as_ref(), Some(host.name()));
    }

    // A second round on a level cluster proposes nothing new.
    let placement_before: Vec<usize> = cluster
        .servers
        .iter()
        .map(|s| s.online_regions().len())
        .collect();
    master.balance().await.expect("steady balance");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let placement_after: Vec<usize> = cluster
        .servers
        .iter()
        .map(|s| s.online_regions().len())
        .collect();
    assert_eq!(placement_before, placement_after);
}
