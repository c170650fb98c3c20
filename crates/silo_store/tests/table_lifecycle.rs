//! Table disable/enable: disable closes every region with no reopen
//! destination, enable fabricates fresh assignments, and the cycle is
//! idempotent in terms of which regions exist and are open (placement may
//! differ, which is the balancer's business).

mod common;

use std::collections::BTreeSet;

use common::TestCluster;
use silo_store::TableState;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disable_enable_round_trip() {
    let cluster = TestCluster::start(2).await.expect("cluster");
    let master = cluster.master().clone();

    let regions = master
        .create_table("flags", &common::split_keys(4))
        .await
        .expect("create table");
    cluster.wait_assigned(&regions).await.expect("assigned");
    let region_set: BTreeSet<String> = regions
        .iter()
        .map(|r| r.encoded_name().to_string())
        .collect();

    master.disable_table("flags").await.expect("disable");
    assert_eq!(
        master.assignment_manager().table_state("flags"),
        Some(TableState::Disabled)
    );
    for region in &regions {
        assert!(master.states().online_owner(region.encoded_name()).is_none());
        assert!(
            cluster.server_hosting(region.encoded_name()).is_none(),
            "{} still hosted after disable",
            region.region_name()
        );
    }
    // Disabling twice is an admin error, not a hang.
    master
        .disable_table("flags")
        .await
        .expect_err("double disable rejected");

    master.enable_table("flags").await.expect("enable");
    assert_eq!(
        master.assignment_manager().table_state("flags"),
        Some(TableState::Enabled)
    );
    cluster.wait_assigned(&regions).await.expect("re-assigned");

    // Same regions, all open, each exactly once; the mapping may differ.
    let after: BTreeSet<String> = regions
        .iter()
        .filter(|r| master.states().online_owner(r.encoded_name()).is_some())
        .map(|r| r.encoded_name().to_string())
        .collect();
    assert_eq!(after, region_set);
    assert!(cluster
        .owner_counts(&regions)
        .values()
        .all(|count| *count == 1));

    master
        .enable_table("flags")
        .await
        .expect_err("double enable rejected");

    // Delete only works on a disabled table.
    master
        .delete_table("flags")
        .await
        .expect_err("delete of enabled table rejected");
    master.disable_table("flags").await.expect("disable again");
    master.delete_table("flags").await.expect("delete");
    assert!(cluster
        .catalog
        .regions_of_table("flags")
        .expect("scan")
        .is_empty());
}
