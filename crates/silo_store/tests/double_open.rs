//! Racing opens: when a retry re-targets a region while the first OPEN is
//! still outstanding, the versioned transition node lets exactly one server
//! through. The loser aborts and the catalog records a single owner.

mod common;

use std::time::Duration;

use common::TestCluster;
use silo_store::layout::{self, TransitionNode};
use silo_store::region::{now_unix_ms, RegionState};
use silo_store::{RegionInfo, RegionServerRpc};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_server_wins_a_contested_open() {
    let cluster = TestCluster::start(2).await.expect("cluster");
    let master = cluster.master().clone();

    // A fresh region with a catalog row but no assignment yet.
    let region = RegionInfo::new("contest", Vec::new(), Vec::new(), now_unix_ms());
    cluster.catalog.insert_region(&region).expect("catalog row");

    let rs0 = cluster.servers[0].clone();
    let rs1 = cluster.servers[1].clone();

    // Simulate the master's retry sequence: the node first named rs0, then
    // was forced back to OFFLINE for rs1 after a timeout. Both servers now
    // act on their RPCs concurrently.
    let (session, _events) = cluster.store.connect();
    let path = layout::unassigned_node(region.encoded_name());
    session
        .create(
            &path,
            TransitionNode::new(RegionState::Offline, rs0.name().clone(), now_unix_ms()).encode(),
            false,
        )
        .expect("seed OFFLINE node");
    session
        .set_data(
            &path,
            TransitionNode::new(RegionState::Offline, rs1.name().clone(), now_unix_ms()).encode(),
            1,
        )
        .expect("re-target to rs1");

    let (first, second, retry) = tokio::join!(
        rs0.open_region(&region),
        rs1.open_region(&region),
        rs1.open_region(&region)
    );
    // The stale target refuses a node that no longer names it; the new
    // target wins; the duplicate RPC to the winner is idempotent.
    assert!(first.is_err(), "stale open should abort: {first:?}");
    assert!(second.is_ok() && retry.is_ok());

    // Exactly one server hosts the region.
    assert!(rs0.hosted(region.encoded_name()).is_none());
    assert!(rs1.hosted(region.encoded_name()).is_some());

    // The master commits the single OPENED it observes: one catalog owner,
    // node deleted, region tracked online at rs1.
    master
        .wait_until(
            "open committed",
            || master.states().online_owner(region.encoded_name()).is_some(),
            Duration::from_secs(10),
        )
        .await
        .expect("commit");
    assert_eq!(cluster.catalog_owner(&region).as_ref(), Some(rs1.name()));
    assert!(matches!(
        session.exists(&path),
        Ok(false)
    ));
}
