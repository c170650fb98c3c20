//! Split transaction happy path: two store files split around a row, the
//! parent commits as offline+split, both daughters come up on the same
//! server with reference files only, and a scan sees exactly the old rows.

mod common;

use common::TestCluster;

fn rows(keys: &[&str]) -> Vec<(Vec<u8>, Vec<u8>)> {
    keys.iter()
        .map(|k| (k.as_bytes().to_vec(), format!("v-{k}").into_bytes()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_rewires_catalog_and_preserves_rows() {
    let cluster = TestCluster::start(2).await.expect("cluster");
    let master = cluster.master().clone();

    let regions = master.create_table("logs", &[]).await.expect("create table");
    let parent = regions[0].clone();
    cluster.wait_assigned(&regions).await.expect("assigned");

    let host = cluster
        .server_hosting(parent.encoded_name())
        .expect("parent hosted")
        .clone();
    let hosted = host.hosted(parent.encoded_name()).expect("handle");
    hosted.put_batch(&rows(&["a", "b", "c"])).await.expect("flush 1");
    hosted.put_batch(&rows(&["m", "x"])).await.expect("flush 2");
    assert_eq!(hosted.store_file_count().unwrap(), 2);
    let before = hosted.scan(b"", b"").await.expect("scan before");

    master
        .split_region(&parent, Some(b"k".to_vec()))
        .await
        .expect("split");

    // Catalog: parent offline+split, daughters recorded and placed.
    let parent_row = cluster.catalog.row(&parent).expect("read").expect("row");
    assert!(parent_row.offline && parent_row.split);
    let (daughter_a, daughter_b) = parent_row.daughters.expect("daughters recorded");
    assert_eq!(daughter_a.start_key, parent.start_key);
    assert_eq!(daughter_a.end_key, b"k".to_vec());
    assert_eq!(daughter_b.start_key, b"k".to_vec());
    assert_eq!(daughter_b.end_key, parent.end_key);
    assert!(daughter_a.region_id > parent.region_id);
    for daughter in [&daughter_a, &daughter_b] {
        assert_eq!(
            cluster.catalog_owner(daughter).as_ref(),
            Some(host.name()),
            "daughter not placed in catalog"
        );
    }

    // Both daughters live on the splitting server; the parent is gone.
    assert!(host.hosted(parent.encoded_name()).is_none());
    let hosted_a = host.hosted(daughter_a.encoded_name()).expect("daughter a online");
    let hosted_b = host.hosted(daughter_b.encoded_name()).expect("daughter b online");

    // Two reference files per daughter (one per parent store file), no copies.
    for daughter in [&hosted_a, &hosted_b] {
        let files = daughter.list_store_files().expect("list");
        assert_eq!(files.len(), 2, "{files:?}");
        assert!(files
            .iter()
            .all(|f| f.extension().and_then(|e| e.to_str()) == Some("ref")));
    }

    // A scan over the original range returns the same rows as before.
    let mut after = hosted_a.scan(b"", b"").await.expect("scan a");
    after.extend(hosted_b.scan(b"", b"").await.expect("scan b"));
    assert_eq!(after, before);

    // The daughters partition the rows around the split point.
    assert_eq!(hosted_a.scan(b"", b"").await.unwrap().len(), 3);
    assert_eq!(hosted_b.scan(b"", b"").await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_prepare_rejects_bad_rows() {
    let cluster = TestCluster::start(1).await.expect("cluster");
    let master = cluster.master().clone();

    let regions = master
        .create_table("bounded", &[b"m".to_vec()])
        .await
        .expect("create table");
    cluster.wait_assigned(&regions).await.expect("assigned");
    let lower = regions[0].clone();
    assert_eq!(lower.end_key, b"m".to_vec());

    // Split row equal to the start key.
    let err = master
        .split_region(&lower, Some(lower.start_key.clone()))
        .await
        .expect_err("start key split must fail");
    assert!(err.to_string().contains("split row"), "{err:#}");

    // Split row outside the region's range.
    let err = master
        .split_region(&lower, Some(b"zz".to_vec()))
        .await
        .expect_err("out of range split must fail");
    assert!(err.to_string().contains("split row"), "{err:#}");

    // The parent is untouched and still serving.
    assert!(cluster.server_hosting(lower.encoded_name()).is_some());
    let row = cluster.catalog.row(&lower).expect("read").expect("row");
    assert!(!row.offline && !row.split);
}
