//! Table client against the in-memory partition server

use std::sync::Arc;
use tpc_codec::Opcode;
use tpc_e2e_tests::{wait_until, ClusterConfig, TestCluster, WAIT};
use tpc_rpc::{Item, RpcError};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_set_get_and_query_across_partitions() {
    let cluster = TestCluster::start("table", ClusterConfig::default()).await.unwrap();
    let table = cluster.table("users");

    for i in 0..50u32 {
        table
            .set(format!("user-{i}").as_bytes(), &i.to_be_bytes())
            .await
            .unwrap();
    }
    assert_eq!(
        table.get(b"user-7").await.unwrap(),
        Some(7u32.to_be_bytes().to_vec())
    );
    assert_eq!(table.get(b"user-99").await.unwrap(), None);
    assert_eq!(table.query_all().await.unwrap(), 50);
    assert_eq!(cluster.store().len("users"), 50);
    assert!(cluster.store().is_empty("other"));

    let client_pool = cluster.client_pool().clone();
    let server_pool = cluster.server_pool().clone();
    drop(table);
    cluster.shutdown().unwrap();
    assert!(wait_until(WAIT, || client_pool.outstanding() == 0).await);
    assert!(wait_until(WAIT, || server_pool.outstanding() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upserts_and_noops() {
    let cluster = TestCluster::start("upsert", ClusterConfig::default()).await.unwrap();
    let table = cluster.table("items");

    let items: Vec<Item> = (0..20).map(|key| Item { key, a: 1, b: 2 }).collect();
    table.upsert_all(&items).await.unwrap();
    table.upsert(Item { key: 5, a: 50, b: 51 }).await.unwrap();
    assert_eq!(cluster.store().item("items", 5), Some((50, 51)));
    assert_eq!(table.query_all().await.unwrap(), 20);

    let partition = table.noop_random().await.unwrap();
    assert!(partition < cluster.client().partition_count());
    table.concurrent_noop(32, 3).await.unwrap();

    assert!(matches!(
        table.noop(cluster.client().partition_count()).await,
        Err(RpcError::InvalidPartition { .. })
    ));
    cluster.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_connections() {
    let cluster = TestCluster::start("callers", ClusterConfig::default()).await.unwrap();
    let table = Arc::new(cluster.table("shared"));

    let mut tasks = Vec::new();
    for caller in 0..8 {
        let table = Arc::clone(&table);
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                let key = format!("{caller}-{i}");
                table.set(key.as_bytes(), key.as_bytes()).await?;
                let value = table.get(key.as_bytes()).await?;
                assert_eq!(value.as_deref(), Some(key.as_bytes()));
            }
            Ok::<_, RpcError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(table.query_all().await.unwrap(), 200);
    assert_eq!(cluster.client().connection_count(), 2);

    drop(table);
    cluster.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_table_over_tls() {
    let cluster = TestCluster::start("tls-table", ClusterConfig::default().with_tls(true))
        .await
        .unwrap();
    let table = cluster.table("secure");

    table.set(b"k", b"v").await.unwrap();
    let mut pipeline = table.new_pipeline();
    pipeline.get(b"k").unwrap().set(b"k2", b"v2").unwrap();
    let results = pipeline.execute().await;

    let mut get = results.into_iter().next().unwrap().unwrap();
    assert_eq!(get.opcode(), Opcode::Get);
    assert_eq!(get.buffer_mut().read_sized_bytes().unwrap(), Some(b"v".to_vec()));
    assert_eq!(table.get(b"k2").await.unwrap(), Some(b"v2".to_vec()));

    drop(get);
    cluster.shutdown().unwrap();
}
