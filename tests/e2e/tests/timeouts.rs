//! Caller-side deadlines against stalled reactors

use std::time::{Duration, Instant};
use tpc_e2e_tests::{wait_until, ClusterConfig, Stall, TestCluster, WAIT};
use tpc_rpc::RpcError;

const TIMEOUT: Duration = Duration::from_millis(100);

fn stalled_config() -> ClusterConfig {
    ClusterConfig::default()
        .with_client_reactors(2)
        .with_partition_count(4)
        .with_request_timeout(TIMEOUT)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_reactor_times_out_instead_of_hanging() {
    let cluster = TestCluster::start("stalled", stalled_config()).await.unwrap();
    let table = cluster.table("t");
    table.noop(0).await.unwrap();

    // Partition 0 lives on client reactor 0
    let stall = Stall::begin(&cluster.client_reactors()[0]).unwrap();
    let started = Instant::now();
    let err = table.noop(0).await.unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(
        err,
        RpcError::Timeout {
            partition_id: 0,
            timeout_ms: 100
        }
    ));
    assert!(waited >= TIMEOUT);
    assert!(waited < WAIT);
    // The abandoned request still sits in the stalled inbox
    assert!(cluster.client_pool().outstanding() > 0);

    stall.release();
    let pool = cluster.client_pool().clone();
    assert!(wait_until(WAIT, || pool.outstanding() == 0).await);

    // Correlation survived the abandoned request
    table.noop(0).await.unwrap();
    cluster.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partition_unaffected_by_other_stalled_reactor() {
    let cluster = TestCluster::start("isolated", stalled_config()).await.unwrap();
    let table = cluster.table("t");
    let stall = Stall::begin(&cluster.client_reactors()[0]).unwrap();

    let stalled = table.noop(2);
    let healthy = table.noop(1);
    let started = Instant::now();
    let (stalled, healthy) = futures::join!(stalled, healthy);

    assert!(healthy.is_ok());
    assert!(stalled.unwrap_err().is_timeout());
    assert!(started.elapsed() < WAIT);

    stall.release();
    table.noop(2).await.unwrap();
    cluster.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_reports_each_request_independently() {
    let cluster = TestCluster::start("pipeline-stall", stalled_config()).await.unwrap();
    let table = cluster.table("t");
    let stall = Stall::begin(&cluster.client_reactors()[1]).unwrap();

    let mut pipeline = table.new_pipeline();
    pipeline.noop(0).unwrap().noop(1).unwrap().noop(2).unwrap().noop(3).unwrap();
    let results = pipeline.execute().await;

    assert_eq!(results.len(), 4);
    assert!(results[0].is_ok());
    assert!(results[1].as_ref().unwrap_err().is_timeout());
    assert!(results[2].is_ok());
    assert!(results[3].as_ref().unwrap_err().is_timeout());

    drop(results);
    stall.release();
    cluster.shutdown().unwrap();
}
