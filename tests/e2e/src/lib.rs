//! End-to-end test framework for the TPC engine
//!
//! Scenarios under `tests/` run real reactors and sockets on the loopback
//! interface: echo over plain and TLS connections, partition RPC through the
//! table client, and timeouts against stalled reactors.

pub mod framework;

pub use framework::{
    echo_server, get_request, init_tracing, self_signed_tls, single_destination_client,
    start_reactor, stop_reactors, wait_until, ClusterConfig, Stall, TestCluster, WAIT,
};
