//! Engine configuration feeding reactors, sockets and the client

use std::io::Write;
use std::time::Duration;
use tpc_config::EngineConfig;
use tpc_network::SocketOptions;
use tpc_rpc::RpcConfig;

#[test]
fn test_file_settings_reach_client_and_sockets() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[reactor]
count = 2

[socket]
connect_timeout_ms = 250
max_frame_size = 4096

[rpc]
partition_count = 64
request_timeout_ms = 100
"#
    )
    .unwrap();

    let config = EngineConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.reactor.effective_count(), 2);

    let rpc = RpcConfig::from(&config);
    assert_eq!(rpc.partition_count, 64);
    assert_eq!(rpc.request_timeout, Duration::from_millis(100));
    assert!(rpc.tls.is_none());

    let options = SocketOptions::from(&config.socket);
    assert_eq!(options.connect_timeout, Duration::from_millis(250));
    assert_eq!(options.max_frame_size, 4096);
}

#[test]
fn test_invalid_partition_count_is_rejected() {
    assert!(EngineConfig::from_toml_str("[rpc]\npartition_count = 0\n").is_err());
}
