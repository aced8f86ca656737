//! Echo over plain and TLS connections, server and client on one reactor

use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};
use tpc_codec::{BufferPool, Frame, Opcode};
use tpc_e2e_tests::{
    echo_server, get_request, init_tracing, self_signed_tls, single_destination_client,
    start_reactor, stop_reactors, wait_until, WAIT,
};
use tpc_network::{frame_handler_fn, AsyncSocket, TlsState};
use tpc_rpc::{RpcConfig, RpcError};

const ECHO_DEADLINE: Duration = Duration::from_secs(1);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_frame_echoed_within_deadline() {
    init_tracing();
    let reactor = start_reactor("echo").unwrap();
    let pool = BufferPool::default();
    let (server, addr) = echo_server(&reactor, &pool, None).await.unwrap();

    let client = single_destination_client(addr, &reactor, RpcConfig::default(), pool.clone())
        .await
        .unwrap();
    let started = Instant::now();
    let mut response = client
        .partition_ref(3)
        .unwrap()
        .submit_with_timeout(get_request(&pool, 3, 42).unwrap(), ECHO_DEADLINE)
        .unwrap()
        .await
        .unwrap();

    assert!(started.elapsed() < ECHO_DEADLINE);
    assert_eq!(response.partition_id(), 3);
    assert_eq!(response.opcode(), Opcode::Get);
    assert_eq!(response.header().payload_len, 8);
    assert_eq!(response.buffer_mut().read_i64().unwrap(), 42);
    assert_eq!(server.accepted_count(), 1);

    drop(response);
    drop(client);
    stop_reactors(&[reactor]).unwrap();
    assert_eq!(pool.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tls_echo_through_partition_client() {
    init_tracing();
    let reactor = start_reactor("tls-echo").unwrap();
    let pool = BufferPool::default();
    let tls = self_signed_tls().unwrap();
    let (_server, addr) = echo_server(&reactor, &pool, Some(tls.clone())).await.unwrap();

    let config = RpcConfig::default().with_tls(tls);
    let client = single_destination_client(addr, &reactor, config, pool.clone())
        .await
        .unwrap();
    let response = client
        .partition_ref(11)
        .unwrap()
        .submit_with_timeout(get_request(&pool, 11, 42).unwrap(), ECHO_DEADLINE)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(response.payload(), &42i64.to_be_bytes()[..]);

    drop(response);
    drop(client);
    stop_reactors(&[reactor]).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tls_handshake_completes_before_first_byte() {
    init_tracing();
    let reactor = start_reactor("tls-raw").unwrap();
    let pool = BufferPool::default();
    let tls = self_signed_tls().unwrap();

    // Echo server that reports its own TLS state with every frame it sees
    let server = reactor.server_socket_builder().tls(tls.clone()).build();
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let worker = reactor.clone();
    let server_pool = pool.clone();
    let (seen_tx, server_states) = std_mpsc::channel();
    server
        .accept(move |request| {
            let seen_tx = seen_tx.clone();
            let socket = worker
                .socket_builder()
                .frame_handler(
                    frame_handler_fn(move |frame: Frame, socket: &AsyncSocket| {
                        let _ = seen_tx.send(socket.tls_state());
                        socket.write_and_flush(frame.into_buffer())
                    }),
                    server_pool.clone(),
                )
                .accept_request(request)
                .build()
                .unwrap();
            socket.start().unwrap();
        })
        .unwrap();

    let (tx, frames) = std_mpsc::channel();
    let socket = reactor
        .socket_builder()
        .tls(tls)
        .frame_handler(
            frame_handler_fn(move |frame: Frame, _socket: &AsyncSocket| {
                let _ = tx.send(frame.payload().to_vec());
                Ok(())
            }),
            pool.clone(),
        )
        .build()
        .unwrap();
    assert_eq!(socket.tls_state(), TlsState::None);

    socket.connect(addr).await.unwrap();
    assert!(socket.is_tls());
    assert_eq!(socket.tls_state(), TlsState::Established);

    let payload = b"handshake first, then plaintext";
    let mut request = tpc_codec::IoBuffer::with_capacity(64);
    tpc_codec::write_request_header(&mut request, 0, Opcode::Set);
    request.write_bytes(payload);
    tpc_codec::construct_complete(&mut request).unwrap();
    socket.write_and_flush(request).unwrap();

    assert_eq!(server_states.recv_timeout(WAIT).unwrap(), TlsState::Established);
    assert_eq!(frames.recv_timeout(WAIT).unwrap(), payload.to_vec());
    socket.close();
    server.close();
    stop_reactors(&[reactor]).unwrap();
    assert_eq!(pool.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_untrusted_server_certificate_fails_connect() {
    init_tracing();
    let reactor = start_reactor("tls-untrusted").unwrap();
    let server_pool = BufferPool::default();
    let client_pool = BufferPool::default();
    let (server, addr) = echo_server(&reactor, &server_pool, Some(self_signed_tls().unwrap()))
        .await
        .unwrap();
    // Listener only
    assert_eq!(reactor.stats().registered, 1);

    // Trusts a certificate from an unrelated factory
    let config = RpcConfig::default().with_tls(self_signed_tls().unwrap());
    let err = single_destination_client(addr, &reactor, config, client_pool.clone())
        .await
        .unwrap_err();
    match err.downcast_ref::<RpcError>() {
        Some(RpcError::Network(e)) => assert_eq!(e.category(), "handshake", "unexpected error {e:?}"),
        other => panic!("expected a handshake failure, got {other:?}"),
    }

    // The accepted side gave up too and left only the listener registered
    assert!(wait_until(WAIT, || server.accepted_count() == 1).await);
    assert!(wait_until(WAIT, || reactor.stats().registered == 1).await);

    server.close();
    stop_reactors(&[reactor]).unwrap();
    assert_eq!(client_pool.outstanding(), 0);
    assert_eq!(server_pool.outstanding(), 0);
}
