//! Reactor start/stop without any registered resources

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tpc_config::ReactorSettings;
use tpc_e2e_tests::{init_tracing, stop_reactors, wait_until, WAIT};
use tpc_network::{start_reactors, Reactor, ReactorConfig, ReactorState, SocketOptions};

#[test]
fn test_idle_reactor_starts_and_terminates() {
    init_tracing();
    let reactor = Reactor::new(ReactorConfig::new("idle"));
    assert_eq!(reactor.state(), ReactorState::Created);
    assert!(!reactor.is_running());

    reactor.start().unwrap();
    assert_eq!(reactor.state(), ReactorState::Running);

    reactor.shutdown();
    assert!(reactor.await_termination(WAIT));
    assert_eq!(reactor.state(), ReactorState::Terminated);
    assert!(reactor.offer(|| {}).is_err());
}

#[test]
fn test_shutdown_before_start_terminates() {
    let reactor = Reactor::new(ReactorConfig::new("never-started"));
    reactor.shutdown();
    assert_eq!(reactor.state(), ReactorState::Terminated);
    assert!(reactor.await_termination(WAIT));
    assert!(reactor.start().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_reactors_runs_offered_tasks() {
    init_tracing();
    let settings = ReactorSettings {
        count: 3,
        pin_to_cores: false,
        shutdown_grace_ms: 100,
    };
    let reactors = start_reactors("lifecycle", &settings, &SocketOptions::default()).unwrap();
    assert_eq!(reactors.len(), 3);
    assert_eq!(reactors[2].name(), "lifecycle-2");

    let ran = Arc::new(AtomicUsize::new(0));
    for reactor in &reactors {
        let ran = Arc::clone(&ran);
        let on_reactor = reactor.clone();
        reactor
            .offer(move || {
                assert!(on_reactor.in_reactor_thread());
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    let counter = Arc::clone(&ran);
    assert!(wait_until(WAIT, || counter.load(Ordering::SeqCst) == 3).await);

    stop_reactors(&reactors).unwrap();
    assert!(reactors.iter().all(|r| r.state() == ReactorState::Terminated));
}
