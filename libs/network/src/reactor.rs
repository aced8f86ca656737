//! Thread-per-core reactor
//!
//! ## Purpose
//!
//! A [`Reactor`] owns one dedicated OS thread, optionally pinned to a CPU
//! core. The thread drives a current-thread tokio runtime (the I/O readiness
//! multiplexer) and a `LocalSet` holding every socket task the reactor owns.
//! Nothing that belongs to a reactor is ever touched from another thread:
//! foreign threads hand work over through [`Reactor::offer`].
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──start()──▶ Running ──shutdown()──▶ ShuttingDown ──▶ Terminated
//!    └──────────────────shutdown()───────────────────────────────▲
//! ```
//!
//! Shutdown runs on the reactor thread: queued tasks are drained and run,
//! every registered [`Closeable`] is closed, socket tasks get
//! [`ReactorConfig::shutdown_grace`] to finish their close handling, then the
//! thread exits and [`Reactor::await_termination`] joins it.
//!
//! ## Inbox
//!
//! The inbox is an unbounded multi-producer channel. Its receive side is
//! awaited inside the runtime, so a send from any thread wakes the blocked
//! poll. Tasks offered by one thread run in that thread's submission order.
//! A panicking task is caught and logged; the loop keeps running.

use crate::error::{NetworkError, Result};
use crate::options::SocketOptions;
use crate::socket::{AsyncServerSocketBuilder, AsyncSocketBuilder};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tpc_config::ReactorSettings;
use tracing::{debug, error, info, warn};

/// Work item executed on a reactor thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Task(Task),
    Shutdown,
}

static NEXT_REACTOR_ID: AtomicUsize = AtomicUsize::new(0);

/// Reactor lifecycle state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Created = 0,
    Running = 1,
    ShuttingDown = 2,
    Terminated = 3,
}

impl ReactorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReactorState::Created,
            1 => ReactorState::Running,
            2 => ReactorState::ShuttingDown,
            _ => ReactorState::Terminated,
        }
    }
}

/// Resource force-closed when its reactor shuts down
pub trait Closeable: Send + Sync {
    fn close(&self);
}

/// Registration handle returned by [`Reactor::register_closeable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseableId(u64);

/// Reactor configuration
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub name: String,
    /// Core index to pin the thread to, wrapped modulo the core count
    pub cpu_core: Option<usize>,
    pub shutdown_grace: Duration,
    /// Defaults for sockets built on this reactor
    pub socket_options: SocketOptions,
}

impl ReactorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cpu_core: None,
            shutdown_grace: Duration::from_secs(1),
            socket_options: SocketOptions::default(),
        }
    }

    pub fn with_cpu_core(mut self, core: usize) -> Self {
        self.cpu_core = Some(core);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_socket_options(mut self, options: SocketOptions) -> Self {
        self.socket_options = options;
        self
    }
}

/// Counters for tests and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorStats {
    pub tasks_executed: u64,
    pub tasks_panicked: u64,
    pub registered: usize,
}

/// Handle to a reactor thread; cloning shares the same reactor
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

struct ReactorInner {
    id: usize,
    config: ReactorConfig,
    state: AtomicU8,
    sender: mpsc::UnboundedSender<Command>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: OnceLock<ThreadId>,
    closeables: Mutex<HashMap<CloseableId, Arc<dyn Closeable>>>,
    next_closeable: AtomicU64,
    terminated: Mutex<bool>,
    terminated_cv: Condvar,
    tasks_executed: AtomicU64,
    tasks_panicked: AtomicU64,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ReactorInner {
                id: NEXT_REACTOR_ID.fetch_add(1, Ordering::Relaxed),
                config,
                state: AtomicU8::new(ReactorState::Created as u8),
                sender,
                receiver: Mutex::new(Some(receiver)),
                thread: Mutex::new(None),
                thread_id: OnceLock::new(),
                closeables: Mutex::new(HashMap::new()),
                next_closeable: AtomicU64::new(0),
                terminated: Mutex::new(false),
                terminated_cv: Condvar::new(),
                tasks_executed: AtomicU64::new(0),
                tasks_panicked: AtomicU64::new(0),
            }),
        }
    }

    /// Process-unique reactor id
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn state(&self) -> ReactorState {
        self.inner.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ReactorState::Running
    }

    pub fn socket_options(&self) -> &SocketOptions {
        &self.inner.config.socket_options
    }

    /// Whether the caller is this reactor's own thread
    pub fn in_reactor_thread(&self) -> bool {
        self.inner.in_reactor_thread()
    }

    pub fn stats(&self) -> ReactorStats {
        ReactorStats {
            tasks_executed: self.inner.tasks_executed.load(Ordering::Relaxed),
            tasks_panicked: self.inner.tasks_panicked.load(Ordering::Relaxed),
            registered: self.inner.closeables.lock().len(),
        }
    }

    /// Builder for a client or accepted socket owned by this reactor
    pub fn socket_builder(&self) -> AsyncSocketBuilder {
        AsyncSocketBuilder::new(self.clone())
    }

    /// Builder for a listening socket owned by this reactor
    pub fn server_socket_builder(&self) -> AsyncServerSocketBuilder {
        AsyncServerSocketBuilder::new(self.clone())
    }

    /// Spawn the reactor thread and transition to running
    pub fn start(&self) -> Result<()> {
        let name = self.inner.config.name.clone();
        if self
            .inner
            .state
            .compare_exchange(
                ReactorState::Created as u8,
                ReactorState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(NetworkError::configuration(
                format!("reactor '{name}' was already started"),
                None,
            ));
        }

        let spawned = self.spawn_thread(&name);
        if let Err(e) = spawned {
            self.inner.mark_terminated();
            return Err(e);
        }

        info!(
            reactor = %name,
            id = self.inner.id,
            cpu_core = ?self.inner.config.cpu_core,
            "Reactor started"
        );
        Ok(())
    }

    fn spawn_thread(&self, name: &str) -> Result<()> {
        let receiver = self.inner.receiver.lock().take().ok_or_else(|| {
            NetworkError::configuration("reactor inbox already consumed", None)
        })?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || inner.run(runtime, receiver))?;
        *self.inner.thread.lock() = Some(handle);
        Ok(())
    }

    /// Enqueue a task from any thread; fails unless the reactor is running
    pub fn offer<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state() != ReactorState::Running {
            return Err(NetworkError::reactor_not_running(self.name()));
        }
        self.inner
            .sender
            .send(Command::Task(Box::new(task)))
            .map_err(|_| NetworkError::reactor_not_running(self.name()))
    }

    /// Run inline when already on the reactor thread, otherwise [`Reactor::offer`]
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.in_reactor_thread() {
            task();
            Ok(())
        } else {
            self.offer(task)
        }
    }

    /// Track a resource so shutdown can force-close it
    pub fn register_closeable(&self, closeable: Arc<dyn Closeable>) -> Result<CloseableId> {
        if self.state() != ReactorState::Running {
            return Err(NetworkError::reactor_not_running(self.name()));
        }
        let id = CloseableId(self.inner.next_closeable.fetch_add(1, Ordering::Relaxed));
        let inner = Arc::clone(&self.inner);
        self.execute(move || {
            inner.closeables.lock().insert(id, closeable);
        })?;
        Ok(id)
    }

    pub fn deregister_closeable(&self, id: CloseableId) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.execute(move || {
            inner.closeables.lock().remove(&id);
        })
    }

    /// Begin shutdown; idempotent
    pub fn shutdown(&self) {
        match self.inner.state.compare_exchange(
            ReactorState::Running as u8,
            ReactorState::ShuttingDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info!(reactor = %self.name(), "Reactor shutting down");
                let _ = self.inner.sender.send(Command::Shutdown);
            }
            Err(current) if current == ReactorState::Created as u8 => {
                if self
                    .inner
                    .state
                    .compare_exchange(
                        ReactorState::Created as u8,
                        ReactorState::Terminated as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.inner.mark_terminated();
                }
            }
            Err(_) => {}
        }
    }

    /// Wait for the thread to exit and join it; `false` on timeout
    pub fn await_termination(&self, timeout: Duration) -> bool {
        if self.in_reactor_thread() {
            warn!(reactor = %self.name(), "await_termination called from the reactor thread");
            return false;
        }

        let finished = {
            let mut terminated = self.inner.terminated.lock();
            if !*terminated {
                self.inner
                    .terminated_cv
                    .wait_while_for(&mut terminated, |done| !*done, timeout);
            }
            *terminated
        };

        if finished {
            if let Some(handle) = self.inner.thread.lock().take() {
                if handle.join().is_err() {
                    error!(reactor = %self.name(), "Reactor thread panicked");
                }
            }
        }
        finished
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ReactorInner {
    fn state(&self) -> ReactorState {
        ReactorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn in_reactor_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    fn run(self: Arc<Self>, runtime: Runtime, mut inbox: mpsc::UnboundedReceiver<Command>) {
        let _ = self.thread_id.set(thread::current().id());
        if let Some(core) = self.config.cpu_core {
            pin_to_core(&self.config.name, core);
        }

        let local = LocalSet::new();
        local.block_on(&runtime, async {
            while let Some(command) = inbox.recv().await {
                match command {
                    Command::Task(task) => self.run_task(task),
                    Command::Shutdown => break,
                }
            }

            inbox.close();
            let mut drained = 0usize;
            while let Ok(command) = inbox.try_recv() {
                if let Command::Task(task) = command {
                    self.run_task(task);
                    drained += 1;
                }
            }
            debug!(reactor = %self.config.name, drained, "Inbox drained");

            self.close_all();
        });

        let grace = self.config.shutdown_grace;
        let finished = runtime.block_on(async move { tokio::time::timeout(grace, local).await });
        if finished.is_err() {
            warn!(
                reactor = %self.config.name,
                grace_ms = grace.as_millis() as u64,
                "Socket tasks still running after shutdown grace period"
            );
        }
        drop(runtime);

        self.mark_terminated();
    }

    fn run_task(&self, task: Task) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
            self.tasks_panicked.fetch_add(1, Ordering::Relaxed);
            error!(
                reactor = %self.config.name,
                panic = %panic_message(panic.as_ref()),
                "Reactor task panicked"
            );
        }
    }

    fn close_all(&self) {
        let closeables: Vec<_> = self.closeables.lock().drain().map(|(_, c)| c).collect();
        if closeables.is_empty() {
            return;
        }
        debug!(reactor = %self.config.name, count = closeables.len(), "Closing registered resources");
        for closeable in closeables {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| closeable.close())) {
                error!(
                    reactor = %self.config.name,
                    panic = %panic_message(panic.as_ref()),
                    "Close panicked during shutdown"
                );
            }
        }
    }

    fn mark_terminated(&self) {
        self.state
            .store(ReactorState::Terminated as u8, Ordering::Release);
        *self.terminated.lock() = true;
        self.terminated_cv.notify_all();
        info!(reactor = %self.config.name, "Reactor terminated");
    }
}

fn pin_to_core(reactor: &str, index: usize) {
    match core_affinity::get_core_ids() {
        Some(cores) if !cores.is_empty() => {
            let core = cores[index % cores.len()];
            if core_affinity::set_for_current(core) {
                debug!(reactor, core = core.id, "Reactor thread pinned");
            } else {
                warn!(reactor, core = core.id, "Failed to pin reactor thread");
            }
        }
        _ => warn!(reactor, "CPU core ids unavailable; reactor thread left unpinned"),
    }
}

/// Best-effort text of a caught panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Start `settings.effective_count()` reactors named `{prefix}-{index}`
pub fn start_reactors(
    prefix: &str,
    settings: &ReactorSettings,
    socket_options: &SocketOptions,
) -> Result<Vec<Reactor>> {
    let count = settings.effective_count();
    let mut reactors: Vec<Reactor> = Vec::with_capacity(count);
    for index in 0..count {
        let mut config = ReactorConfig::new(format!("{prefix}-{index}"))
            .with_shutdown_grace(Duration::from_millis(settings.shutdown_grace_ms))
            .with_socket_options(socket_options.clone());
        if settings.pin_to_cores {
            config = config.with_cpu_core(index);
        }
        let reactor = Reactor::new(config);
        if let Err(e) = reactor.start() {
            for started in &reactors {
                started.shutdown();
            }
            return Err(e);
        }
        reactors.push(reactor);
    }
    Ok(reactors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc as std_mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn started(name: &str) -> Reactor {
        let reactor = Reactor::new(ReactorConfig::new(name));
        reactor.start().unwrap();
        reactor
    }

    #[test]
    fn test_start_and_shutdown_lifecycle() {
        let reactor = Reactor::new(ReactorConfig::new("lifecycle"));
        assert_eq!(reactor.state(), ReactorState::Created);

        reactor.start().unwrap();
        assert_eq!(reactor.state(), ReactorState::Running);

        reactor.shutdown();
        assert!(reactor.await_termination(WAIT));
        assert_eq!(reactor.state(), ReactorState::Terminated);
        assert!(reactor.inner.thread.lock().is_none());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let reactor = started("idempotent");
        reactor.shutdown();
        reactor.shutdown();
        assert!(reactor.await_termination(WAIT));
        reactor.shutdown();
        assert_eq!(reactor.state(), ReactorState::Terminated);
    }

    #[test]
    fn test_shutdown_before_start_terminates() {
        let reactor = Reactor::new(ReactorConfig::new("never-started"));
        reactor.shutdown();
        assert!(reactor.await_termination(WAIT));
        assert!(reactor.start().is_err());
    }

    #[test]
    fn test_offer_requires_running_reactor() {
        let reactor = Reactor::new(ReactorConfig::new("offline"));
        let err = reactor.offer(|| {}).unwrap_err();
        assert!(matches!(err, NetworkError::ReactorNotRunning { .. }));

        reactor.start().unwrap();
        reactor.shutdown();
        assert!(reactor.await_termination(WAIT));
        assert!(reactor.offer(|| {}).is_err());
    }

    #[test]
    fn test_tasks_run_in_fifo_order_on_reactor_thread() {
        let reactor = started("fifo");
        let (tx, rx) = std_mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            let probe = reactor.clone();
            reactor
                .offer(move || {
                    assert!(probe.in_reactor_thread());
                    tx.send(i).unwrap();
                })
                .unwrap();
        }
        let seen: Vec<i32> = (0..100).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert!(!reactor.in_reactor_thread());

        reactor.shutdown();
        assert!(reactor.await_termination(WAIT));
    }

    #[test]
    fn test_panicking_task_does_not_kill_loop() {
        let reactor = started("panics");
        reactor.offer(|| panic!("boom")).unwrap();
        let (tx, rx) = std_mpsc::channel();
        reactor.offer(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(WAIT).unwrap();

        assert_eq!(reactor.stats().tasks_panicked, 1);
        reactor.shutdown();
        assert!(reactor.await_termination(WAIT));
    }

    #[test]
    fn test_execute_runs_inline_on_reactor_thread() {
        let reactor = started("inline");
        let (tx, rx) = std_mpsc::channel();
        let probe = reactor.clone();
        reactor
            .offer(move || {
                let ran = Arc::new(AtomicBool::new(false));
                let flag = Arc::clone(&ran);
                probe
                    .execute(move || flag.store(true, Ordering::SeqCst))
                    .unwrap();
                tx.send(ran.load(Ordering::SeqCst)).unwrap();
            })
            .unwrap();
        assert!(rx.recv_timeout(WAIT).unwrap());

        reactor.shutdown();
        assert!(reactor.await_termination(WAIT));
    }

    #[test]
    fn test_shutdown_drains_queued_tasks() {
        let reactor = started("drain");
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        let (done_tx, done_rx) = std_mpsc::channel();

        reactor.offer(move || gate_rx.recv().unwrap()).unwrap();
        for i in 0..10 {
            let done_tx = done_tx.clone();
            reactor.offer(move || done_tx.send(i).unwrap()).unwrap();
        }
        reactor.shutdown();
        gate_tx.send(()).unwrap();

        assert!(reactor.await_termination(WAIT));
        assert_eq!(done_rx.try_iter().count(), 10);
    }

    struct Flag(Arc<AtomicBool>);

    impl Closeable for Flag {
        fn close(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_shutdown_closes_registered_resources() {
        let reactor = started("closeables");
        let kept = Arc::new(AtomicBool::new(false));
        let removed = Arc::new(AtomicBool::new(false));

        reactor
            .register_closeable(Arc::new(Flag(Arc::clone(&kept))))
            .unwrap();
        let id = reactor
            .register_closeable(Arc::new(Flag(Arc::clone(&removed))))
            .unwrap();
        reactor.deregister_closeable(id).unwrap();

        reactor.shutdown();
        assert!(reactor.await_termination(WAIT));
        assert!(kept.load(Ordering::SeqCst));
        assert!(!removed.load(Ordering::SeqCst));
        assert_eq!(reactor.stats().registered, 0);
    }

    #[test]
    fn test_register_on_stopped_reactor_fails() {
        let reactor = Reactor::new(ReactorConfig::new("unregistered"));
        let flag = Arc::new(AtomicBool::new(false));
        assert!(reactor.register_closeable(Arc::new(Flag(flag))).is_err());
    }

    #[test]
    fn test_await_termination_times_out_while_running() {
        let reactor = started("still-running");
        assert!(!reactor.await_termination(Duration::from_millis(20)));
        reactor.shutdown();
        assert!(reactor.await_termination(WAIT));
    }

    #[test]
    fn test_pinned_reactor_group() {
        let settings = ReactorSettings {
            count: 2,
            pin_to_cores: true,
            shutdown_grace_ms: 100,
        };
        let reactors = start_reactors("group", &settings, &SocketOptions::default()).unwrap();
        assert_eq!(reactors.len(), 2);
        assert_eq!(reactors[1].name(), "group-1");
        assert_ne!(reactors[0].id(), reactors[1].id());
        for reactor in &reactors {
            reactor.shutdown();
            assert!(reactor.await_termination(WAIT));
        }
    }
}
