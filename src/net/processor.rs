//! Processor
//!
//! The unit of workload isolation. A processor owns one reactor, one buffer
//! pool, a handler pool (decode and dispatch), an executor pool (work that
//! may block on backends) and the registries of its live connections.
//!
//! `check()` is driven by an external timer: it removes closed connections
//! from the registries, cleans each of them up exactly once, and runs the
//! idle check on everything still open.

use crate::buffer::BufferPool;
use crate::commands::CommandCount;
use crate::config::SystemConfig;
use crate::net::backend::BackendConnection;
use crate::net::connection::NioConnection;
use crate::net::frontend::FrontendConnection;
use crate::net::reactor::Reactor;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, trace, warn};

/// A named, bounded pool of worker threads.
///
/// Tasks run on a dedicated runtime's blocking pool so one slow task never
/// stalls a reactor thread. A size of 0 disables the pool and runs every
/// task inline on the caller.
pub struct WorkerPool {
    name: String,
    size: usize,
    runtime: Option<Runtime>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> io::Result<Self> {
        let name = name.into();
        let runtime = if size == 0 {
            None
        } else {
            Some(
                Builder::new_multi_thread()
                    .worker_threads(1)
                    .max_blocking_threads(size)
                    .thread_name(name.clone())
                    .enable_all()
                    .build()?,
            )
        };
        Ok(Self {
            name,
            size,
            runtime,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `task` on the pool. A panicking task only loses itself.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => {
                runtime.spawn_blocking(task);
            }
            None => task(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Result of sweeping one registry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub checked: usize,
    pub cleaned: usize,
    pub stale: usize,
}

type Registry<C> = RwLock<HashMap<u32, Arc<C>>>;

/// Owner of all per-connection resources of one shard of the workload.
pub struct Processor {
    name: String,
    reactor: Reactor,
    buffer_pool: BufferPool,
    handler: WorkerPool,
    executor: WorkerPool,
    command_count: CommandCount,
    frontends: Registry<FrontendConnection>,
    backends: Registry<BackendConnection>,
    net_in_bytes: AtomicU64,
    net_out_bytes: AtomicU64,
}

impl Processor {
    pub fn new(name: impl Into<String>, config: &SystemConfig) -> io::Result<Self> {
        let name = name.into();
        Ok(Self {
            reactor: Reactor::new(name.clone(), config.poll_timeout)?,
            buffer_pool: BufferPool::new(config.processor_buffer_pool, config.processor_buffer_chunk),
            handler: WorkerPool::new(format!("{}-H", name), config.processor_handler)?,
            executor: WorkerPool::new(format!("{}-E", name), config.processor_executor)?,
            command_count: CommandCount::new(),
            frontends: RwLock::new(HashMap::new()),
            backends: RwLock::new(HashMap::new()),
            net_in_bytes: AtomicU64::new(0),
            net_out_bytes: AtomicU64::new(0),
            name,
        })
    }

    /// Starts the reactor threads.
    pub fn startup(&self) -> io::Result<()> {
        self.reactor.startup()?;
        info!(processor = %self.name, "Processor started");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    pub fn handler(&self) -> &WorkerPool {
        &self.handler
    }

    pub fn executor(&self) -> &WorkerPool {
        &self.executor
    }

    pub fn command_count(&self) -> &CommandCount {
        &self.command_count
    }

    pub fn net_in_bytes(&self) -> u64 {
        self.net_in_bytes.load(Ordering::Relaxed)
    }

    pub fn net_out_bytes(&self) -> u64 {
        self.net_out_bytes.load(Ordering::Relaxed)
    }

    pub fn add_net_in_bytes(&self, n: u64) {
        self.net_in_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_net_out_bytes(&self, n: u64) {
        self.net_out_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn post_register(&self, conn: Arc<dyn NioConnection>) {
        self.reactor.post_register(conn);
    }

    pub fn post_write(&self, conn: Arc<dyn NioConnection>) {
        self.reactor.post_write(conn);
    }

    pub fn add_frontend(&self, conn: Arc<FrontendConnection>) {
        insert(&self.frontends, &self.name, conn);
    }

    pub fn add_backend(&self, conn: Arc<BackendConnection>) {
        insert(&self.backends, &self.name, conn);
    }

    pub fn frontend(&self, id: u32) -> Option<Arc<FrontendConnection>> {
        read_lock(&self.frontends).get(&id).cloned()
    }

    pub fn backend(&self, id: u32) -> Option<Arc<BackendConnection>> {
        read_lock(&self.backends).get(&id).cloned()
    }

    pub fn frontends(&self) -> Vec<Arc<FrontendConnection>> {
        read_lock(&self.frontends).values().cloned().collect()
    }

    pub fn backends(&self) -> Vec<Arc<BackendConnection>> {
        read_lock(&self.backends).values().cloned().collect()
    }

    pub fn frontend_count(&self) -> usize {
        read_lock(&self.frontends).len()
    }

    pub fn backend_count(&self) -> usize {
        read_lock(&self.backends).len()
    }

    /// Sweeps both registries.
    pub fn check(&self) {
        let front = sweep(&self.frontends);
        let back = sweep(&self.backends);
        if front.cleaned + back.cleaned + front.stale + back.stale > 0 {
            debug!(
                processor = %self.name,
                frontends_cleaned = front.cleaned,
                backends_cleaned = back.cleaned,
                stale = front.stale + back.stale,
                "Registry sweep"
            );
        } else {
            trace!(processor = %self.name, checked = front.checked + back.checked, "Registry sweep");
        }
    }

    pub fn check_frontends(&self) -> SweepStats {
        sweep(&self.frontends)
    }

    pub fn check_backends(&self) -> SweepStats {
        sweep(&self.backends)
    }
}

fn read_lock<C>(registry: &Registry<C>) -> std::sync::RwLockReadGuard<'_, HashMap<u32, Arc<C>>> {
    registry.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<C>(registry: &Registry<C>) -> std::sync::RwLockWriteGuard<'_, HashMap<u32, Arc<C>>> {
    registry.write().unwrap_or_else(PoisonError::into_inner)
}

/// Inserts `conn` under its id. A different connection still holding that id
/// (the id counter wrapped) can no longer be reached by the sweep, so it is
/// closed and cleaned up here.
fn insert<C: NioConnection>(registry: &Registry<C>, processor: &str, conn: Arc<C>) {
    let id = conn.id();
    let displaced = write_lock(registry).insert(id, Arc::clone(&conn));
    if let Some(old) = displaced.filter(|old| !Arc::ptr_eq(old, &conn)) {
        warn!(processor, conn = id, "Connection id still in use, closing the previous holder");
        old.close();
        old.cleanup();
    }
}

/// Removes `key` only if it still maps to `conn`.
fn remove_if_same<C>(registry: &Registry<C>, key: u32, conn: &Arc<C>) -> bool {
    let mut map = write_lock(registry);
    match map.get(&key) {
        Some(current) if Arc::ptr_eq(current, conn) => {
            map.remove(&key);
            true
        }
        _ => false,
    }
}

/// One pass over a registry.
///
/// Works on a snapshot so inserts racing with the sweep are left for the
/// next pass. Removal and cleanup are tied together: whoever removes the
/// entry runs the cleanup, so it happens once.
fn sweep<C: NioConnection>(registry: &Registry<C>) -> SweepStats {
    let snapshot: Vec<(u32, Arc<C>)> = read_lock(registry)
        .iter()
        .map(|(key, conn)| (*key, Arc::clone(conn)))
        .collect();

    let mut stats = SweepStats::default();
    for (key, conn) in snapshot {
        stats.checked += 1;

        if conn.id() != key {
            if remove_if_same(registry, key, &conn) {
                stats.stale += 1;
            }
            continue;
        }

        if conn.is_closed() {
            if remove_if_same(registry, key, &conn) {
                conn.cleanup();
                stats.cleaned += 1;
            }
        } else {
            conn.idle_check();
        }
    }
    stats
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::connection::test_support::socket_pair;
    use crate::net::connection::ConnectionState;
    use crate::net::frontend::tests::RecordingSession;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    pub(crate) fn test_config() -> SystemConfig {
        SystemConfig {
            processors: 1,
            processor_handler: 0,
            processor_executor: 0,
            processor_buffer_pool: 16 * 4096,
            processor_buffer_chunk: 4096,
            poll_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn frontend(processor: &Arc<Processor>, id: u32, idle: Duration) -> Arc<FrontendConnection> {
        let (socket, peer, client) = socket_pair();
        // keep the client end open for the lifetime of the test process
        std::mem::forget(client);
        let conn = FrontendConnection::new(
            socket,
            peer,
            Arc::new(RecordingSession::default()),
            &SystemConfig {
                idle_timeout: idle,
                ..test_config()
            },
        );
        conn.core().set_id(id);
        conn.core().set_processor(Arc::clone(processor));
        processor.add_frontend(Arc::clone(&conn));
        conn
    }

    #[test]
    fn test_worker_pool_inline() {
        let pool = WorkerPool::new("Inline-H", 0).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        pool.execute(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_worker_pool_threads_are_named() {
        let pool = WorkerPool::new("Processor9-E", 2).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.execute(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("Processor9-E"));
    }

    #[test]
    fn test_worker_pool_survives_panicking_task() {
        let pool = WorkerPool::new("Panicky-E", 1).unwrap();
        pool.execute(|| panic!("task failure"));

        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_sweep_cleans_closed_connection_once() {
        let processor = Arc::new(Processor::new("Processor0", &test_config()).unwrap());
        let conn = frontend(&processor, 1, Duration::from_secs(3600));
        let pool_size = processor.buffer_pool().size();

        assert!(conn.close());
        processor.check();
        assert_eq!(processor.frontend_count(), 0);
        assert_eq!(conn.core().state(), ConnectionState::Cleaned);
        // staging buffer went back to the pool
        assert_eq!(processor.buffer_pool().size(), pool_size + 1);

        // a second sweep finds nothing to clean
        let stats = processor.check_frontends();
        assert_eq!(stats, SweepStats::default());
        assert_eq!(processor.buffer_pool().size(), pool_size + 1);
    }

    #[test]
    fn test_sweep_closes_idle_connection() {
        let processor = Arc::new(Processor::new("Processor0", &test_config()).unwrap());
        let idle = frontend(&processor, 1, Duration::ZERO);
        let busy = frontend(&processor, 2, Duration::from_secs(3600));
        thread::sleep(Duration::from_millis(5));

        let stats = processor.check_frontends();
        assert_eq!(stats.checked, 2);
        assert!(idle.is_closed());
        assert!(!busy.is_closed());

        // the next pass reaps it
        let stats = processor.check_frontends();
        assert_eq!(stats.cleaned, 1);
        assert_eq!(processor.frontend_count(), 1);
        assert!(processor.frontend(2).is_some());
    }

    #[test]
    fn test_reused_id_closes_previous_holder() {
        let processor = Arc::new(Processor::new("Processor0", &test_config()).unwrap());
        let old = frontend(&processor, 9, Duration::from_secs(3600));
        let new = frontend(&processor, 9, Duration::from_secs(3600));

        assert_eq!(processor.frontend_count(), 1);
        assert!(Arc::ptr_eq(&processor.frontend(9).unwrap(), &new));
        assert!(old.is_closed());
        assert_eq!(old.core().state(), ConnectionState::Cleaned);
        assert!(!new.is_closed());

        // adding the same connection again keeps it open
        processor.add_frontend(Arc::clone(&new));
        assert!(!new.is_closed());
    }

    #[test]
    fn test_sweep_drops_stale_entries() {
        let processor = Arc::new(Processor::new("Processor0", &test_config()).unwrap());
        let conn = frontend(&processor, 5, Duration::from_secs(3600));
        conn.core().set_id(6);

        let stats = processor.check_frontends();
        assert_eq!(stats.stale, 1);
        assert_eq!(processor.frontend_count(), 0);
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_net_counters() {
        let processor = Processor::new("Processor0", &test_config()).unwrap();
        processor.add_net_in_bytes(10);
        processor.add_net_out_bytes(4);
        processor.add_net_in_bytes(5);
        assert_eq!(processor.net_in_bytes(), 15);
        assert_eq!(processor.net_out_bytes(), 4);
        assert_eq!(processor.name(), "Processor0");
        assert_eq!(processor.handler().name(), "Processor0-H");
        assert_eq!(processor.executor().name(), "Processor0-E");
    }
}
