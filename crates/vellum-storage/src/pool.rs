//! Bounded connection pool with FIFO waiter fairness and idle reaping.
//!
//! Acquire serves the oldest waiter first via tickets. Connections are
//! created lazily up to `max_connections`; a background reaper destroys
//! connections idle past `idle_timeout` (never dropping below
//! `min_connections`) and tops the pool back up to the minimum. `close`
//! runs exactly once, rejects every queued waiter, and is also triggered by
//! `Drop` so a forgotten pool cannot leak its reaper thread.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use vellum_core::error::{Result, VellumError};

use crate::config::PoolConfig;

/// Creates configured connections for the pool.
pub type ConnectionFactory = Box<dyn Fn() -> Result<Connection> + Send + Sync>;

struct IdleConn {
    conn: Connection,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConn>,
    /// Connections in existence, idle or handed out.
    total: usize,
    next_ticket: u64,
    now_serving: u64,
    /// Tickets abandoned by timed-out waiters, skipped when serving.
    cancelled: BTreeSet<u64>,
}

impl PoolState {
    fn advance_serving(&mut self) {
        self.now_serving += 1;
        while self.cancelled.remove(&self.now_serving) {
            self.now_serving += 1;
        }
    }

    fn cancel(&mut self, ticket: u64) {
        if ticket == self.now_serving {
            self.advance_serving();
        } else {
            self.cancelled.insert(ticket);
        }
    }
}

struct PoolShared {
    config: PoolConfig,
    factory: ConnectionFactory,
    state: Mutex<PoolState>,
    cv: Condvar,
    reaper_cv: Condvar,
    closed: AtomicBool,
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, conn: Connection) {
        let mut state = self.lock_state();
        if self.closed.load(Ordering::SeqCst) {
            state.total -= 1;
            drop(state);
            drop(conn);
            return;
        }
        state.idle.push_back(IdleConn {
            conn,
            idle_since: Instant::now(),
        });
        drop(state);
        // The front waiter picks the connection up directly.
        self.cv.notify_all();
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
}

/// A bounded pool of SQLite connections.
pub struct Pool {
    shared: Arc<PoolShared>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(config: PoolConfig, factory: ConnectionFactory) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(PoolShared {
            config,
            factory,
            state: Mutex::new(PoolState::default()),
            cv: Condvar::new(),
            reaper_cv: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        let reaper = spawn_reaper(Arc::clone(&shared));
        Ok(Self {
            shared,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Acquires a connection: the first idle one, a freshly created one when
    /// below `max_connections`, or the caller queues FIFO until a release.
    pub fn acquire(&self) -> Result<PoolGuard> {
        let start = Instant::now();
        let deadline = start + self.shared.config.acquire_timeout;

        let mut state = self.shared.lock_state();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                state.cancel(ticket);
                drop(state);
                self.shared.cv.notify_all();
                return Err(VellumError::PoolClosing);
            }

            if state.now_serving == ticket {
                if let Some(idle) = state.idle.pop_front() {
                    state.advance_serving();
                    drop(state);
                    self.shared.cv.notify_all();
                    return Ok(PoolGuard::new(idle.conn, Arc::clone(&self.shared)));
                }
                if state.total < self.shared.config.max_connections {
                    state.total += 1;
                    state.advance_serving();
                    drop(state);
                    self.shared.cv.notify_all();
                    return self.create_connection();
                }
            }

            let now = Instant::now();
            if now >= deadline {
                state.cancel(ticket);
                drop(state);
                self.shared.cv.notify_all();
                return Err(VellumError::AcquireTimeout {
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            let (guard, _) = self
                .shared
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// Creates a connection, retrying up to `max_retries` and enforcing the
    /// creation deadline. The caller already reserved a slot in `total`.
    fn create_connection(&self) -> Result<PoolGuard> {
        let started = Instant::now();
        let mut last_error: Option<VellumError> = None;

        for attempt in 0..self.shared.config.max_retries.max(1) {
            match (self.shared.factory)() {
                Ok(conn) => {
                    if started.elapsed() > self.shared.config.create_timeout {
                        // Too late to be useful; the waiter has moved on.
                        drop(conn);
                        self.forfeit_slot();
                        return Err(VellumError::CreateTimeout {
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    debug!(attempt = attempt + 1, "pool connection created");
                    return Ok(PoolGuard::new(conn, Arc::clone(&self.shared)));
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "pool connection creation failed");
                    last_error = Some(e);
                }
            }
        }
        self.forfeit_slot();
        Err(last_error.unwrap_or_else(|| VellumError::database("connection creation failed")))
    }

    fn forfeit_slot(&self) {
        let mut state = self.shared.lock_state();
        state.total -= 1;
        drop(state);
        self.shared.cv.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock_state();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            active: state.total - state.idle.len(),
        }
    }

    /// Stops the reaper, rejects all waiters, and destroys idle connections.
    /// Safe to call any number of times; only the first call acts.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing connection pool");
        self.shared.cv.notify_all();
        self.shared.reaper_cv.notify_all();

        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }

        let mut state = self.shared.lock_state();
        let destroyed = state.idle.len();
        state.total -= destroyed;
        state.idle.clear();
        drop(state);
        debug!(destroyed, "pool connections destroyed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("total", &stats.total)
            .field("idle", &stats.idle)
            .finish_non_exhaustive()
    }
}

fn spawn_reaper(shared: Arc<PoolShared>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("vellum-pool-reaper".into())
        .spawn(move || {
            let mut state = shared.lock_state();
            loop {
                let (guard, _) = shared
                    .reaper_cv
                    .wait_timeout(state, shared.config.reap_interval)
                    .unwrap_or_else(|e| e.into_inner());
                state = guard;
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                reap(&shared, &mut state);
            }
        })
        .expect("spawning the reaper thread")
}

/// One reaper tick: destroy idle connections past their timeout while
/// keeping at least `min_connections`, then top back up to the minimum.
fn reap(shared: &PoolShared, state: &mut PoolState) {
    let now = Instant::now();
    let min = shared.config.min_connections;

    let mut kept = VecDeque::with_capacity(state.idle.len());
    let mut destroyed = 0usize;
    while let Some(idle) = state.idle.pop_front() {
        let expired = now.duration_since(idle.idle_since) >= shared.config.idle_timeout;
        if expired && state.total > min {
            state.total -= 1;
            destroyed += 1;
            drop(idle);
        } else {
            kept.push_back(idle);
        }
    }
    state.idle = kept;
    if destroyed > 0 {
        debug!(destroyed, "reaped idle pool connections");
    }

    while state.total < min && !shared.closed.load(Ordering::SeqCst) {
        match (shared.factory)() {
            Ok(conn) => {
                state.total += 1;
                state.idle.push_back(IdleConn {
                    conn,
                    idle_since: now,
                });
                shared.cv.notify_all();
            }
            Err(e) => {
                warn!(error = %e, "pool top-up failed");
                break;
            }
        }
    }
}

/// A pooled connection; returns to the pool on drop.
pub struct PoolGuard {
    conn: Option<Connection>,
    shared: Arc<PoolShared>,
}

impl PoolGuard {
    fn new(conn: Connection, shared: Arc<PoolShared>) -> Self {
        Self {
            conn: Some(conn),
            shared,
        }
    }

    pub fn connection(&self) -> &Connection {
        self.conn.as_ref().expect("present until drop")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(conn);
        }
    }
}

impl std::fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").finish_non_exhaustive()
    }
}
