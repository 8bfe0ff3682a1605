//! [`SqliteDriver`] -- the single-connection SQLite driver.
//!
//! One `rusqlite::Connection` guarded by a mutex. Statements from the thread
//! that owns the active transaction pass through; statements from other
//! threads wait until the transaction finishes, so foreign work queues
//! behind `BEGIN` instead of silently joining the transaction. Top-level
//! transaction starts are serialized in arrival order by a FIFO lock.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Instant;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use vellum_core::error::{Result, VellumError};
use vellum_core::id::savepoint_name;
use vellum_query::SqlValue;

use crate::config::DbConfig;
use crate::driver::{Driver, DriverConn, DriverState, Row};
use crate::lock::FairLock;
use crate::sqlite::conn::{
    configure_connection, map_sqlite_error, open_connection, read_row, ConnectTarget, Param,
};

struct Core {
    conn: Option<Connection>,
    closed: bool,
    /// Thread currently running a top-level transaction, if any.
    tx_owner: Option<ThreadId>,
    /// Names of open savepoints, innermost last.
    savepoints: Vec<String>,
}

/// SQLite driver over a single shared connection.
pub struct SqliteDriver {
    target: ConnectTarget,
    config: DbConfig,
    core: Mutex<Core>,
    cv: Condvar,
    tx_lock: FairLock,
    state: Mutex<DriverState>,
}

impl SqliteDriver {
    /// Opens a driver for the configured target.
    pub fn connect(config: &DbConfig) -> Result<Self> {
        config.validate()?;
        let target = if config.memory {
            ConnectTarget::Memory
        } else {
            let path = config.path.clone().ok_or_else(|| {
                VellumError::validation("config needs either a path or memory = true")
            })?;
            ConnectTarget::File(path)
        };
        Self::connect_to(target, config.clone())
    }

    /// Opens a driver against an explicit target; used by the pool for
    /// shared-memory backends.
    pub fn connect_to(target: ConnectTarget, config: DbConfig) -> Result<Self> {
        info!(?target, "opening SQLite database");
        let conn = open_connection(&target)?;
        configure_connection(&conn, &config.pragmas)?;

        let driver = Self {
            target,
            config,
            core: Mutex::new(Core {
                conn: Some(conn),
                closed: false,
                tx_owner: None,
                savepoints: Vec::new(),
            }),
            cv: Condvar::new(),
            tx_lock: FairLock::new(),
            state: Mutex::new(DriverState {
                connected: true,
                healthy: true,
                last_health_check: None,
                attempts: 0,
                last_error: None,
            }),
        };
        Ok(driver)
    }

    /// Opens an in-memory driver with default configuration (tests,
    /// scratch databases).
    pub fn open_in_memory() -> Result<Self> {
        Self::connect(&DbConfig::in_memory())
    }

    /// Drops the live connection, simulating a lost backend. The next
    /// operation reconnects (file-backed targets only).
    pub fn disconnect(&self) {
        let mut core = self.lock_core();
        core.conn = None;
        drop(core);
        let mut state = self.lock_state();
        state.connected = false;
        state.healthy = false;
    }

    // -- Internals -----------------------------------------------------------

    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` with the live connection. Blocks while another thread's
    /// transaction is active; reconnects first if the connection is gone.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let me = thread::current().id();
        let mut core = self.lock_core();
        while core.tx_owner.is_some() && core.tx_owner != Some(me) {
            core = self.cv.wait(core).unwrap_or_else(|e| e.into_inner());
        }
        if core.closed {
            return Err(VellumError::DriverClosed);
        }
        if core.conn.is_none() {
            self.reconnect_locked(&mut core)?;
        }
        let conn = core.conn.as_ref().ok_or(VellumError::DriverClosed)?;
        f(conn)
    }

    /// Reconnects with linear backoff: attempt `n` sleeps `base * (n + 1)`.
    fn reconnect_locked(&self, core: &mut Core) -> Result<()> {
        if !self.config.auto_reconnect {
            return Err(VellumError::database(
                "driver is disconnected and auto-reconnect is disabled",
            ));
        }
        if matches!(self.target, ConnectTarget::Memory) {
            // A private in-memory database cannot be reconnected to; its
            // contents died with the connection.
            return Err(VellumError::DriverClosed);
        }

        let max_attempts = self.config.max_reconnect_attempts;
        let mut last_error = String::from("no attempts made");
        for attempt in 0..max_attempts {
            {
                let mut state = self.lock_state();
                state.attempts = attempt + 1;
            }
            thread::sleep(self.config.reconnect_delay * (attempt + 1));
            match open_connection(&self.target)
                .and_then(|conn| configure_connection(&conn, &self.config.pragmas).map(|()| conn))
            {
                Ok(conn) => {
                    info!(attempt = attempt + 1, "reconnected");
                    core.conn = Some(conn);
                    let mut state = self.lock_state();
                    state.connected = true;
                    state.healthy = true;
                    state.last_error = None;
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "reconnect attempt failed");
                    last_error = e.to_string();
                    let mut state = self.lock_state();
                    state.last_error = Some(last_error.clone());
                }
            }
        }
        let mut state = self.lock_state();
        state.connected = false;
        state.healthy = false;
        Err(VellumError::MaxReconnect {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Transaction-control statements bypass the prepared-statement cache.
    fn control_exec(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(sql).map_err(|e| map_sqlite_error(&e, sql)))
    }

    fn clear_tx_owner(&self) {
        let mut core = self.lock_core();
        core.tx_owner = None;
        core.savepoints.clear();
        drop(core);
        self.cv.notify_all();
    }

    fn top_level_transaction(
        &self,
        f: &mut dyn FnMut(&dyn DriverConn) -> Result<()>,
    ) -> Result<()> {
        // FIFO: queued transactions start strictly in arrival order, and the
        // next BEGIN is not observable until this COMMIT/ROLLBACK lands.
        let _serial = self.tx_lock.acquire();

        {
            let mut core = self.lock_core();
            if core.closed {
                return Err(VellumError::DriverClosed);
            }
            core.tx_owner = Some(thread::current().id());
        }
        // Ownership is cleared on every exit path, unwinds included, so a
        // panicking closure cannot wedge other threads behind a dead owner.
        let _owner = OwnerGuard { driver: self };

        // If an earlier panic unwound mid-transaction the connection may
        // still be inside one; clear it before BEGIN.
        let begin = self.with_conn(|conn| {
            if !conn.is_autocommit() {
                warn!("connection left in a transaction; rolling back");
                let _ = conn.execute_batch("ROLLBACK");
            }
            conn.execute_batch("BEGIN").map_err(|e| map_sqlite_error(&e, "BEGIN"))
        });
        begin?;
        debug!("transaction started");

        let result = f(&TxScope { driver: self });
        let outcome = match result {
            Ok(()) => match self.control_exec("COMMIT") {
                Ok(()) => Ok(()),
                Err(commit_err) => {
                    // Most commit failures already rolled back; make sure.
                    let _ = self.control_exec("ROLLBACK");
                    Err(commit_err)
                }
            },
            Err(user_err) => match self.control_exec("ROLLBACK") {
                Ok(()) => Err(user_err),
                Err(rollback_err) => {
                    if is_closed_error(&rollback_err) {
                        warn!("rollback revealed a closed database");
                        let mut core = self.lock_core();
                        core.closed = true;
                        core.conn = None;
                        drop(core);
                        let mut state = self.lock_state();
                        state.connected = false;
                        state.healthy = false;
                        Err(VellumError::TransactionDbClosed {
                            cause: Box::new(user_err),
                        })
                    } else {
                        // The original failure is what the caller needs.
                        warn!(error = %rollback_err, "rollback failed");
                        Err(user_err)
                    }
                }
            },
        };

        outcome
    }

    fn savepoint_transaction(
        &self,
        f: &mut dyn FnMut(&dyn DriverConn) -> Result<()>,
    ) -> Result<()> {
        let name = savepoint_name();
        {
            let mut core = self.lock_core();
            core.savepoints.push(name.clone());
        }
        debug!(savepoint = %name, "nested transaction");

        let result = (|| {
            self.control_exec(&format!("SAVEPOINT {name}"))?;
            match f(&TxScope { driver: self }) {
                Ok(()) => self.control_exec(&format!("RELEASE SAVEPOINT {name}")),
                Err(user_err) => {
                    if let Err(e) = self.control_exec(&format!("ROLLBACK TO SAVEPOINT {name}")) {
                        warn!(error = %e, savepoint = %name, "savepoint rollback failed");
                    } else {
                        let _ = self.control_exec(&format!("RELEASE SAVEPOINT {name}"));
                    }
                    Err(user_err)
                }
            }
        })();

        let mut core = self.lock_core();
        core.savepoints.pop();
        drop(core);
        result
    }
}

impl DriverConn for SqliteDriver {
    fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql).map_err(|e| map_sqlite_error(&e, sql))?;
            stmt.execute(rusqlite::params_from_iter(params.iter().map(Param)))
                .map_err(|e| map_sqlite_error(&e, sql))
        })
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql).map_err(|e| map_sqlite_error(&e, sql))?;
            let columns: Arc<Vec<String>> =
                Arc::new(stmt.column_names().iter().map(|c| c.to_string()).collect());
            let mut rows = stmt
                .query(rusqlite::params_from_iter(params.iter().map(Param)))
                .map_err(|e| map_sqlite_error(&e, sql))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(|e| map_sqlite_error(&e, sql))? {
                out.push(read_row(&columns, row).map_err(|e| map_sqlite_error(&e, sql))?);
            }
            Ok(out)
        })
    }

    fn query_streamed(
        &self,
        sql: &str,
        params: &[SqlValue],
        on_row: &mut dyn FnMut(Row) -> Result<()>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql).map_err(|e| map_sqlite_error(&e, sql))?;
            let columns: Arc<Vec<String>> =
                Arc::new(stmt.column_names().iter().map(|c| c.to_string()).collect());
            let mut rows = stmt
                .query(rusqlite::params_from_iter(params.iter().map(Param)))
                .map_err(|e| map_sqlite_error(&e, sql))?;
            // Rows are surfaced one at a time; the result set is never
            // materialized here.
            while let Some(row) = rows.next().map_err(|e| map_sqlite_error(&e, sql))? {
                on_row(read_row(&columns, row).map_err(|e| map_sqlite_error(&e, sql))?)?;
            }
            Ok(())
        })
    }

    fn transaction(&self, f: &mut dyn FnMut(&dyn DriverConn) -> Result<()>) -> Result<()> {
        let me = thread::current().id();
        let nested = {
            let core = self.lock_core();
            core.tx_owner == Some(me)
        };
        if nested {
            self.savepoint_transaction(f)
        } else {
            self.top_level_transaction(f)
        }
    }
}

impl Driver for SqliteDriver {
    fn state(&self) -> DriverState {
        self.lock_state().clone()
    }

    fn health_check(&self) -> Result<bool> {
        let probe = self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| map_sqlite_error(&e, "SELECT 1"))
        });
        let mut state = self.lock_state();
        state.last_health_check = Some(Instant::now());
        match probe {
            Ok(()) => {
                state.healthy = true;
                state.connected = true;
                Ok(true)
            }
            Err(VellumError::DriverClosed) => Err(VellumError::DriverClosed),
            Err(e) => {
                state.healthy = false;
                state.last_error = Some(e.to_string());
                drop(state);
                self.disconnect();
                Ok(false)
            }
        }
    }

    fn close(&self) -> Result<()> {
        let mut core = self.lock_core();
        if core.closed {
            return Ok(());
        }
        core.closed = true;
        if let Some(conn) = core.conn.take() {
            // Finalize every cached statement before the connection goes away.
            conn.flush_prepared_statement_cache();
        }
        drop(core);
        let mut state = self.lock_state();
        state.connected = false;
        state.healthy = false;
        drop(state);
        self.cv.notify_all();
        info!("database closed");
        Ok(())
    }
}

impl std::fmt::Debug for SqliteDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDriver")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Clears transaction ownership when the transaction scope exits, however
/// it exits.
struct OwnerGuard<'a> {
    driver: &'a SqliteDriver,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        self.driver.clear_tx_owner();
    }
}

/// Statement surface handed to transaction closures. Statements delegate to
/// the driver, whose owner check routes them onto the transaction's
/// connection; nested `transaction` calls become savepoints.
struct TxScope<'a> {
    driver: &'a SqliteDriver,
}

impl DriverConn for TxScope<'_> {
    fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        self.driver.exec(sql, params)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.driver.query(sql, params)
    }

    fn query_streamed(
        &self,
        sql: &str,
        params: &[SqlValue],
        on_row: &mut dyn FnMut(Row) -> Result<()>,
    ) -> Result<()> {
        self.driver.query_streamed(sql, params, on_row)
    }

    fn transaction(&self, f: &mut dyn FnMut(&dyn DriverConn) -> Result<()>) -> Result<()> {
        self.driver.transaction(f)
    }
}

/// Does this error indicate the underlying database handle is gone?
fn is_closed_error(err: &VellumError) -> bool {
    match err {
        VellumError::DriverClosed => true,
        VellumError::Database { message, .. } => {
            let lower = message.to_ascii_lowercase();
            lower.contains("closed") || lower.contains("misuse")
        }
        _ => false,
    }
}
