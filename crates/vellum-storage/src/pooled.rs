//! [`PooledDriver`] -- the pooled backend.
//!
//! Statements acquire a connection per call. A transaction pins one
//! connection for its whole duration: statements issued by the transaction's
//! thread route to the pinned connection, nested transactions become
//! savepoints on it, and other threads keep using the rest of the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
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
use crate::pool::{ConnectionFactory, Pool, PoolGuard, PoolStats};
use crate::sqlite::{
    configure_connection, map_sqlite_error, open_connection, read_row, ConnectTarget, Param,
};

struct Pinned {
    thread: ThreadId,
    guard: PoolGuard,
}

/// Driver over a bounded connection pool.
pub struct PooledDriver {
    pool: Pool,
    tx_lock: FairLock,
    pinned: Mutex<Option<Pinned>>,
    state: Mutex<DriverState>,
    closed: AtomicBool,
    /// For shared-memory targets: keeps the database alive even when the
    /// reaper empties the pool. `None` for file-backed targets.
    anchor: Mutex<Option<Connection>>,
}

impl PooledDriver {
    /// Opens a pooled driver for the configured target. In-memory configs
    /// get a named shared-cache database so every pooled connection sees the
    /// same data.
    pub fn connect(config: &DbConfig) -> Result<Self> {
        config.validate()?;
        let target = if config.memory {
            ConnectTarget::shared_memory()
        } else {
            let path = config.path.clone().ok_or_else(|| {
                VellumError::validation("config needs either a path or memory = true")
            })?;
            ConnectTarget::File(path)
        };
        info!(?target, "opening pooled SQLite database");

        // A shared-cache memory database disappears with its last
        // connection; the anchor outlives every pooled one.
        let anchor = if config.memory {
            Some(open_connection(&target)?)
        } else {
            None
        };

        let pragmas = config.pragmas.clone();
        let factory_target = target.clone();
        let factory: ConnectionFactory = Box::new(move || {
            let conn = open_connection(&factory_target)?;
            configure_connection(&conn, &pragmas)?;
            Ok(conn)
        });
        let pool = Pool::new(config.pool.clone().unwrap_or_default(), factory)?;

        let probe = pool.acquire()?;
        drop(probe);

        Ok(Self {
            pool,
            tx_lock: FairLock::new(),
            pinned: Mutex::new(None),
            state: Mutex::new(DriverState {
                connected: true,
                healthy: true,
                last_health_check: None,
                attempts: 0,
                last_error: None,
            }),
            closed: AtomicBool::new(false),
            anchor: Mutex::new(anchor),
        })
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn lock_pinned(&self) -> MutexGuard<'_, Option<Pinned>> {
        self.pinned.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(VellumError::DriverClosed)
        } else {
            Ok(())
        }
    }

    /// Runs `f` on the right connection: the pinned one when the calling
    /// thread owns the active transaction, otherwise a pool acquisition for
    /// the duration of the statement.
    ///
    /// The pin lock is held while `f` runs, so a streamed-row callback must
    /// not issue further statements against this driver (the same rule the
    /// single-connection driver imposes).
    fn with_statement_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        let me = thread::current().id();
        {
            let pinned = self.lock_pinned();
            if let Some(p) = pinned.as_ref() {
                if p.thread == me {
                    return f(p.guard.connection());
                }
            }
        }
        let guard = self.pool.acquire()?;
        f(guard.connection())
    }

    fn control_exec(&self, sql: &str) -> Result<()> {
        self.with_statement_conn(|conn| {
            conn.execute_batch(sql).map_err(|e| map_sqlite_error(&e, sql))
        })
    }

    fn pinned_by_me(&self) -> bool {
        let me = thread::current().id();
        self.lock_pinned()
            .as_ref()
            .map(|p| p.thread == me)
            .unwrap_or(false)
    }

    fn top_level_transaction(
        &self,
        f: &mut dyn FnMut(&dyn DriverConn) -> Result<()>,
    ) -> Result<()> {
        // Serialize top-level transactions per driver, FIFO.
        let _serial = self.tx_lock.acquire();
        self.ensure_open()?;

        let guard = self.pool.acquire()?;
        {
            let mut pinned = self.lock_pinned();
            *pinned = Some(Pinned {
                thread: thread::current().id(),
                guard,
            });
        }
        // Unpinned on every exit path, unwinds included, so a panicking
        // closure cannot leak the pinned connection.
        let _unpin = UnpinGuard { driver: self };
        debug!("pooled transaction pinned a connection");

        self.control_exec("BEGIN")?;

        let result = f(&PooledTxScope { driver: self });
        let outcome = match result {
            Ok(()) => match self.control_exec("COMMIT") {
                Ok(()) => Ok(()),
                Err(commit_err) => {
                    let _ = self.control_exec("ROLLBACK");
                    Err(commit_err)
                }
            },
            Err(user_err) => match self.control_exec("ROLLBACK") {
                Ok(()) => Err(user_err),
                Err(rollback_err) => {
                    if is_closed_error(&rollback_err) {
                        warn!("rollback revealed a closed database");
                        self.closed.store(true, Ordering::SeqCst);
                        let mut state = self.lock_state();
                        state.connected = false;
                        state.healthy = false;
                        Err(VellumError::TransactionDbClosed {
                            cause: Box::new(user_err),
                        })
                    } else {
                        warn!(error = %rollback_err, "rollback failed");
                        Err(user_err)
                    }
                }
            },
        };

        outcome
    }

    fn unpin(&self) {
        // Dropping the guard returns the connection to the pool.
        let mut pinned = self.lock_pinned();
        *pinned = None;
    }

    fn savepoint_transaction(
        &self,
        f: &mut dyn FnMut(&dyn DriverConn) -> Result<()>,
    ) -> Result<()> {
        let name = savepoint_name();
        debug!(savepoint = %name, "nested pooled transaction");
        self.control_exec(&format!("SAVEPOINT {name}"))?;
        match f(&PooledTxScope { driver: self }) {
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
    }
}

impl DriverConn for PooledDriver {
    fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        self.with_statement_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql).map_err(|e| map_sqlite_error(&e, sql))?;
            stmt.execute(rusqlite::params_from_iter(params.iter().map(Param)))
                .map_err(|e| map_sqlite_error(&e, sql))
        })
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.with_statement_conn(|conn| {
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
        self.with_statement_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql).map_err(|e| map_sqlite_error(&e, sql))?;
            let columns: Arc<Vec<String>> =
                Arc::new(stmt.column_names().iter().map(|c| c.to_string()).collect());
            let mut rows = stmt
                .query(rusqlite::params_from_iter(params.iter().map(Param)))
                .map_err(|e| map_sqlite_error(&e, sql))?;
            while let Some(row) = rows.next().map_err(|e| map_sqlite_error(&e, sql))? {
                on_row(read_row(&columns, row).map_err(|e| map_sqlite_error(&e, sql))?)?;
            }
            Ok(())
        })
    }

    fn transaction(&self, f: &mut dyn FnMut(&dyn DriverConn) -> Result<()>) -> Result<()> {
        if self.pinned_by_me() {
            self.savepoint_transaction(f)
        } else {
            self.top_level_transaction(f)
        }
    }
}

impl Driver for PooledDriver {
    fn state(&self) -> DriverState {
        self.lock_state().clone()
    }

    fn health_check(&self) -> Result<bool> {
        let probe = self.with_statement_conn(|conn| {
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
                Ok(false)
            }
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.unpin();
        self.pool.close();
        let mut anchor = self.anchor.lock().unwrap_or_else(|e| e.into_inner());
        *anchor = None;
        drop(anchor);
        let mut state = self.lock_state();
        state.connected = false;
        state.healthy = false;
        info!("pooled database closed");
        Ok(())
    }
}

impl std::fmt::Debug for PooledDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledDriver")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Unpins the transaction connection when the scope exits, however it
/// exits.
struct UnpinGuard<'a> {
    driver: &'a PooledDriver,
}

impl Drop for UnpinGuard<'_> {
    fn drop(&mut self) {
        self.driver.unpin();
    }
}

struct PooledTxScope<'a> {
    driver: &'a PooledDriver,
}

impl DriverConn for PooledTxScope<'_> {
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

fn is_closed_error(err: &VellumError) -> bool {
    match err {
        VellumError::DriverClosed | VellumError::PoolClosing => true,
        VellumError::Database { message, .. } => {
            let lower = message.to_ascii_lowercase();
            lower.contains("closed") || lower.contains("misuse")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::time::Duration;

    fn pooled_driver() -> PooledDriver {
        let mut config = DbConfig::in_memory();
        config.pool = Some(PoolConfig {
            min_connections: 1,
            max_connections: 4,
            acquire_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        });
        let driver = PooledDriver::connect(&config).unwrap();
        driver
            .exec(
                "CREATE TABLE t (_id TEXT PRIMARY KEY, n INTEGER NOT NULL)",
                &[],
            )
            .unwrap();
        driver
    }

    fn insert(conn: &dyn DriverConn, id: &str, n: i64) -> Result<usize> {
        conn.exec(
            "INSERT INTO t (_id, n) VALUES (?1, ?2)",
            &[SqlValue::Text(id.into()), SqlValue::Int(n)],
        )
    }

    fn count(driver: &PooledDriver) -> i64 {
        driver
            .query("SELECT COUNT(*) AS n FROM t", &[])
            .unwrap()[0]
            .get_i64("n")
            .unwrap()
    }

    #[test]
    fn statements_work_across_pooled_connections() {
        let driver = pooled_driver();
        insert(&driver, "a", 1).unwrap();
        insert(&driver, "b", 2).unwrap();
        assert_eq!(count(&driver), 2);
    }

    #[test]
    fn transaction_pins_and_rolls_back() {
        let driver = pooled_driver();
        let result = driver.transaction(&mut |tx| {
            insert(tx, "a", 1)?;
            // Statements issued via the driver on this thread route to the
            // pinned connection and join the transaction.
            insert(&driver, "b", 2)?;
            Err(VellumError::validation("abort"))
        });
        assert!(result.is_err());
        assert_eq!(count(&driver), 0);
    }

    #[test]
    fn nested_pooled_transaction_uses_savepoints() {
        let driver = pooled_driver();
        driver
            .transaction(&mut |tx| {
                insert(tx, "outer", 1)?;
                let inner = tx.transaction(&mut |inner_tx| {
                    insert(inner_tx, "inner", 2)?;
                    Err(VellumError::validation("inner abort"))
                });
                assert!(inner.is_err());
                Ok(())
            })
            .unwrap();
        assert_eq!(count(&driver), 1);
    }

    #[test]
    fn close_stops_operations() {
        let driver = pooled_driver();
        driver.close().unwrap();
        assert!(matches!(
            insert(&driver, "x", 1),
            Err(VellumError::DriverClosed)
        ));
    }
}
