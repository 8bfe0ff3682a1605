//! Connection opening, pragma application, parameter binding, row reading,
//! and backend-error mapping.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, OpenFlags, ToSql};
use tracing::debug;

use vellum_core::error::VellumError;
use vellum_query::SqlValue;

use crate::config::{SqlitePragmas, STATEMENT_CACHE_CAPACITY};
use crate::driver::Row;
use crate::mem;

/// Where a connection points.
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    File(PathBuf),
    /// Private in-memory database, one per connection.
    Memory,
    /// Named shared-cache in-memory database; connections opened with the
    /// same URI see the same data. This is what lets a pool run against an
    /// in-memory backend.
    SharedMemory(String),
}

impl ConnectTarget {
    /// A fresh shared-memory target with a unique name.
    pub fn shared_memory() -> Self {
        Self::SharedMemory(format!(
            "file:vellum_{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        ))
    }
}

pub(crate) fn open_connection(target: &ConnectTarget) -> Result<Connection, VellumError> {
    let conn = match target {
        ConnectTarget::File(path) => Connection::open(path).map_err(|e| {
            VellumError::database(format!("failed to open {}: {e}", path.display()))
        })?,
        ConnectTarget::Memory => Connection::open_in_memory()
            .map_err(|e| VellumError::database(format!("failed to open in-memory db: {e}")))?,
        ConnectTarget::SharedMemory(uri) => Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| VellumError::database(format!("failed to open shared memory db: {e}")))?,
    };
    Ok(conn)
}

/// Applies pragmas and sizes the statement cache. Pragma values were
/// whitelist-checked at configure time.
pub(crate) fn configure_connection(
    conn: &Connection,
    pragmas: &SqlitePragmas,
) -> Result<(), VellumError> {
    let fail = |e: rusqlite::Error| VellumError::database(format!("failed to set pragmas: {e}"));

    conn.pragma_update(None, "foreign_keys", "ON").map_err(fail)?;
    conn.pragma_update(
        None,
        "busy_timeout",
        pragmas.busy_timeout_ms.unwrap_or(5000),
    )
    .map_err(fail)?;

    if let Some(mode) = pragmas.journal_mode {
        // journal_mode returns the resulting mode as a row.
        conn.pragma_update_and_check(None, "journal_mode", mode.as_sql(), |_| Ok(()))
            .map_err(fail)?;
    }
    if let Some(sync) = pragmas.synchronous {
        conn.pragma_update(None, "synchronous", sync.as_sql()).map_err(fail)?;
    }
    if let Some(store) = pragmas.temp_store {
        conn.pragma_update(None, "temp_store", store.as_sql()).map_err(fail)?;
    }
    if let Some(mode) = pragmas.locking_mode {
        conn.pragma_update(None, "locking_mode", mode.as_sql()).map_err(fail)?;
    }
    if let Some(vacuum) = pragmas.auto_vacuum {
        conn.pragma_update(None, "auto_vacuum", vacuum.as_sql()).map_err(fail)?;
    }
    if let Some(pages) = pragmas.wal_autocheckpoint {
        conn.pragma_update(None, "wal_autocheckpoint", pages).map_err(fail)?;
    }

    let cache_size = match pragmas.page_cache_kib {
        Some(kib) => -i64::from(kib),
        None => mem::page_cache_size(),
    };
    conn.pragma_update(None, "cache_size", cache_size).map_err(fail)?;

    conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    debug!(cache_size, "connection configured");
    Ok(())
}

// ---------------------------------------------------------------------------
// Parameter binding & row reading
// ---------------------------------------------------------------------------

/// Bridges [`SqlValue`] to rusqlite's binding trait.
pub(crate) struct Param<'a>(pub &'a SqlValue);

impl ToSql for Param<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Int(n) => ToSqlOutput::Borrowed(ValueRef::Integer(*n)),
            SqlValue::Real(n) => ToSqlOutput::Borrowed(ValueRef::Real(*n)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// Reads one rusqlite row into the driver-agnostic [`Row`].
pub(crate) fn read_row(
    columns: &Arc<Vec<String>>,
    row: &rusqlite::Row<'_>,
) -> Result<Row, rusqlite::Error> {
    let mut values = Vec::with_capacity(columns.len());
    for idx in 0..columns.len() {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(n) => SqlValue::Int(n),
            ValueRef::Real(n) => SqlValue::Real(n),
            ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
        };
        values.push(value);
    }
    Ok(Row::new(Arc::clone(columns), values))
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Maps a rusqlite error to the taxonomy, inspecting structured constraint
/// codes first and falling back to message patterns.
pub(crate) fn map_sqlite_error(err: &rusqlite::Error, sql: &str) -> VellumError {
    if let rusqlite::Error::SqliteFailure(ffi_err, message) = err {
        let message = message.clone().unwrap_or_else(|| ffi_err.to_string());
        match ffi_err.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                if let Some(column) = constraint_column(&message) {
                    return VellumError::unique(column, None);
                }
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                return VellumError::validation("foreign key constraint failed");
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_NOTNULL => {
                if let Some(column) = constraint_column(&message) {
                    return VellumError::validation(format!(
                        "field '{column}' must not be null"
                    ));
                }
            }
            _ => {}
        }
        return map_backend_message(&message, sql);
    }
    map_backend_message(&err.to_string(), sql)
}

/// Message-pattern fallback for backends that do not surface structured
/// constraint codes.
pub(crate) fn map_backend_message(message: &str, sql: &str) -> VellumError {
    if message.contains("UNIQUE constraint failed") {
        if let Some(column) = constraint_column(message) {
            return VellumError::unique(column, None);
        }
    }
    if message.contains("FOREIGN KEY constraint") {
        return VellumError::validation("foreign key constraint failed");
    }
    if message.contains("NOT NULL constraint failed") {
        if let Some(column) = constraint_column(message) {
            return VellumError::validation(format!("field '{column}' must not be null"));
        }
    }
    VellumError::database_with_sql(message, sql)
}

/// Extracts the column from `"<KIND> constraint failed: table.column"`.
fn constraint_column(message: &str) -> Option<String> {
    let (_, detail) = message.split_once(':')?;
    // Multi-column constraints list "t.a, t.b"; report the first.
    let first = detail.split(',').next()?.trim();
    let column = first.rsplit('.').next()?.trim();
    if column.is_empty() {
        None
    } else {
        Some(column.to_string())
    }
}
