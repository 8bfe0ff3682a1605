//! The driver contract: what every backend exposes to the collection runtime
//! and the database façade.

use std::sync::Arc;
use std::time::Instant;

use vellum_core::error::Result;
use vellum_query::SqlValue;

/// One result row: column names shared across the result set, values owned.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// The value of a named column, if the column exists.
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(SqlValue::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(SqlValue::as_i64)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }
}

/// Connection-health snapshot of a driver.
#[derive(Debug, Clone)]
pub struct DriverState {
    pub connected: bool,
    pub healthy: bool,
    pub last_health_check: Option<Instant>,
    /// Reconnect attempts made since the last successful connection.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl Default for DriverState {
    fn default() -> Self {
        Self {
            connected: false,
            healthy: false,
            last_health_check: None,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Statement execution surface, shared by drivers and transaction scopes.
///
/// Inside [`DriverConn::transaction`] the closure receives a scope whose
/// statements run on the transaction's connection; calling `transaction` on
/// that scope nests via savepoints.
pub trait DriverConn {
    /// Executes a statement, returning the number of affected rows.
    fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Runs a query, materializing all rows.
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Runs a query, handing rows to `on_row` one at a time without
    /// materializing the result set.
    ///
    /// `on_row` runs while the driver's connection is held: it must not
    /// issue further statements against this driver.
    fn query_streamed(
        &self,
        sql: &str,
        params: &[SqlValue],
        on_row: &mut dyn FnMut(Row) -> Result<()>,
    ) -> Result<()>;

    /// Runs `f` inside a transaction. Top-level calls are serialized per
    /// driver in arrival order; calls made while a transaction is active on
    /// the current scope nest via uniquely named savepoints.
    fn transaction(&self, f: &mut dyn FnMut(&dyn DriverConn) -> Result<()>) -> Result<()>;
}

/// A full backend driver.
pub trait Driver: DriverConn + Send + Sync {
    /// Current connection state.
    fn state(&self) -> DriverState;

    /// Issues the trivial health probe, updating state.
    fn health_check(&self) -> Result<bool>;

    /// Closes the driver; subsequent operations fail with `DriverClosed`.
    fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_lookup_by_name() {
        let columns = Arc::new(vec!["_id".to_string(), "_version".to_string()]);
        let row = Row::new(
            columns,
            vec![SqlValue::Text("u1".into()), SqlValue::Int(3)],
        );
        assert_eq!(row.get_str("_id"), Some("u1"));
        assert_eq!(row.get_i64("_version"), Some(3));
        assert!(row.get("missing").is_none());
    }
}
