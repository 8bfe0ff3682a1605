//! The [`Database`] façade: owns the driver (single-connection or pooled),
//! the plugin manager, and the shared parse cache, and vends collections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use vellum_core::catalog::CollectionSchema;
use vellum_core::codec::DocumentCache;
use vellum_core::error::Result;
use vellum_query::SqlValue;

use crate::collection::Collection;
use crate::config::DbConfig;
use crate::driver::{Driver, DriverConn, DriverState, Row};
use crate::hooks::{Plugin, PluginManager};
use crate::pooled::PooledDriver;
use crate::sqlite::SqliteDriver;

/// A vellum database handle.
pub struct Database {
    driver: Arc<dyn Driver>,
    plugins: Arc<PluginManager>,
    cache: Arc<DocumentCache>,
    collections: Mutex<HashMap<String, Collection>>,
}

impl Database {
    /// Opens a database. A pool in the config selects the pooled backend,
    /// otherwise everything runs on a single shared connection.
    pub fn open(config: DbConfig) -> Result<Self> {
        config.validate()?;
        let driver: Arc<dyn Driver> = if config.pool.is_some() {
            Arc::new(PooledDriver::connect(&config)?)
        } else {
            Arc::new(SqliteDriver::connect(&config)?)
        };
        Ok(Self {
            driver,
            plugins: Arc::new(PluginManager::new(config.strict_plugins, config.hook_budget)),
            cache: Arc::new(DocumentCache::new()),
            collections: Mutex::new(HashMap::new()),
        })
    }

    /// Opens a private in-memory database with default configuration.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(DbConfig::in_memory())
    }

    /// Returns the collection for a schema, creating its table and indexes
    /// on first use. Subsequent calls with the same name return the cached
    /// collection.
    pub fn collection(&self, schema: CollectionSchema) -> Result<Collection> {
        let mut collections = self
            .collections
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = collections.get(&schema.name) {
            return Ok(existing.clone());
        }
        let name = schema.name.clone();
        let collection = Collection::create(
            Arc::clone(&self.driver),
            Arc::new(schema),
            Arc::clone(&self.plugins),
            Arc::clone(&self.cache),
        )?;
        collections.insert(name, collection.clone());
        Ok(collection)
    }

    /// Runs `f` inside a transaction. Nested calls (from within `f`, on the
    /// same thread) become savepoints; collection operations performed
    /// inside `f` join the transaction.
    pub fn transaction<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&dyn DriverConn) -> Result<()>,
    {
        self.driver.transaction(&mut f)
    }

    /// Raw query escape hatch (used by command-line tooling).
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.driver.query(sql, params)
    }

    /// Raw statement escape hatch.
    pub fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        self.driver.exec(sql, params)
    }

    /// Registers a plugin; hooks fire for every collection of this handle,
    /// in registration order.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.plugins.register(plugin);
    }

    pub fn state(&self) -> DriverState {
        self.driver.state()
    }

    pub fn health_check(&self) -> Result<bool> {
        self.driver.health_check()
    }

    /// Closes the underlying driver. Idempotent.
    pub fn close(&self) -> Result<()> {
        info!("closing database");
        self.driver.close()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.driver.close();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::hooks::PluginContext;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;
    use vellum_core::catalog::ConstrainedField;
    use vellum_core::error::VellumError;
    use vellum_core::shape::{FieldType, Shape};
    use vellum_core::value::{DocValue, ID_KEY};
    use vellum_core::SqlType;

    fn user_schema() -> CollectionSchema {
        let shape = Shape::new()
            .field("name", FieldType::String)
            .field("email", FieldType::Email);
        CollectionSchema::new("users", shape)
            .unwrap()
            .constrain(ConstrainedField::new("email", SqlType::Text).unique())
            .unwrap()
    }

    fn user(name: &str) -> DocValue {
        DocValue::object([
            ("name", DocValue::from(name)),
            (
                "email",
                DocValue::from(format!("{}@example.com", name.to_lowercase())),
            ),
        ])
    }

    #[test]
    fn collections_are_cached_by_name() {
        let db = Database::open_in_memory().unwrap();
        let a = db.collection(user_schema()).unwrap();
        let b = db.collection(user_schema()).unwrap();
        a.insert(user("Alice")).unwrap();
        assert_eq!(b.count().unwrap(), 1);
    }

    #[test]
    fn throwing_transaction_leaves_no_rows() {
        let db = Database::open_in_memory().unwrap();
        let users = db.collection(user_schema()).unwrap();

        let result = db.transaction(|_tx| {
            users.insert(user("Alice"))?;
            users.insert(user("Bob"))?;
            Err(VellumError::validation("abort everything"))
        });
        assert!(result.is_err());
        assert_eq!(users.count().unwrap(), 0);
    }

    #[test]
    fn nested_transaction_rolls_back_only_inner_work() {
        let db = Database::open_in_memory().unwrap();
        let users = db.collection(user_schema()).unwrap();

        db.transaction(|tx| {
            let mut u1 = user("Outer");
            u1.set_path(ID_KEY, DocValue::from("u1"));
            users.insert(u1)?;

            let inner = tx.transaction(&mut |_inner| {
                let mut u2 = user("Inner");
                u2.set_path(ID_KEY, DocValue::from("u2"));
                users.insert(u2)?;
                Err(VellumError::validation("inner failure"))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();

        assert!(users.find_by_id("u1").unwrap().is_some());
        assert!(users.find_by_id("u2").unwrap().is_none());
    }

    #[test]
    fn raw_query_escape_hatch() {
        let db = Database::open_in_memory().unwrap();
        let users = db.collection(user_schema()).unwrap();
        users.insert(user("Alice")).unwrap();

        let rows = db
            .query("SELECT COUNT(*) AS n FROM users", &[])
            .unwrap();
        assert_eq!(rows[0].get_i64("n"), Some(1));
    }

    #[test]
    fn close_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(
            db.query("SELECT 1", &[]),
            Err(VellumError::DriverClosed)
        ));
    }

    struct Audit {
        calls: Arc<StdMutex<Vec<String>>>,
        strict_fail: bool,
    }

    impl Plugin for Audit {
        fn name(&self) -> &str {
            "audit"
        }

        fn on_before(&self, ctx: &PluginContext<'_>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("before:{}", ctx.operation.as_str()));
            if self.strict_fail {
                Err(VellumError::validation("audit rejects"))
            } else {
                Ok(())
            }
        }

        fn on_after(&self, ctx: &PluginContext<'_>) -> Result<()> {
            let id = ctx
                .result
                .and_then(|d| d.doc_id())
                .unwrap_or("-")
                .to_string();
            self.calls
                .lock()
                .unwrap()
                .push(format!("after:{}:{id}", ctx.operation.as_str()));
            Ok(())
        }

        fn on_error(&self, ctx: &PluginContext<'_>) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("error:{}", ctx.operation.as_str()));
        }
    }

    #[test]
    fn hooks_fire_around_mutations() {
        let db = Database::open_in_memory().unwrap();
        let calls = Arc::new(StdMutex::new(Vec::new()));
        db.register_plugin(Arc::new(Audit {
            calls: Arc::clone(&calls),
            strict_fail: false,
        }));
        let users = db.collection(user_schema()).unwrap();

        let stored = users.insert(user("Alice")).unwrap();
        let seen = calls.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "before:insert".to_string(),
                format!("after:insert:{}", stored.doc_id().unwrap()),
            ]
        );
    }

    #[test]
    fn failed_mutations_route_to_error_hooks() {
        let db = Database::open_in_memory().unwrap();
        let calls = Arc::new(StdMutex::new(Vec::new()));
        db.register_plugin(Arc::new(Audit {
            calls: Arc::clone(&calls),
            strict_fail: false,
        }));
        let users = db.collection(user_schema()).unwrap();

        users.insert(user("Alice")).unwrap();
        let _ = users.insert(user("Alice")).unwrap_err(); // unique collision

        let seen = calls.lock().unwrap().clone();
        assert!(seen.contains(&"error:insert".to_string()), "calls: {seen:?}");
    }

    #[test]
    fn strict_hook_failure_aborts_the_operation() {
        let mut config = DbConfig::in_memory();
        config.strict_plugins = true;
        let db = Database::open(config).unwrap();
        let calls = Arc::new(StdMutex::new(Vec::new()));
        db.register_plugin(Arc::new(Audit {
            calls: Arc::clone(&calls),
            strict_fail: true,
        }));
        let users = db.collection(user_schema()).unwrap();

        let err = users.insert(user("Alice")).unwrap_err();
        assert_eq!(err.kind(), "plugin");
        assert_eq!(users.count().unwrap(), 0, "strict hook failure must block the write");
    }

    #[test]
    fn lax_hook_failure_does_not_block_the_operation() {
        let db = Database::open_in_memory().unwrap();
        let calls = Arc::new(StdMutex::new(Vec::new()));
        db.register_plugin(Arc::new(Audit {
            calls: Arc::clone(&calls),
            strict_fail: true,
        }));
        let users = db.collection(user_schema()).unwrap();

        users.insert(user("Alice")).unwrap();
        assert_eq!(users.count().unwrap(), 1);
    }

    #[test]
    fn pooled_database_end_to_end() {
        let mut config = DbConfig::in_memory();
        config.pool = Some(PoolConfig {
            min_connections: 1,
            max_connections: 4,
            ..PoolConfig::default()
        });
        let db = Database::open(config).unwrap();
        let users = db.collection(user_schema()).unwrap();

        let stored = users.insert(user("Alice")).unwrap();
        let found = users.find_by_id(stored.doc_id().unwrap()).unwrap();
        assert!(found.is_some());

        // Transactions pin a pooled connection and roll back atomically.
        let result = db.transaction(|_tx| {
            users.insert(user("Bob"))?;
            Err(VellumError::validation("abort"))
        });
        assert!(result.is_err());
        assert_eq!(users.count().unwrap(), 1);

        db.close().unwrap();
    }

    #[test]
    fn file_backed_database_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vellum.db");

        {
            let db = Database::open(DbConfig::file(&path)).unwrap();
            let users = db.collection(user_schema()).unwrap();
            let mut doc = user("Alice");
            doc.set_path(ID_KEY, DocValue::from("persisted"));
            users.insert(doc).unwrap();
        }

        let db = Database::open(DbConfig::file(&path)).unwrap();
        let users = db.collection(user_schema()).unwrap();
        let found = users.find_by_id("persisted").unwrap().unwrap();
        assert_eq!(found.get("name").and_then(DocValue::as_str), Some("Alice"));
    }
}
