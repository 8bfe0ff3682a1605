//! The collection runtime: validated CRUD over one document table.
//!
//! Every mutation validates against the shape before touching SQL, keeps the
//! constrained-field columns in lockstep with the JSON document, bumps
//! `_version` by exactly one, and fires plugin hooks
//! `before -> SQL -> after` (`on_error` on failure).

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use vellum_core::catalog::{CollectionSchema, DOC_COLUMN};
use vellum_core::codec::{self, DocumentCache};
use vellum_core::error::{Result, VellumError};
use vellum_core::id::generate_id;
use vellum_core::shape::FieldType;
use vellum_core::value::{DocValue, ID_KEY, VERSION_KEY};

use vellum_query::builder::{QueryBuilder, QueryExecutor};
use vellum_query::plan::QueryPlan;
use vellum_query::{ddl, sql, SqlValue};

use crate::driver::{Driver, DriverConn, Row};
use crate::hooks::{HookStage, Operation, PluginContext, PluginManager};
use crate::update::UpdateOps;

/// A typed collection bound to a driver.
///
/// Cheap to clone; clones share the driver, schema, plugin manager, and
/// parse cache.
#[derive(Clone)]
pub struct Collection {
    schema: Arc<CollectionSchema>,
    driver: Arc<dyn Driver>,
    plugins: Arc<PluginManager>,
    cache: Arc<DocumentCache>,
}

impl Collection {
    /// Builds the collection, synchronously issuing its `CREATE TABLE` and
    /// index statements. Idempotent: existing tables are left untouched.
    pub(crate) fn create(
        driver: Arc<dyn Driver>,
        schema: Arc<CollectionSchema>,
        plugins: Arc<PluginManager>,
        cache: Arc<DocumentCache>,
    ) -> Result<Self> {
        for statement in ddl::all_statements(&schema) {
            driver.exec(&statement, &[])?;
        }
        debug!(collection = %schema.name, "collection ready");
        Ok(Self {
            schema,
            driver,
            plugins,
            cache,
        })
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    // -- CRUD ----------------------------------------------------------------

    /// Inserts a document. A missing `_id` is generated; `_version` is
    /// always 1. Returns the stored document.
    pub fn insert(&self, doc: DocValue) -> Result<DocValue> {
        self.before(Operation::Insert, Some(&doc))?;
        match self.insert_inner(doc) {
            Ok(stored) => {
                self.after(Operation::Insert, Some(&stored))?;
                Ok(stored)
            }
            Err(e) => {
                self.fail(Operation::Insert, &e);
                Err(e)
            }
        }
    }

    fn insert_inner(&self, mut doc: DocValue) -> Result<DocValue> {
        self.validate(&doc)?;
        let id = match doc.doc_id() {
            Some(id) => id.to_string(),
            None => generate_id(),
        };
        doc.set_path(ID_KEY, DocValue::from(id.as_str()));
        doc.set_path(VERSION_KEY, DocValue::Int(1));

        let text = codec::encode(&doc)?;
        let (sql_text, params) = sql::build_insert(&self.schema, &id, &text, &doc);
        self.driver
            .exec(&sql_text, &params)
            .map_err(|e| self.refine_error(e, Some(&id)))?;
        Ok(doc)
    }

    /// Inserts each document in turn. Not atomic: the first failure stops
    /// iteration and earlier inserts remain. Wrap in
    /// [`Database::transaction`](crate::db::Database::transaction) for
    /// all-or-nothing semantics.
    pub fn insert_many(&self, docs: Vec<DocValue>) -> Result<Vec<DocValue>> {
        let mut stored = Vec::with_capacity(docs.len());
        for doc in docs {
            stored.push(self.insert(doc)?);
        }
        Ok(stored)
    }

    /// Replaces the fields of an existing document with those of `partial`
    /// (top-level merge). Last writer wins; `_version` bumps by one.
    pub fn put(&self, id: &str, partial: DocValue) -> Result<DocValue> {
        self.before(Operation::Put, Some(&partial))?;
        match self.put_inner(id, partial) {
            Ok(stored) => {
                self.after(Operation::Put, Some(&stored))?;
                Ok(stored)
            }
            Err(e) => {
                self.fail(Operation::Put, &e);
                Err(e)
            }
        }
    }

    fn put_inner(&self, id: &str, partial: DocValue) -> Result<DocValue> {
        let fields = partial
            .as_object()
            .ok_or_else(|| VellumError::validation("partial update must be an object"))?
            .clone();

        let mut merged = self
            .find_by_id(id)?
            .ok_or_else(|| VellumError::not_found(id))?;
        let version = merged.doc_version().unwrap_or(1);
        for (name, value) in fields {
            if name == ID_KEY || name == VERSION_KEY {
                continue;
            }
            merged.set_path(&name, value);
        }
        self.validate(&merged)?;
        merged.set_path(ID_KEY, DocValue::from(id));
        merged.set_path(VERSION_KEY, DocValue::Int(version + 1));

        let text = codec::encode(&merged)?;
        let (sql_text, params) =
            sql::build_update(&self.schema, id, &text, &merged, version + 1, None);
        let affected = self
            .driver
            .exec(&sql_text, &params)
            .map_err(|e| self.refine_error(e, Some(id)))?;
        if affected == 0 {
            // The row vanished between read and write.
            return Err(VellumError::not_found(id));
        }
        Ok(merged)
    }

    /// Applies update operators inside a single statement guarded by
    /// `WHERE _id = ? AND _version = ?`.
    ///
    /// With `expected_version` the update succeeds only against that exact
    /// version (optimistic concurrency); without it the guard is the version
    /// just read, so a concurrent writer still surfaces as a
    /// `VersionMismatch` rather than a lost update.
    pub fn atomic_update(
        &self,
        id: &str,
        ops: &UpdateOps,
        expected_version: Option<i64>,
    ) -> Result<DocValue> {
        self.before(Operation::AtomicUpdate, None)?;
        match self.atomic_update_inner(id, ops, expected_version) {
            Ok(stored) => {
                self.after(Operation::AtomicUpdate, Some(&stored))?;
                Ok(stored)
            }
            Err(e) => {
                self.fail(Operation::AtomicUpdate, &e);
                Err(e)
            }
        }
    }

    fn atomic_update_inner(
        &self,
        id: &str,
        ops: &UpdateOps,
        expected_version: Option<i64>,
    ) -> Result<DocValue> {
        let mut doc = self
            .find_by_id(id)?
            .ok_or_else(|| VellumError::not_found(id))?;
        let actual = doc.doc_version().unwrap_or(1);
        if let Some(expected) = expected_version {
            if expected != actual {
                return Err(VellumError::VersionMismatch {
                    id: id.to_string(),
                    expected,
                    actual,
                });
            }
        }
        let guard = expected_version.unwrap_or(actual);

        ops.apply(&mut doc)?;
        self.validate(&doc)?;
        doc.set_path(VERSION_KEY, DocValue::Int(guard + 1));

        let text = codec::encode(&doc)?;
        let (sql_text, params) =
            sql::build_update(&self.schema, id, &text, &doc, guard + 1, Some(guard));
        let affected = self
            .driver
            .exec(&sql_text, &params)
            .map_err(|e| self.refine_error(e, Some(id)))?;
        if affected == 0 {
            // Lost the race: report who won.
            return match self.current_version(id)? {
                None => Err(VellumError::not_found(id)),
                Some(current) => Err(VellumError::VersionMismatch {
                    id: id.to_string(),
                    expected: guard,
                    actual: current,
                }),
            };
        }
        Ok(doc)
    }

    /// Removes a document; returns whether a row was affected.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let key = DocValue::from(id);
        self.before(Operation::Delete, Some(&key))?;
        let (sql_text, params) = sql::build_delete(&self.schema, id);
        match self
            .driver
            .exec(&sql_text, &params)
            .map_err(|e| self.refine_error(e, Some(id)))
        {
            Ok(affected) => {
                self.after(Operation::Delete, Some(&key))?;
                Ok(affected > 0)
            }
            Err(e) => {
                self.fail(Operation::Delete, &e);
                Err(e)
            }
        }
    }

    /// Deletes each id in turn. Not atomic, like [`Collection::insert_many`].
    pub fn delete_many(&self, ids: &[&str]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if self.delete(id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Creates or replaces the document at `id`. `_version` is 1 on create
    /// and bumps by one on replace.
    pub fn upsert(&self, id: &str, doc: DocValue) -> Result<DocValue> {
        self.before(Operation::Upsert, Some(&doc))?;
        match self.upsert_inner(id, doc) {
            Ok(stored) => {
                self.after(Operation::Upsert, Some(&stored))?;
                Ok(stored)
            }
            Err(e) => {
                self.fail(Operation::Upsert, &e);
                Err(e)
            }
        }
    }

    fn upsert_inner(&self, id: &str, mut doc: DocValue) -> Result<DocValue> {
        if doc.as_object().is_none() {
            return Err(VellumError::validation("document must be an object"));
        }
        doc.set_path(ID_KEY, DocValue::from(id));
        self.validate(&doc)?;

        let version = match self.current_version(id)? {
            Some(current) => current + 1,
            None => 1,
        };
        doc.set_path(VERSION_KEY, DocValue::Int(version));

        let text = codec::encode(&doc)?;
        let (sql_text, params) = sql::build_upsert(&self.schema, id, &text, &doc, version);
        self.driver
            .exec(&sql_text, &params)
            .map_err(|e| self.refine_error(e, Some(id)))?;
        Ok(doc)
    }

    /// Looks up a document by `_id`.
    pub fn find_by_id(&self, id: &str) -> Result<Option<DocValue>> {
        let (sql_text, params) = sql::build_find_by_id(&self.schema, id);
        let rows = self.driver.query(&sql_text, &params)?;
        rows.first().map(|row| self.reconstruct_full(row)).transpose()
    }

    /// Starts a fluent query.
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(&self.schema, self)
    }

    /// Number of documents in the collection.
    pub fn count(&self) -> Result<u64> {
        self.query().count()
    }

    // -- Row reconstruction --------------------------------------------------

    /// Rebuilds a document from a full row: decode the JSON (through the
    /// parse cache), then let the native columns win, which is how `SET
    /// NULL` cascades become visible without touching the stored JSON.
    fn reconstruct_full(&self, row: &Row) -> Result<DocValue> {
        let text = row
            .get_str(DOC_COLUMN)
            .ok_or_else(|| VellumError::database("row is missing the doc column"))?;
        let mut doc = self.cache.get_or_parse(text)?;

        if let Some(id) = row.get_str(ID_KEY) {
            doc.set_path(ID_KEY, DocValue::from(id));
        }
        if let Some(version) = row.get_i64(VERSION_KEY) {
            doc.set_path(VERSION_KEY, DocValue::Int(version));
        }
        for field in self.schema.constrained_fields() {
            if let Some(value) = row.get(&field.column()) {
                if value.is_null() && doc.get_path(&field.path).is_none() {
                    // Nothing stored on either side; don't invent a null.
                    continue;
                }
                let ty = self.schema.shape.descriptor_at(&field.path);
                doc.set_path(&field.path, doc_value_from_sql(value, ty));
            }
        }
        Ok(doc)
    }

    /// Rebuilds the projected subset of a document, reconstructing nested
    /// structure from dotted paths. Constrained-field columns win over the
    /// JSON extraction.
    fn reconstruct_projection(&self, paths: &[String], row: &Row) -> Result<DocValue> {
        let mut doc = DocValue::object::<&str>([]);
        for path in paths {
            match path.as_str() {
                ID_KEY => {
                    if let Some(id) = row.get_str(ID_KEY) {
                        doc.set_path(ID_KEY, DocValue::from(id));
                    }
                }
                VERSION_KEY => {
                    if let Some(version) = row.get_i64(VERSION_KEY) {
                        doc.set_path(VERSION_KEY, DocValue::Int(version));
                    }
                }
                _ => {
                    let raw = match self.schema.column_for(path) {
                        Some(column) => row.get(&column),
                        None => row.get(path),
                    };
                    let ty = self.schema.shape.descriptor_at(path);
                    let value = raw
                        .map(|v| doc_value_from_sql(v, ty))
                        .unwrap_or(DocValue::Null);
                    doc.set_path(path, value);
                }
            }
        }
        Ok(doc)
    }

    fn row_to_doc(&self, plan: &QueryPlan, row: &Row) -> Result<DocValue> {
        if plan.projection.is_empty() {
            self.reconstruct_full(row)
        } else {
            self.reconstruct_projection(&plan.projection, row)
        }
    }

    // -- Support -------------------------------------------------------------

    fn validate(&self, doc: &DocValue) -> Result<()> {
        self.schema
            .shape
            .validate(doc)
            .map_err(|e| VellumError::validation(e.to_string()))
    }

    fn current_version(&self, id: &str) -> Result<Option<i64>> {
        let (sql_text, params) = sql::build_find_by_id(&self.schema, id);
        Ok(self
            .driver
            .query(&sql_text, &params)?
            .first()
            .and_then(|row| row.get_i64(VERSION_KEY)))
    }

    /// Re-keys constraint errors from column names to document field paths
    /// and attaches the offending `_id`.
    fn refine_error(&self, err: VellumError, id: Option<&str>) -> VellumError {
        match err {
            VellumError::UniqueConstraint { field, .. } => {
                let path = self
                    .schema
                    .path_for_column(&field)
                    .map(str::to_string)
                    .unwrap_or(field);
                VellumError::UniqueConstraint {
                    field: path,
                    id: id.map(str::to_string),
                }
            }
            other => other,
        }
    }

    // -- Hooks ---------------------------------------------------------------

    fn context<'a>(
        &'a self,
        operation: Operation,
        data: Option<&'a DocValue>,
        result: Option<&'a DocValue>,
        error: Option<&'a VellumError>,
    ) -> PluginContext<'a> {
        PluginContext {
            collection: &self.schema.name,
            schema: &self.schema,
            operation,
            data,
            result,
            error,
        }
    }

    fn before(&self, operation: Operation, data: Option<&DocValue>) -> Result<()> {
        if self.plugins.is_empty() {
            return Ok(());
        }
        self.plugins
            .execute_hook_safe(HookStage::Before, &self.context(operation, data, None, None))
    }

    fn after(&self, operation: Operation, result: Option<&DocValue>) -> Result<()> {
        if self.plugins.is_empty() {
            return Ok(());
        }
        self.plugins
            .execute_hook_safe(HookStage::After, &self.context(operation, result, result, None))
    }

    fn fail(&self, operation: Operation, error: &VellumError) {
        if self.plugins.is_empty() {
            return;
        }
        self.plugins
            .route_error(&self.context(operation, None, None, None), error);
    }
}

impl QueryExecutor for Collection {
    fn run_select(&self, plan: &QueryPlan) -> Result<Vec<DocValue>> {
        let (sql_text, params) = sql::build_select(&self.schema, plan);
        let rows = self.driver.query(&sql_text, &params)?;
        rows.iter().map(|row| self.row_to_doc(plan, row)).collect()
    }

    fn run_count(&self, plan: &QueryPlan) -> Result<u64> {
        let (sql_text, params) = sql::build_count(&self.schema, plan);
        let rows = self.driver.query(&sql_text, &params)?;
        Ok(rows
            .first()
            .and_then(|row| row.get_i64("n"))
            .unwrap_or(0)
            .max(0) as u64)
    }

    fn run_stream(
        &self,
        plan: &QueryPlan,
        on_doc: &mut dyn FnMut(DocValue) -> Result<()>,
    ) -> Result<()> {
        let (sql_text, params) = sql::build_select(&self.schema, plan);
        self.driver
            .query_streamed(&sql_text, &params, &mut |row| {
                on_doc(self.row_to_doc(plan, &row)?)
            })
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.schema.name)
            .finish_non_exhaustive()
    }
}

/// Converts a native column (or `json_extract`) value back into a document
/// value, guided by the declared field type when one is known.
fn doc_value_from_sql(value: &SqlValue, ty: Option<&FieldType>) -> DocValue {
    match value {
        SqlValue::Null => DocValue::Null,
        SqlValue::Int(n) => match ty {
            Some(FieldType::Bool) => DocValue::Bool(*n != 0),
            _ => DocValue::Int(*n),
        },
        SqlValue::Real(n) => DocValue::Float(*n),
        SqlValue::Text(s) => {
            if matches!(ty, Some(FieldType::Date)) {
                if let Ok(instant) = chrono::DateTime::parse_from_rfc3339(s) {
                    return DocValue::Date(instant.with_timezone(&Utc));
                }
            }
            // Composite values and tagged dates come back as JSON text from
            // json_extract; revive them unless the shape says plain text.
            let structural = !matches!(
                ty,
                Some(FieldType::String | FieldType::Email | FieldType::Uuid)
            );
            let trimmed = s.trim_start();
            if structural && (trimmed.starts_with('{') || trimmed.starts_with('[')) {
                if let Ok(parsed) = codec::decode(s) {
                    if matches!(
                        parsed,
                        DocValue::Object(_) | DocValue::Array(_) | DocValue::Date(_)
                    ) {
                        return parsed;
                    }
                }
            }
            DocValue::String(s.clone())
        }
        // Documents do not model raw blobs.
        SqlValue::Blob(_) => DocValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteDriver;
    use pretty_assertions::assert_eq;
    use vellum_core::catalog::{ConstrainedField, FkAction};
    use vellum_core::shape::Shape;
    use vellum_core::SqlType;
    use vellum_query::SortDir;

    fn harness() -> (Arc<SqliteDriver>, Arc<PluginManager>, Arc<DocumentCache>) {
        (
            Arc::new(SqliteDriver::open_in_memory().unwrap()),
            Arc::new(PluginManager::new(false, None)),
            Arc::new(DocumentCache::new()),
        )
    }

    fn users_schema() -> CollectionSchema {
        let shape = Shape::new()
            .field("name", FieldType::String)
            .field("age", FieldType::Number)
            .field("email", FieldType::Email)
            .field(
                "tags",
                FieldType::Optional(Box::new(FieldType::Array(Box::new(FieldType::String)))),
            )
            .field(
                "profile",
                FieldType::Optional(Box::new(FieldType::Any)),
            );
        CollectionSchema::new("users", shape)
            .unwrap()
            .constrain(ConstrainedField::new("email", SqlType::Text).unique())
            .unwrap()
    }

    fn users(driver: &Arc<SqliteDriver>) -> Collection {
        let (_, plugins, cache) = harness();
        Collection::create(
            Arc::clone(driver) as Arc<dyn Driver>,
            Arc::new(users_schema()),
            plugins,
            cache,
        )
        .unwrap()
    }

    fn alice() -> DocValue {
        DocValue::object([
            ("name", DocValue::from("Alice")),
            ("age", DocValue::from(30i64)),
            ("email", DocValue::from("alice@example.com")),
        ])
    }

    #[test]
    fn insert_generates_id_and_version_and_reads_back_equal() {
        let (driver, ..) = harness();
        let users = users(&driver);

        let stored = users.insert(alice()).unwrap();
        let id = stored.doc_id().expect("generated _id").to_string();
        assert_eq!(id.len(), 36, "expected a canonical UUID");
        assert_eq!(stored.doc_version(), Some(1));

        let found = users.find_by_id(&id).unwrap().expect("row exists");
        assert_eq!(found, stored);
    }

    #[test]
    fn insert_respects_caller_supplied_id() {
        let (driver, ..) = harness();
        let users = users(&driver);
        let mut doc = alice();
        doc.set_path(ID_KEY, DocValue::from("u-1"));
        let stored = users.insert(doc).unwrap();
        assert_eq!(stored.doc_id(), Some("u-1"));

        // A second insert with the same _id collides on the primary key.
        let mut dup = alice();
        dup.set_path(ID_KEY, DocValue::from("u-1"));
        dup.set_path("email", DocValue::from("other@example.com"));
        let err = users.insert(dup).unwrap_err();
        assert!(err.is_unique_violation(), "got {err:?}");
    }

    #[test]
    fn invalid_document_never_reaches_sql() {
        let (driver, ..) = harness();
        let users = users(&driver);
        let mut doc = alice();
        doc.set_path("age", DocValue::from("thirty"));
        let err = users.insert(doc).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(users.count().unwrap(), 0);
    }

    #[test]
    fn unique_constraint_names_the_field_and_id() {
        let (driver, ..) = harness();
        let users = users(&driver);
        users.insert(alice()).unwrap();

        let mut bob = alice();
        bob.set_path("name", DocValue::from("Bob"));
        bob.set_path(ID_KEY, DocValue::from("bob-1"));
        let err = users.insert(bob).unwrap_err();
        match err {
            VellumError::UniqueConstraint { field, id } => {
                assert_eq!(field, "email");
                assert_eq!(id.as_deref(), Some("bob-1"));
            }
            other => panic!("expected unique constraint, got {other:?}"),
        }
    }

    #[test]
    fn dates_round_trip_exactly() {
        let (driver, ..) = harness();
        let users = users(&driver);
        let instant = chrono::DateTime::parse_from_rfc3339("2024-03-04T05:06:07.890Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut doc = alice();
        doc.set_path("profile", DocValue::object([("joined", DocValue::Date(instant))]));

        let stored = users.insert(doc).unwrap();
        let found = users
            .find_by_id(stored.doc_id().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(
            found.get_path("profile.joined").and_then(DocValue::as_date),
            Some(instant)
        );
    }

    #[test]
    fn versions_are_monotonic_across_mutations() {
        let (driver, ..) = harness();
        let users = users(&driver);
        let stored = users.insert(alice()).unwrap();
        let id = stored.doc_id().unwrap().to_string();
        assert_eq!(stored.doc_version(), Some(1));

        let put = users
            .put(&id, DocValue::object([("age", DocValue::from(31i64))]))
            .unwrap();
        assert_eq!(put.doc_version(), Some(2));
        assert_eq!(put.get("age"), Some(&DocValue::Int(31)));
        // Untouched fields survive the merge.
        assert_eq!(put.get("name").and_then(DocValue::as_str), Some("Alice"));

        let updated = users
            .atomic_update(&id, &UpdateOps::new().inc("age", 1i64), None)
            .unwrap();
        assert_eq!(updated.doc_version(), Some(3));

        let upserted = users.upsert(&id, alice()).unwrap();
        assert_eq!(upserted.doc_version(), Some(4));
    }

    #[test]
    fn optimistic_concurrency_one_winner() {
        let (driver, ..) = harness();
        let users = users(&driver);
        let mut account = DocValue::object([
            ("name", DocValue::from("Acct")),
            ("age", DocValue::from(0i64)),
            ("email", DocValue::from("acct@example.com")),
        ]);
        account.set_path("profile", DocValue::object([("balance", DocValue::from(100i64))]));
        let stored = users.insert(account).unwrap();
        let id = stored.doc_id().unwrap().to_string();

        // Two readers observe version 1.
        let seen_a = users.find_by_id(&id).unwrap().unwrap().doc_version().unwrap();
        let seen_b = users.find_by_id(&id).unwrap().unwrap().doc_version().unwrap();
        assert_eq!((seen_a, seen_b), (1, 1));

        let ops = UpdateOps::new().inc("profile.balance", 50i64);
        let won = users.atomic_update(&id, &ops, Some(seen_a)).unwrap();
        assert_eq!(won.doc_version(), Some(2));
        assert_eq!(
            won.get_path("profile.balance"),
            Some(&DocValue::Int(150))
        );

        let err = users.atomic_update(&id, &ops, Some(seen_b)).unwrap_err();
        match err {
            VellumError::VersionMismatch { expected, actual, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[test]
    fn atomic_update_operators() {
        let (driver, ..) = harness();
        let users = users(&driver);
        let mut doc = alice();
        doc.set_path(
            "tags",
            DocValue::from(vec![DocValue::from("old"), DocValue::from("keep")]),
        );
        let stored = users.insert(doc).unwrap();
        let id = stored.doc_id().unwrap().to_string();

        let ops = UpdateOps::new()
            .set("name", "Alicia")
            .inc("age", 5i64)
            .push("tags", "new")
            .pull("tags", "old")
            .unset("profile");
        let updated = users.atomic_update(&id, &ops, None).unwrap();

        assert_eq!(updated.get("name").and_then(DocValue::as_str), Some("Alicia"));
        assert_eq!(updated.get("age"), Some(&DocValue::Int(35)));
        assert_eq!(
            updated.get("tags"),
            Some(&DocValue::from(vec![
                DocValue::from("keep"),
                DocValue::from("new")
            ]))
        );
        assert!(updated.get("profile").is_none());
    }

    #[test]
    fn missing_rows_surface_not_found() {
        let (driver, ..) = harness();
        let users = users(&driver);
        assert!(users.find_by_id("ghost").unwrap().is_none());

        let err = users
            .put("ghost", DocValue::object([("age", DocValue::from(1i64))]))
            .unwrap_err();
        assert!(err.is_not_found());

        let err = users
            .atomic_update("ghost", &UpdateOps::new().inc("age", 1i64), None)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_reports_whether_a_row_was_hit() {
        let (driver, ..) = harness();
        let users = users(&driver);
        let stored = users.insert(alice()).unwrap();
        let id = stored.doc_id().unwrap().to_string();

        assert!(users.delete(&id).unwrap());
        assert!(!users.delete(&id).unwrap());
        assert!(users.find_by_id(&id).unwrap().is_none());
    }

    #[test]
    fn upsert_on_plain_collection_replaces() {
        let (driver, plugins, cache) = harness();
        // No constrained fields: the INSERT OR REPLACE path.
        let schema = CollectionSchema::new("notes", Shape::permissive()).unwrap();
        let notes = Collection::create(
            Arc::clone(&driver) as Arc<dyn Driver>,
            Arc::new(schema),
            plugins,
            cache,
        )
        .unwrap();

        let first = notes
            .upsert("n1", DocValue::object([("text", DocValue::from("one"))]))
            .unwrap();
        assert_eq!(first.doc_version(), Some(1));

        let second = notes
            .upsert("n1", DocValue::object([("text", DocValue::from("two"))]))
            .unwrap();
        assert_eq!(second.doc_version(), Some(2));

        assert_eq!(notes.count().unwrap(), 1);
        let found = notes.find_by_id("n1").unwrap().unwrap();
        assert_eq!(found.get("text").and_then(DocValue::as_str), Some("two"));
        assert_eq!(found.doc_version(), Some(2));
    }

    #[test]
    fn upsert_with_constrained_fields_refreshes_columns() {
        let (driver, ..) = harness();
        let users = users(&driver);
        users.upsert("u1", alice()).unwrap();

        let mut changed = alice();
        changed.set_path("email", DocValue::from("new@example.com"));
        let stored = users.upsert("u1", changed).unwrap();
        assert_eq!(stored.doc_version(), Some(2));

        // The native column moved with the document.
        let rows = driver
            .query("SELECT email, _version FROM users WHERE _id = ?1", &[SqlValue::Text("u1".into())])
            .unwrap();
        assert_eq!(rows[0].get_str("email"), Some("new@example.com"));
        assert_eq!(rows[0].get_i64("_version"), Some(2));
    }

    #[test]
    fn constrained_column_agrees_with_doc_json() {
        let (driver, ..) = harness();
        let users = users(&driver);
        let stored = users.insert(alice()).unwrap();
        let id = stored.doc_id().unwrap().to_string();
        users
            .put(&id, DocValue::object([("email", DocValue::from("moved@example.com"))]))
            .unwrap();

        let rows = driver
            .query(
                "SELECT email, json_extract(doc, '$.email') AS doc_email FROM users WHERE _id = ?1",
                &[SqlValue::Text(id.clone())],
            )
            .unwrap();
        assert_eq!(rows[0].get_str("email"), rows[0].get_str("doc_email"));
        assert_eq!(rows[0].get_str("email"), Some("moved@example.com"));
    }

    #[test]
    fn bulk_insert_is_not_atomic() {
        let (driver, ..) = harness();
        let users = users(&driver);

        let mut dup = alice(); // collides with the first on email
        dup.set_path("name", DocValue::from("Dup"));
        let mut last = alice();
        last.set_path("email", DocValue::from("last@example.com"));

        let err = users.insert_many(vec![alice(), dup, last]).unwrap_err();
        assert!(err.is_unique_violation());
        // The first insert survived; the third was never attempted.
        assert_eq!(users.count().unwrap(), 1);
    }

    #[test]
    fn query_filters_order_and_paginate() {
        let (driver, ..) = harness();
        let users = users(&driver);
        for (name, age) in [("Alice", 30i64), ("Bob", 25), ("Cara", 35), ("Dan", 20)] {
            let mut doc = alice();
            doc.set_path("name", DocValue::from(name));
            doc.set_path("age", DocValue::from(age));
            doc.set_path(
                "email",
                DocValue::from(format!("{}@example.com", name.to_lowercase())),
            );
            users.insert(doc).unwrap();
        }

        let adults = users
            .query()
            .where_field("age")
            .gte(25i64)
            .order_by("age", SortDir::Desc)
            .to_vec()
            .unwrap();
        let names: Vec<&str> = adults
            .iter()
            .map(|d| d.get("name").and_then(DocValue::as_str).unwrap())
            .collect();
        assert_eq!(names, vec!["Cara", "Alice", "Bob"]);

        let page2 = users
            .query()
            .order_by("age", SortDir::Asc)
            .page(2, 2)
            .to_vec()
            .unwrap();
        let names: Vec<&str> = page2
            .iter()
            .map(|d| d.get("name").and_then(DocValue::as_str).unwrap())
            .collect();
        assert_eq!(names, vec!["Alice", "Cara"]);

        let count = users.query().where_field("age").lt(30i64).count().unwrap();
        assert_eq!(count, 2);

        let first = users
            .query()
            .where_field("name")
            .starts_with("Bo")
            .first()
            .unwrap()
            .unwrap();
        assert_eq!(first.get("name").and_then(DocValue::as_str), Some("Bob"));
    }

    #[test]
    fn or_groups_combine_with_and() {
        let (driver, ..) = harness();
        let users = users(&driver);
        for (name, age) in [("Alice", 30i64), ("Bob", 16), ("Cara", 70)] {
            let mut doc = alice();
            doc.set_path("name", DocValue::from(name));
            doc.set_path("age", DocValue::from(age));
            doc.set_path(
                "email",
                DocValue::from(format!("{}@example.com", name.to_lowercase())),
            );
            users.insert(doc).unwrap();
        }

        let minors_or_seniors = users
            .query()
            .or_where(|b| b.where_field("age").lt(18i64))
            .or_where(|b| b.where_field("age").gt(65i64))
            .to_vec()
            .unwrap();
        let mut names: Vec<&str> = minors_or_seniors
            .iter()
            .map(|d| d.get("name").and_then(DocValue::as_str).unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Bob", "Cara"]);
    }

    #[test]
    fn nested_projection_reconstructs_structure() {
        let (driver, ..) = harness();
        let users = users(&driver);
        let mut doc = alice();
        doc.set_path(
            "profile",
            DocValue::object([(
                "professional",
                DocValue::object([(
                    "position",
                    DocValue::object([
                        ("level", DocValue::from(4i64)),
                        (
                            "department",
                            DocValue::object([(
                                "division",
                                DocValue::object([("region", DocValue::from("NA"))]),
                            )]),
                        ),
                    ]),
                )]),
            )]),
        );
        users.insert(doc).unwrap();

        let projected = users
            .query()
            .select([
                "name",
                "profile.professional.position.department.division.region",
            ])
            .to_vec()
            .unwrap();

        assert_eq!(projected.len(), 1);
        let expected = {
            let mut d = DocValue::object([("name", DocValue::from("Alice"))]);
            d.set_path(
                "profile.professional.position.department.division.region",
                DocValue::from("NA"),
            );
            d
        };
        assert_eq!(projected[0], expected);
    }

    #[test]
    fn projection_matches_full_results_by_id() {
        let (driver, ..) = harness();
        let users = users(&driver);
        for i in 0..4 {
            let mut doc = alice();
            doc.set_path("email", DocValue::from(format!("u{i}@example.com")));
            doc.set_path("age", DocValue::from(20 + i));
            users.insert(doc).unwrap();
        }

        let full = users.query().where_field("age").gte(21i64).to_vec().unwrap();
        let projected = users
            .query()
            .where_field("age")
            .gte(21i64)
            .select([ID_KEY, "age"])
            .to_vec()
            .unwrap();

        let mut full_ids: Vec<String> = full
            .iter()
            .map(|d| d.doc_id().unwrap().to_string())
            .collect();
        let mut projected_ids: Vec<String> = projected
            .iter()
            .map(|d| d.doc_id().unwrap().to_string())
            .collect();
        full_ids.sort();
        projected_ids.sort();
        assert_eq!(full_ids, projected_ids);
    }

    #[test]
    fn streaming_visits_every_row() {
        let (driver, ..) = harness();
        let users = users(&driver);
        for i in 0..5 {
            let mut doc = alice();
            doc.set_path("email", DocValue::from(format!("s{i}@example.com")));
            users.insert(doc).unwrap();
        }
        let mut seen = 0;
        users
            .query()
            .for_each(|doc| {
                assert!(doc.doc_id().is_some());
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 5);
    }

    #[test]
    fn unknown_field_filter_fails_at_terminal() {
        let (driver, ..) = harness();
        let users = users(&driver);
        let err = users.query().where_field("nonexistent").eq(1i64).to_vec();
        assert!(matches!(err, Err(VellumError::Validation { .. })));
    }

    // -- Foreign keys --------------------------------------------------------

    fn posts_schema(on_delete: FkAction) -> CollectionSchema {
        let shape = Shape::new()
            .field("title", FieldType::String)
            .field(
                "author_id",
                FieldType::Optional(Box::new(FieldType::String)),
            );
        CollectionSchema::new("posts", shape)
            .unwrap()
            .constrain(
                ConstrainedField::new("author_id", SqlType::Text)
                    .nullable()
                    .references("users", on_delete),
            )
            .unwrap()
    }

    #[test]
    fn foreign_key_violation_maps_to_validation() {
        let (driver, plugins, cache) = harness();
        let _users = users(&driver);
        let posts = Collection::create(
            Arc::clone(&driver) as Arc<dyn Driver>,
            Arc::new(posts_schema(FkAction::Restrict)),
            plugins,
            cache,
        )
        .unwrap();

        let orphan = DocValue::object([
            ("title", DocValue::from("dangling")),
            ("author_id", DocValue::from("missing-user")),
        ]);
        let err = posts.insert(orphan).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn set_null_cascade_wins_over_stale_doc_json() {
        let (driver, plugins, cache) = harness();
        let users = users(&driver);
        let posts = Collection::create(
            Arc::clone(&driver) as Arc<dyn Driver>,
            Arc::new(posts_schema(FkAction::SetNull)),
            plugins,
            cache,
        )
        .unwrap();

        let mut author = alice();
        author.set_path(ID_KEY, DocValue::from("author-1"));
        users.insert(author).unwrap();
        let post = posts
            .insert(DocValue::object([
                ("title", DocValue::from("kept")),
                ("author_id", DocValue::from("author-1")),
            ]))
            .unwrap();

        assert!(users.delete("author-1").unwrap());

        // The column was nulled by the cascade; the JSON still says
        // "author-1", and the column must win on read.
        let reread = posts.find_by_id(post.doc_id().unwrap()).unwrap().unwrap();
        assert_eq!(reread.get("author_id"), Some(&DocValue::Null));
    }
}
