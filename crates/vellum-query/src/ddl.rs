//! Schema-DDL generation: `CREATE TABLE` and index statements for a
//! collection.
//!
//! Creation is idempotent (`IF NOT EXISTS` throughout); existing tables are
//! never altered.

use vellum_core::catalog::{CollectionSchema, DOC_COLUMN};
use vellum_core::value::{ID_KEY, VERSION_KEY};

/// The `CREATE TABLE IF NOT EXISTS` statement for a collection.
///
/// Every table carries the three mandatory columns, then one column per
/// constrained field with its declared type, nullability, inline uniqueness,
/// and foreign-key clause.
pub fn create_table(schema: &CollectionSchema) -> String {
    let mut columns = vec![
        format!("{ID_KEY} TEXT PRIMARY KEY"),
        format!("{DOC_COLUMN} TEXT NOT NULL"),
        format!("{VERSION_KEY} INTEGER NOT NULL DEFAULT 1"),
    ];
    for field in schema.constrained_fields() {
        columns.push(field.column_ddl());
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        schema.name,
        columns.join(", ")
    )
}

/// Additional index statements: one non-unique index per constrained field
/// that is not already covered by an inline `UNIQUE` constraint.
pub fn index_statements(schema: &CollectionSchema) -> Vec<String> {
    schema
        .constrained_fields()
        .filter(|field| !field.unique)
        .map(|field| {
            let column = field.column();
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_{column} ON {}({column})",
                schema.name, schema.name
            )
        })
        .collect()
}

/// The full ordered statement list for collection setup.
pub fn all_statements(schema: &CollectionSchema) -> Vec<String> {
    let mut statements = vec![create_table(schema)];
    statements.extend(index_statements(schema));
    statements
}
