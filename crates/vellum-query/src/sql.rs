//! SQL translation: compiles a [`QueryPlan`] and document mutations into
//! parameterized SQLite statements.
//!
//! Identifiers (table and column names) come exclusively from the schema,
//! which validated them at construction time. Everything user-supplied flows
//! through parameters.

use vellum_core::catalog::{CollectionSchema, DOC_COLUMN};
use vellum_core::codec;
use vellum_core::value::{DocValue, ID_KEY, VERSION_KEY};

use crate::plan::{FilterLeaf, FilterNode, FilterOp, FilterValue, QueryPlan};

/// A SQL parameter or row value, independent of any driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Converts a document value to its SQL binding.
///
/// Booleans become 0/1 (matching `json_extract` output for JSON booleans),
/// dates become RFC 3339 text (which sorts chronologically), and composite
/// values are bound as their tagged JSON text.
pub fn bind_value(value: &DocValue) -> SqlValue {
    match value {
        DocValue::Null => SqlValue::Null,
        DocValue::Bool(b) => SqlValue::Int(i64::from(*b)),
        DocValue::Int(n) => SqlValue::Int(*n),
        DocValue::Float(n) => SqlValue::Real(*n),
        DocValue::String(s) => SqlValue::Text(s.clone()),
        DocValue::Date(d) => SqlValue::Text(codec::format_instant(d)),
        DocValue::Array(_) | DocValue::Object(_) => SqlValue::Text(
            serde_json::to_string(&codec::to_tagged_json(value))
                .unwrap_or_else(|_| "null".to_string()),
        ),
    }
}

/// The SQL expression addressing a field path: the native constrained-field
/// column when one exists, else a `json_extract` on the document column.
fn target_expr(schema: &CollectionSchema, path: &str) -> String {
    match path {
        ID_KEY | VERSION_KEY => path.to_string(),
        _ => match schema.column_for(path) {
            Some(column) => column,
            None => format!("json_extract({DOC_COLUMN}, '$.{path}')"),
        },
    }
}

/// Escapes `%`, `_`, and the escape character itself for a `LIKE` pattern.
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ---------------------------------------------------------------------------
// WHERE clause
// ---------------------------------------------------------------------------

/// Accumulates SQL text and parameters with running `?N` placeholders.
struct SqlWriter {
    params: Vec<SqlValue>,
}

impl SqlWriter {
    fn new() -> Self {
        Self { params: Vec::new() }
    }

    /// Registers a parameter, returning its `?N` placeholder.
    fn bind(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    fn leaf_sql(&mut self, schema: &CollectionSchema, leaf: &FilterLeaf) -> String {
        let expr = target_expr(schema, &leaf.path);
        match (&leaf.op, &leaf.value) {
            (FilterOp::Eq, FilterValue::One(v)) => {
                format!("{expr} = {}", self.bind(bind_value(v)))
            }
            (FilterOp::Ne, FilterValue::One(v)) => {
                format!("{expr} != {}", self.bind(bind_value(v)))
            }
            (FilterOp::Gt, FilterValue::One(v)) => {
                format!("{expr} > {}", self.bind(bind_value(v)))
            }
            (FilterOp::Gte, FilterValue::One(v)) => {
                format!("{expr} >= {}", self.bind(bind_value(v)))
            }
            (FilterOp::Lt, FilterValue::One(v)) => {
                format!("{expr} < {}", self.bind(bind_value(v)))
            }
            (FilterOp::Lte, FilterValue::One(v)) => {
                format!("{expr} <= {}", self.bind(bind_value(v)))
            }
            (FilterOp::In, FilterValue::Many(values)) => {
                if values.is_empty() {
                    // IN () is a syntax error; an empty list matches nothing.
                    return "1 = 0".to_string();
                }
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|v| self.bind(bind_value(v)))
                    .collect();
                format!("{expr} IN ({})", placeholders.join(", "))
            }
            (FilterOp::Nin, FilterValue::Many(values)) => {
                if values.is_empty() {
                    return "1 = 1".to_string();
                }
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|v| self.bind(bind_value(v)))
                    .collect();
                format!("{expr} NOT IN ({})", placeholders.join(", "))
            }
            (FilterOp::Contains, FilterValue::One(v)) => {
                let pattern = format!("%{}%", escape_like(string_operand(v)));
                format!("{expr} LIKE {} ESCAPE '\\'", self.bind(SqlValue::Text(pattern)))
            }
            (FilterOp::StartsWith, FilterValue::One(v)) => {
                let pattern = format!("{}%", escape_like(string_operand(v)));
                format!("{expr} LIKE {} ESCAPE '\\'", self.bind(SqlValue::Text(pattern)))
            }
            (FilterOp::EndsWith, FilterValue::One(v)) => {
                let pattern = format!("%{}", escape_like(string_operand(v)));
                format!("{expr} LIKE {} ESCAPE '\\'", self.bind(SqlValue::Text(pattern)))
            }
            (FilterOp::Like, FilterValue::One(v)) => {
                let pattern = string_operand(v).to_string();
                format!("{expr} LIKE {}", self.bind(SqlValue::Text(pattern)))
            }
            (FilterOp::IsNull, _) => format!("{expr} IS NULL"),
            (FilterOp::NotNull, _) => format!("{expr} IS NOT NULL"),
            (FilterOp::Between, FilterValue::Range(lo, hi)) => {
                let lo = self.bind(bind_value(lo));
                let hi = self.bind(bind_value(hi));
                format!("{expr} BETWEEN {lo} AND {hi}")
            }
            // The builder constructs leaves with matching operands; anything
            // else cannot match a row.
            _ => "1 = 0".to_string(),
        }
    }

    fn where_sql(&mut self, schema: &CollectionSchema, plan: &QueryPlan) -> Option<String> {
        if plan.filters.is_empty() {
            return None;
        }
        let clauses: Vec<String> = plan
            .filters
            .nodes
            .iter()
            .map(|node| match node {
                FilterNode::Leaf(leaf) => self.leaf_sql(schema, leaf),
                FilterNode::OrGroup(branches) => {
                    let parts: Vec<String> = branches
                        .iter()
                        .map(|branch| {
                            let ands: Vec<String> = branch
                                .iter()
                                .map(|leaf| self.leaf_sql(schema, leaf))
                                .collect();
                            if ands.len() == 1 {
                                ands.into_iter().next().expect("len checked")
                            } else {
                                format!("({})", ands.join(" AND "))
                            }
                        })
                        .collect();
                    format!("({})", parts.join(" OR "))
                }
            })
            .collect();
        Some(clauses.join(" AND "))
    }
}

fn string_operand(v: &DocValue) -> &str {
    v.as_str().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// SELECT
// ---------------------------------------------------------------------------

/// Compiles a plan into a `SELECT` statement.
pub fn build_select(schema: &CollectionSchema, plan: &QueryPlan) -> (String, Vec<SqlValue>) {
    let mut writer = SqlWriter::new();

    let columns = if plan.projection.is_empty() {
        full_document_columns(schema)
    } else {
        // `_id` is always selected so results keep their identity.
        let mut cols = vec![ID_KEY.to_string()];
        for path in &plan.projection {
            match path.as_str() {
                ID_KEY => {}
                VERSION_KEY => cols.push(VERSION_KEY.to_string()),
                _ => {
                    cols.push(format!("json_extract({DOC_COLUMN}, '$.{path}') AS \"{path}\""));
                    // The native column wins over the JSON extraction during
                    // post-processing.
                    if let Some(column) = schema.column_for(path) {
                        cols.push(column);
                    }
                }
            }
        }
        cols.join(", ")
    };

    let distinct = if plan.distinct { "DISTINCT " } else { "" };
    let mut sql = format!("SELECT {distinct}{columns} FROM {}", schema.name);

    if let Some(where_sql) = writer.where_sql(schema, plan) {
        sql.push_str(" WHERE ");
        sql.push_str(&where_sql);
    }

    if !plan.ordering.is_empty() {
        let order: Vec<String> = plan
            .ordering
            .iter()
            .map(|(path, dir)| format!("{} {}", target_expr(schema, path), dir.as_sql()))
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }

    match (plan.limit, plan.offset) {
        (Some(limit), Some(offset)) => {
            let l = writer.bind(SqlValue::Int(limit as i64));
            let o = writer.bind(SqlValue::Int(offset as i64));
            sql.push_str(&format!(" LIMIT {l} OFFSET {o}"));
        }
        (Some(limit), None) => {
            let l = writer.bind(SqlValue::Int(limit as i64));
            sql.push_str(&format!(" LIMIT {l}"));
        }
        (None, Some(offset)) => {
            // SQLite requires a LIMIT before OFFSET; -1 means unbounded.
            let o = writer.bind(SqlValue::Int(offset as i64));
            sql.push_str(&format!(" LIMIT -1 OFFSET {o}"));
        }
        (None, None) => {}
    }

    (sql, writer.params)
}

/// Compiles a plan into a `SELECT COUNT(*)`, applying filters only.
pub fn build_count(schema: &CollectionSchema, plan: &QueryPlan) -> (String, Vec<SqlValue>) {
    let mut writer = SqlWriter::new();
    let mut sql = format!("SELECT COUNT(*) AS n FROM {}", schema.name);
    if let Some(where_sql) = writer.where_sql(schema, plan) {
        sql.push_str(" WHERE ");
        sql.push_str(&where_sql);
    }
    (sql, writer.params)
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// The constrained-field bindings extracted from a document, in catalog order.
fn constrained_bindings(schema: &CollectionSchema, doc: &DocValue) -> Vec<(String, SqlValue)> {
    schema
        .constrained_fields()
        .map(|field| {
            let value = doc
                .get_path(&field.path)
                .map(bind_value)
                .unwrap_or(SqlValue::Null);
            (field.column(), value)
        })
        .collect()
}

/// `INSERT` of a fresh row. `doc_text` is the encoded document; the version
/// is always 1 here.
pub fn build_insert(
    schema: &CollectionSchema,
    id: &str,
    doc_text: &str,
    doc: &DocValue,
) -> (String, Vec<SqlValue>) {
    let mut columns = vec![ID_KEY.to_string(), DOC_COLUMN.to_string(), VERSION_KEY.to_string()];
    let mut params = vec![
        SqlValue::Text(id.to_string()),
        SqlValue::Text(doc_text.to_string()),
        SqlValue::Int(1),
    ];
    for (column, value) in constrained_bindings(schema, doc) {
        columns.push(column);
        params.push(value);
    }
    let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        schema.name,
        columns.join(", "),
        placeholders.join(", ")
    );
    (sql, params)
}

/// `UPDATE` of an existing row, bumping `_version` to `new_version`.
///
/// When `guard_version` is set the statement only matches a row still at
/// that version; zero affected rows then signals an optimistic-concurrency
/// conflict (or a missing row).
pub fn build_update(
    schema: &CollectionSchema,
    id: &str,
    doc_text: &str,
    doc: &DocValue,
    new_version: i64,
    guard_version: Option<i64>,
) -> (String, Vec<SqlValue>) {
    let mut sets = vec![format!("{DOC_COLUMN} = ?1"), format!("{VERSION_KEY} = ?2")];
    let mut params = vec![
        SqlValue::Text(doc_text.to_string()),
        SqlValue::Int(new_version),
    ];
    for (column, value) in constrained_bindings(schema, doc) {
        params.push(value);
        sets.push(format!("{column} = ?{}", params.len()));
    }

    params.push(SqlValue::Text(id.to_string()));
    let mut sql = format!(
        "UPDATE {} SET {} WHERE {ID_KEY} = ?{}",
        schema.name,
        sets.join(", "),
        params.len()
    );
    if let Some(expected) = guard_version {
        params.push(SqlValue::Int(expected));
        sql.push_str(&format!(" AND {VERSION_KEY} = ?{}", params.len()));
    }
    (sql, params)
}

/// `DELETE` by `_id`.
pub fn build_delete(schema: &CollectionSchema, id: &str) -> (String, Vec<SqlValue>) {
    (
        format!("DELETE FROM {} WHERE {ID_KEY} = ?1", schema.name),
        vec![SqlValue::Text(id.to_string())],
    )
}

/// Upsert. Without constrained fields a plain `INSERT OR REPLACE` suffices
/// (`version` is computed by the caller). With constrained fields the
/// conflict clause refreshes the native columns and bumps the stored
/// version in place.
pub fn build_upsert(
    schema: &CollectionSchema,
    id: &str,
    doc_text: &str,
    doc: &DocValue,
    version: i64,
) -> (String, Vec<SqlValue>) {
    if !schema.has_constrained_fields() {
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({ID_KEY}, {DOC_COLUMN}, {VERSION_KEY}) VALUES (?1, ?2, ?3)",
            schema.name
        );
        let params = vec![
            SqlValue::Text(id.to_string()),
            SqlValue::Text(doc_text.to_string()),
            SqlValue::Int(version),
        ];
        return (sql, params);
    }

    let mut columns = vec![ID_KEY.to_string(), DOC_COLUMN.to_string(), VERSION_KEY.to_string()];
    let mut params = vec![
        SqlValue::Text(id.to_string()),
        SqlValue::Text(doc_text.to_string()),
        SqlValue::Int(1),
    ];
    let mut conflict_sets = vec![
        format!("{DOC_COLUMN} = excluded.{DOC_COLUMN}"),
        format!("{VERSION_KEY} = {VERSION_KEY} + 1"),
    ];
    for (column, value) in constrained_bindings(schema, doc) {
        conflict_sets.push(format!("{column} = excluded.{column}"));
        columns.push(column);
        params.push(value);
    }
    let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({ID_KEY}) DO UPDATE SET {}",
        schema.name,
        columns.join(", "),
        placeholders.join(", "),
        conflict_sets.join(", ")
    );
    (sql, params)
}

/// `SELECT` of a single row by `_id`.
pub fn build_find_by_id(schema: &CollectionSchema, id: &str) -> (String, Vec<SqlValue>) {
    (
        format!(
            "SELECT {} FROM {} WHERE {ID_KEY} = ?1",
            full_document_columns(schema),
            schema.name
        ),
        vec![SqlValue::Text(id.to_string())],
    )
}

/// The columns of a full-document read: the three mandatory columns plus
/// every constrained-field column, whose value wins over the JSON copy
/// during reconstruction (this is what makes `SET NULL` cascades visible).
fn full_document_columns(schema: &CollectionSchema) -> String {
    let mut cols = format!("{ID_KEY}, {DOC_COLUMN}, {VERSION_KEY}");
    for field in schema.constrained_fields() {
        cols.push_str(", ");
        cols.push_str(&field.column());
    }
    cols
}
