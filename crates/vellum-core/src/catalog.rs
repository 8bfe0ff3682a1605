//! Constrained-field catalog: the mapping from document field paths to
//! native SQL columns.
//!
//! A constrained field is a JSON field stored additionally as a real column
//! so the backend can index it and enforce uniqueness, nullability, and
//! foreign keys. The mapping is deterministic: flat names pass through,
//! dotted paths are lowercased, dots become underscores, and a `cf_` prefix
//! keeps them clear of the reserved `_id`/`doc`/`_version` columns.

use std::collections::BTreeMap;

use crate::error::{Result, VellumError};
use crate::shape::Shape;
use crate::value::{ID_KEY, VERSION_KEY};

/// The JSON text column every collection table carries.
pub const DOC_COLUMN: &str = "doc";

/// SQL storage class for a constrained-field column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
    Blob,
}

impl SqlType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
        }
    }
}

/// Referential action for a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FkAction {
    /// SQLite's default: reject the parent delete.
    #[default]
    Restrict,
    Cascade,
    SetNull,
}

impl FkAction {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
        }
    }
}

/// A foreign key referencing another collection's `_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Target collection (table) name.
    pub collection: String,
    pub on_delete: FkAction,
}

/// Specification for one constrained field.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstrainedField {
    /// Dotted path of the field inside the document.
    pub path: String,
    pub sql_type: SqlType,
    pub unique: bool,
    pub nullable: bool,
    pub foreign_key: Option<ForeignKey>,
}

impl ConstrainedField {
    pub fn new(path: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            path: path.into(),
            sql_type,
            unique: false,
            nullable: false,
            foreign_key: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// References `collection(_id)`.
    pub fn references(mut self, collection: impl Into<String>, on_delete: FkAction) -> Self {
        self.foreign_key = Some(ForeignKey {
            collection: collection.into(),
            on_delete,
        });
        self
    }

    /// The native column this field is stored in.
    pub fn column(&self) -> String {
        column_for_path(&self.path)
    }

    /// The column definition fragment for `CREATE TABLE`.
    pub fn column_ddl(&self) -> String {
        let mut ddl = format!("{} {}", self.column(), self.sql_type.as_sql());
        if !self.nullable {
            ddl.push_str(" NOT NULL");
        }
        if self.unique {
            ddl.push_str(" UNIQUE");
        }
        if let Some(ref fk) = self.foreign_key {
            ddl.push_str(&format!(
                " REFERENCES {}({ID_KEY}) ON DELETE {}",
                fk.collection,
                fk.on_delete.as_sql()
            ));
        }
        ddl
    }
}

/// Maps a field path to its column name.
///
/// Flat names pass through unchanged; dotted paths are lowercased with dots
/// replaced by underscores and prefixed `cf_` so they can never collide with
/// the reserved columns.
pub fn column_for_path(path: &str) -> String {
    if path.contains('.') {
        format!("cf_{}", path.to_lowercase().replace('.', "_"))
    } else {
        path.to_string()
    }
}

/// A named collection: its shape plus the constrained-field catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSchema {
    pub name: String,
    pub shape: Shape,
    constrained: BTreeMap<String, ConstrainedField>,
}

impl CollectionSchema {
    /// Creates a schema, validating the collection name as a SQL identifier.
    pub fn new(name: impl Into<String>, shape: Shape) -> Result<Self> {
        let name = name.into();
        if !is_sql_identifier(&name) {
            return Err(VellumError::validation(format!(
                "collection name '{name}' is not a valid SQL identifier"
            )));
        }
        Ok(Self {
            name,
            shape,
            constrained: BTreeMap::new(),
        })
    }

    /// Adds a constrained field, builder-style.
    ///
    /// Flat paths must name a declared shape field (unless the shape is
    /// permissive) and may not shadow the reserved columns. Dotted paths are
    /// checked structurally.
    pub fn constrain(mut self, field: ConstrainedField) -> Result<Self> {
        let path = &field.path;
        if path.is_empty() || path.split('.').any(|seg| seg.is_empty()) {
            return Err(VellumError::validation(format!(
                "invalid constrained-field path '{path}'"
            )));
        }
        if matches!(path.as_str(), ID_KEY | VERSION_KEY | DOC_COLUMN) {
            return Err(VellumError::validation(format!(
                "constrained-field path '{path}' shadows a reserved column"
            )));
        }
        if !path.contains('.') && !self.shape.has_field(path) {
            return Err(VellumError::validation(format!(
                "constrained field '{path}' is not declared in the shape"
            )));
        }
        self.constrained.insert(path.clone(), field);
        Ok(self)
    }

    /// The constrained field registered for a path, if any.
    pub fn constrained_field(&self, path: &str) -> Option<&ConstrainedField> {
        self.constrained.get(path)
    }

    /// The native column for a path, when the path is constrained.
    pub fn column_for(&self, path: &str) -> Option<String> {
        self.constrained.get(path).map(ConstrainedField::column)
    }

    /// All constrained fields, in deterministic path order.
    pub fn constrained_fields(&self) -> impl Iterator<Item = &ConstrainedField> {
        self.constrained.values()
    }

    pub fn has_constrained_fields(&self) -> bool {
        !self.constrained.is_empty()
    }

    /// Recovers the field path for a bare column name, used when mapping
    /// backend constraint errors back to document fields.
    pub fn path_for_column(&self, column: &str) -> Option<&str> {
        self.constrained
            .values()
            .find(|f| f.column() == column)
            .map(|f| f.path.as_str())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*` -- the identifiers we ever interpolate into SQL.
pub fn is_sql_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::FieldType;
    use pretty_assertions::assert_eq;

    fn schema() -> CollectionSchema {
        let shape = Shape::new()
            .field("email", FieldType::Email)
            .field("org", FieldType::String);
        CollectionSchema::new("users", shape)
            .unwrap()
            .constrain(ConstrainedField::new("email", SqlType::Text).unique())
            .unwrap()
            .constrain(
                ConstrainedField::new("profile.settings.Theme", SqlType::Text).nullable(),
            )
            .unwrap()
    }

    #[test]
    fn flat_paths_pass_through() {
        assert_eq!(column_for_path("email"), "email");
    }

    #[test]
    fn dotted_paths_are_prefixed_and_flattened() {
        assert_eq!(
            column_for_path("profile.settings.Theme"),
            "cf_profile_settings_theme"
        );
    }

    #[test]
    fn column_ddl_fragments() {
        let s = schema();
        let email = s.constrained_field("email").unwrap();
        assert_eq!(email.column_ddl(), "email TEXT NOT NULL UNIQUE");

        let theme = s.constrained_field("profile.settings.Theme").unwrap();
        assert_eq!(theme.column_ddl(), "cf_profile_settings_theme TEXT");
    }

    #[test]
    fn foreign_key_ddl() {
        let f = ConstrainedField::new("owner_id", SqlType::Text)
            .references("users", FkAction::Cascade);
        assert_eq!(
            f.column_ddl(),
            "owner_id TEXT NOT NULL REFERENCES users(_id) ON DELETE CASCADE"
        );

        let f = ConstrainedField::new("org_id", SqlType::Text)
            .nullable()
            .references("orgs", FkAction::SetNull);
        assert_eq!(
            f.column_ddl(),
            "org_id TEXT REFERENCES orgs(_id) ON DELETE SET NULL"
        );
    }

    #[test]
    fn invalid_collection_name_rejected() {
        assert!(CollectionSchema::new("users; DROP TABLE x", Shape::new()).is_err());
        assert!(CollectionSchema::new("1users", Shape::new()).is_err());
        assert!(CollectionSchema::new("users", Shape::new()).is_ok());
    }

    #[test]
    fn reserved_paths_rejected() {
        let shape = Shape::permissive();
        let schema = CollectionSchema::new("t", shape).unwrap();
        assert!(
            schema
                .clone()
                .constrain(ConstrainedField::new("_id", SqlType::Text))
                .is_err()
        );
        assert!(
            schema
                .constrain(ConstrainedField::new("doc", SqlType::Text))
                .is_err()
        );
    }

    #[test]
    fn undeclared_flat_path_rejected() {
        let shape = Shape::new().field("name", FieldType::String);
        let schema = CollectionSchema::new("t", shape).unwrap();
        assert!(
            schema
                .constrain(ConstrainedField::new("missing", SqlType::Text))
                .is_err()
        );
    }

    #[test]
    fn path_recovered_from_column() {
        let s = schema();
        assert_eq!(s.path_for_column("email"), Some("email"));
        assert_eq!(
            s.path_for_column("cf_profile_settings_theme"),
            Some("profile.settings.Theme")
        );
        assert_eq!(s.path_for_column("nope"), None);
    }
}
