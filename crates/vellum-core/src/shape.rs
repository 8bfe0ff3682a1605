//! Shape descriptors and document validation.
//!
//! A [`Shape`] declares the fields a document may carry; validation is a
//! recursive walk over the [`DocValue`](crate::value::DocValue) tree. Every
//! shape implicitly admits the reserved `_id` (string) and `_version`
//! (positive integer) fields at the top level.

use std::collections::BTreeMap;

use crate::value::{DocValue, ID_KEY, VERSION_KEY};

/// Error type for validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("document must be an object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("field '{path}' expected {expected}, got {actual}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("field '{0}' is not a valid UUID")]
    InvalidUuid(String),

    #[error("field '{0}' is not a valid email address")]
    InvalidEmail(String),

    #[error("reserved field '{field}' must be a {expected}")]
    InvalidReserved {
        field: &'static str,
        expected: &'static str,
    },

    #[error("'_version' must be a positive integer (got {0})")]
    InvalidVersion(i64),
}

/// Declarative type descriptor for one document field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    /// Accepts integers and floats.
    Number,
    Bool,
    Date,
    /// A string holding a canonical UUID.
    Uuid,
    /// A string holding a structurally plausible email address.
    Email,
    /// The wrapped type, or absent, or null.
    Optional(Box<FieldType>),
    /// A homogeneous array of the wrapped type.
    Array(Box<FieldType>),
    /// A nested object validated against its own shape.
    Object(Shape),
    /// Accepts any value. Fields of this type skip type checking entirely.
    Any,
}

impl FieldType {
    /// Short name used in error messages.
    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "boolean",
            Self::Date => "date",
            Self::Uuid => "uuid",
            Self::Email => "email",
            Self::Optional(_) => "optional",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Any => "any",
        }
    }
}

/// A declarative description of a document: field name to type descriptor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Shape {
    fields: BTreeMap<String, FieldType>,
    /// Permissive shapes accept any object and skip field-path checks.
    permissive: bool,
}

impl Shape {
    /// An empty shape. Add fields with [`Shape::field`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A catch-all shape that accepts any object. Collections built on a
    /// permissive shape skip field-path validation in the query builder.
    pub fn permissive() -> Self {
        Self {
            fields: BTreeMap::new(),
            permissive: true,
        }
    }

    /// Adds a field, builder-style.
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(name.into(), ty);
        self
    }

    pub fn is_permissive(&self) -> bool {
        self.permissive
    }

    /// The descriptor for a top-level field, if declared.
    pub fn get(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name)
    }

    /// Whether a top-level field name is addressable: declared in the shape
    /// or one of the reserved fields.
    pub fn has_field(&self, name: &str) -> bool {
        self.permissive
            || name == ID_KEY
            || name == VERSION_KEY
            || self.fields.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldType)> {
        self.fields.iter()
    }

    /// The descriptor at a dotted path, walking nested object shapes and
    /// unwrapping optionals. `None` when any segment is undeclared.
    pub fn descriptor_at(&self, path: &str) -> Option<&FieldType> {
        let mut shape = self;
        let mut segments = path.split('.').peekable();
        loop {
            let segment = segments.next()?;
            let mut ty = shape.get(segment)?;
            while let FieldType::Optional(inner) = ty {
                ty = inner;
            }
            if segments.peek().is_none() {
                return Some(ty);
            }
            match ty {
                FieldType::Object(inner) => shape = inner,
                _ => return None,
            }
        }
    }

    /// Validates a document against this shape.
    ///
    /// The reserved fields `_id` and `_version` are accepted (and checked for
    /// their fixed types) whether or not they are present. Unknown fields are
    /// rejected; every declared non-optional field must be present.
    pub fn validate(&self, doc: &DocValue) -> Result<(), ShapeError> {
        let map = doc.as_object().ok_or(ShapeError::NotAnObject)?;

        // Reserved fields have fixed types regardless of the shape.
        if let Some(id) = map.get(ID_KEY) {
            if id.as_str().is_none() {
                return Err(ShapeError::InvalidReserved {
                    field: ID_KEY,
                    expected: "string",
                });
            }
        }
        if let Some(version) = map.get(VERSION_KEY) {
            match version.as_i64() {
                Some(v) if v >= 1 => {}
                Some(v) => return Err(ShapeError::InvalidVersion(v)),
                None => {
                    return Err(ShapeError::InvalidReserved {
                        field: VERSION_KEY,
                        expected: "positive integer",
                    });
                }
            }
        }

        if self.permissive {
            return Ok(());
        }

        for (name, value) in map {
            if name == ID_KEY || name == VERSION_KEY {
                continue;
            }
            let ty = self
                .fields
                .get(name)
                .ok_or_else(|| ShapeError::UnknownField(name.clone()))?;
            validate_field(name, ty, value)?;
        }

        for (name, ty) in &self.fields {
            if !map.contains_key(name) && !matches!(ty, FieldType::Optional(_) | FieldType::Any) {
                return Err(ShapeError::MissingField(name.clone()));
            }
        }

        Ok(())
    }
}

fn validate_field(path: &str, ty: &FieldType, value: &DocValue) -> Result<(), ShapeError> {
    let mismatch = |expected: &'static str| ShapeError::TypeMismatch {
        path: path.to_string(),
        expected,
        actual: actual_name(value),
    };

    match ty {
        FieldType::Any => Ok(()),
        FieldType::String => value.as_str().map(|_| ()).ok_or_else(|| mismatch("string")),
        FieldType::Number => match value {
            DocValue::Int(_) | DocValue::Float(_) => Ok(()),
            _ => Err(mismatch("number")),
        },
        FieldType::Bool => value.as_bool().map(|_| ()).ok_or_else(|| mismatch("boolean")),
        FieldType::Date => value.as_date().map(|_| ()).ok_or_else(|| mismatch("date")),
        FieldType::Uuid => {
            let s = value.as_str().ok_or_else(|| mismatch("uuid"))?;
            uuid::Uuid::parse_str(s)
                .map(|_| ())
                .map_err(|_| ShapeError::InvalidUuid(path.to_string()))
        }
        FieldType::Email => {
            let s = value.as_str().ok_or_else(|| mismatch("email"))?;
            if is_plausible_email(s) {
                Ok(())
            } else {
                Err(ShapeError::InvalidEmail(path.to_string()))
            }
        }
        FieldType::Optional(inner) => {
            if value.is_null() {
                Ok(())
            } else {
                validate_field(path, inner, value)
            }
        }
        FieldType::Array(inner) => {
            let items = value.as_array().ok_or_else(|| mismatch("array"))?;
            for (i, item) in items.iter().enumerate() {
                validate_field(&format!("{path}[{i}]"), inner, item)?;
            }
            Ok(())
        }
        FieldType::Object(shape) => {
            let map = value.as_object().ok_or_else(|| mismatch("object"))?;
            for (name, inner_value) in map {
                let inner_ty = shape
                    .get(name)
                    .ok_or_else(|| ShapeError::UnknownField(format!("{path}.{name}")))?;
                validate_field(&format!("{path}.{name}"), inner_ty, inner_value)?;
            }
            for (name, inner_ty) in shape.iter() {
                if !map.contains_key(name)
                    && !matches!(inner_ty, FieldType::Optional(_) | FieldType::Any)
                {
                    return Err(ShapeError::MissingField(format!("{path}.{name}")));
                }
            }
            Ok(())
        }
    }
}

fn actual_name(value: &DocValue) -> &'static str {
    match value {
        DocValue::Null => "null",
        DocValue::Bool(_) => "boolean",
        DocValue::Int(_) | DocValue::Float(_) => "number",
        DocValue::String(_) => "string",
        DocValue::Date(_) => "date",
        DocValue::Array(_) => "array",
        DocValue::Object(_) => "object",
    }
}

/// Structural email check: one `@`, non-empty local part, dotted domain.
fn is_plausible_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !s.contains(char::is_whitespace)
        && !domain.contains('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_shape() -> Shape {
        Shape::new()
            .field("name", FieldType::String)
            .field("age", FieldType::Number)
            .field("email", FieldType::Email)
            .field("nickname", FieldType::Optional(Box::new(FieldType::String)))
            .field(
                "address",
                FieldType::Object(Shape::new().field("city", FieldType::String)),
            )
    }

    fn valid_user() -> DocValue {
        DocValue::object([
            ("name", DocValue::from("Alice")),
            ("age", DocValue::from(30i64)),
            ("email", DocValue::from("alice@example.com")),
            (
                "address",
                DocValue::object([("city", DocValue::from("Berlin"))]),
            ),
        ])
    }

    #[test]
    fn valid_document_passes() {
        assert!(user_shape().validate(&valid_user()).is_ok());
    }

    #[test]
    fn missing_required_field_fails() {
        let mut doc = valid_user();
        doc.remove_path("email");
        assert!(matches!(
            user_shape().validate(&doc),
            Err(ShapeError::MissingField(f)) if f == "email"
        ));
    }

    #[test]
    fn missing_optional_field_passes() {
        // `nickname` is optional and absent in valid_user().
        assert!(user_shape().validate(&valid_user()).is_ok());
    }

    #[test]
    fn null_optional_field_passes() {
        let mut doc = valid_user();
        doc.set_path("nickname", DocValue::Null);
        assert!(user_shape().validate(&doc).is_ok());
    }

    #[test]
    fn unknown_field_fails() {
        let mut doc = valid_user();
        doc.set_path("extra", DocValue::from(1i64));
        assert!(matches!(
            user_shape().validate(&doc),
            Err(ShapeError::UnknownField(f)) if f == "extra"
        ));
    }

    #[test]
    fn type_mismatch_names_path() {
        let mut doc = valid_user();
        doc.set_path("age", DocValue::from("thirty"));
        match user_shape().validate(&doc) {
            Err(ShapeError::TypeMismatch { path, expected, actual }) => {
                assert_eq!(path, "age");
                assert_eq!(expected, "number");
                assert_eq!(actual, "string");
            }
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn nested_object_validated() {
        let mut doc = valid_user();
        doc.set_path("address.city", DocValue::from(5i64));
        assert!(matches!(
            user_shape().validate(&doc),
            Err(ShapeError::TypeMismatch { path, .. }) if path == "address.city"
        ));
    }

    #[test]
    fn invalid_email_fails() {
        let mut doc = valid_user();
        doc.set_path("email", DocValue::from("not-an-email"));
        assert!(matches!(
            user_shape().validate(&doc),
            Err(ShapeError::InvalidEmail(_))
        ));
    }

    #[test]
    fn uuid_field_checked() {
        let shape = Shape::new().field("ref", FieldType::Uuid);
        let ok = DocValue::object([(
            "ref",
            DocValue::from("6ba7b810-9dad-11d1-80b4-00c04fd430c8"),
        )]);
        assert!(shape.validate(&ok).is_ok());

        let bad = DocValue::object([("ref", DocValue::from("nope"))]);
        assert!(matches!(
            shape.validate(&bad),
            Err(ShapeError::InvalidUuid(_))
        ));
    }

    #[test]
    fn array_items_validated() {
        let shape = Shape::new().field("tags", FieldType::Array(Box::new(FieldType::String)));
        let ok = DocValue::object([(
            "tags",
            DocValue::from(vec![DocValue::from("a"), DocValue::from("b")]),
        )]);
        assert!(shape.validate(&ok).is_ok());

        let bad = DocValue::object([(
            "tags",
            DocValue::from(vec![DocValue::from("a"), DocValue::from(1i64)]),
        )]);
        assert!(matches!(
            shape.validate(&bad),
            Err(ShapeError::TypeMismatch { path, .. }) if path == "tags[1]"
        ));
    }

    #[test]
    fn reserved_fields_accepted_and_typed() {
        let shape = Shape::new().field("name", FieldType::String);
        let doc = DocValue::object([
            (ID_KEY, DocValue::from("u1")),
            (VERSION_KEY, DocValue::from(1i64)),
            ("name", DocValue::from("Alice")),
        ]);
        assert!(shape.validate(&doc).is_ok());

        let bad_version = DocValue::object([
            (VERSION_KEY, DocValue::from(0i64)),
            ("name", DocValue::from("Alice")),
        ]);
        assert!(matches!(
            shape.validate(&bad_version),
            Err(ShapeError::InvalidVersion(0))
        ));
    }

    #[test]
    fn descriptor_at_walks_nested_shapes() {
        let shape = user_shape();
        assert_eq!(shape.descriptor_at("name"), Some(&FieldType::String));
        assert_eq!(shape.descriptor_at("address.city"), Some(&FieldType::String));
        // Optionals unwrap.
        assert_eq!(shape.descriptor_at("nickname"), Some(&FieldType::String));
        assert_eq!(shape.descriptor_at("address.missing"), None);
        assert_eq!(shape.descriptor_at("name.city"), None);
    }

    #[test]
    fn permissive_shape_accepts_anything() {
        let doc = DocValue::object([
            ("whatever", DocValue::from(1i64)),
            ("nested", DocValue::object([("x", DocValue::Null)])),
        ]);
        assert!(Shape::permissive().validate(&doc).is_ok());
        assert!(Shape::permissive().has_field("anything"));
    }

    #[test]
    fn non_object_rejected() {
        assert!(matches!(
            user_shape().validate(&DocValue::from(1i64)),
            Err(ShapeError::NotAnObject)
        ));
    }
}
