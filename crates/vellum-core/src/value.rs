//! [`DocValue`] -- the in-memory form of a document.
//!
//! A `DocValue` is a JSON-like tree with one extension: dates are first-class
//! instants rather than strings, so they survive a store/load round trip
//! without loss. Objects use `BTreeMap` so encoding is deterministic, which
//! the content-addressed parse cache relies on.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// The reserved primary-key field present on every stored document.
pub const ID_KEY: &str = "_id";

/// The reserved version field present on every stored document.
pub const VERSION_KEY: &str = "_version";

/// A document value.
#[derive(Debug, Clone, PartialEq)]
pub enum DocValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(DateTime<Utc>),
    Array(Vec<DocValue>),
    Object(BTreeMap<String, DocValue>),
}

impl DocValue {
    /// Builds an object from `(key, value)` pairs.
    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, DocValue)>) -> Self {
        Self::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    // -- Accessors -----------------------------------------------------------

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric value as `f64`; integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[DocValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, DocValue>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, DocValue>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Direct child lookup on an object.
    pub fn get(&self, key: &str) -> Option<&DocValue> {
        self.as_object().and_then(|map| map.get(key))
    }

    // -- Dotted-path navigation ----------------------------------------------

    /// Looks up a dotted path (`"profile.address.city"`).
    ///
    /// Returns `None` if any segment is missing or traverses a non-object.
    pub fn get_path(&self, path: &str) -> Option<&DocValue> {
        let mut current = self;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// Sets the value at a dotted path, creating intermediate objects.
    ///
    /// Intermediate non-object values are replaced by objects.
    pub fn set_path(&mut self, path: &str, value: DocValue) {
        let mut current = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            if !matches!(current, DocValue::Object(_)) {
                *current = DocValue::Object(BTreeMap::new());
            }
            let DocValue::Object(map) = current else {
                unreachable!("just ensured an object");
            };
            if segments.peek().is_none() {
                map.insert(segment.to_string(), value);
                return;
            }
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| DocValue::Object(BTreeMap::new()));
        }
    }

    /// Removes the value at a dotted path, returning it if present.
    pub fn remove_path(&mut self, path: &str) -> Option<DocValue> {
        match path.split_once('.') {
            None => self.as_object_mut()?.remove(path),
            Some((head, rest)) => self.as_object_mut()?.get_mut(head)?.remove_path(rest),
        }
    }

    // -- Document helpers ----------------------------------------------------

    /// The document's `_id`, when present and a string.
    pub fn doc_id(&self) -> Option<&str> {
        self.get(ID_KEY).and_then(DocValue::as_str)
    }

    /// The document's `_version`, when present and an integer.
    pub fn doc_version(&self) -> Option<i64> {
        self.get(VERSION_KEY).and_then(DocValue::as_i64)
    }
}

impl From<bool> for DocValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for DocValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for DocValue {
    fn from(n: i32) -> Self {
        Self::Int(n as i64)
    }
}

impl From<f64> for DocValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<&str> for DocValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for DocValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<DateTime<Utc>> for DocValue {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

impl From<Vec<DocValue>> for DocValue {
    fn from(items: Vec<DocValue>) -> Self {
        Self::Array(items)
    }
}
