//! Document codec: JSON text with date tagging, plus the content-addressed
//! parse cache.
//!
//! Dates are encoded as `{"__type":"Date","value":"<RFC 3339>"}` so they
//! survive the TEXT column round trip exactly. Decoding is a reviving walk
//! that restores tagged dates to native instants.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use lru::LruCache;
use serde_json::{Map, Value};

use crate::error::{Result, VellumError};
use crate::value::DocValue;

/// Tag key marking an encoded date object.
const DATE_TAG_KEY: &str = "__type";

/// Tag value marking an encoded date object.
const DATE_TAG: &str = "Date";

/// Capacity of the parse cache.
pub const PARSE_CACHE_CAPACITY: usize = 1000;

// ---------------------------------------------------------------------------
// Encoding / decoding
// ---------------------------------------------------------------------------

/// Encodes a document as JSON text with tagged dates.
pub fn encode(doc: &DocValue) -> Result<String> {
    Ok(serde_json::to_string(&to_tagged_json(doc))?)
}

/// Decodes JSON text produced by [`encode`], restoring tagged dates.
pub fn decode(text: &str) -> Result<DocValue> {
    let value: Value = serde_json::from_str(text)?;
    from_tagged_json(&value)
}

/// Converts a document to the tagged `serde_json` form.
pub fn to_tagged_json(doc: &DocValue) -> Value {
    match doc {
        DocValue::Null => Value::Null,
        DocValue::Bool(b) => Value::Bool(*b),
        DocValue::Int(n) => Value::from(*n),
        DocValue::Float(n) => {
            // JSON has no NaN/Infinity; they encode as null.
            serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number)
        }
        DocValue::String(s) => Value::String(s.clone()),
        DocValue::Date(d) => {
            let mut map = Map::with_capacity(2);
            map.insert(DATE_TAG_KEY.into(), Value::String(DATE_TAG.into()));
            map.insert("value".into(), Value::String(format_instant(d)));
            Value::Object(map)
        }
        DocValue::Array(items) => Value::Array(items.iter().map(to_tagged_json).collect()),
        DocValue::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), to_tagged_json(v)))
                .collect(),
        ),
    }
}

/// Converts tagged `serde_json` back to a document, reviving dates.
pub fn from_tagged_json(value: &Value) -> Result<DocValue> {
    Ok(match value {
        Value::Null => DocValue::Null,
        Value::Bool(b) => DocValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                DocValue::Int(i)
            } else {
                // u64 beyond i64 range and fractional numbers land here.
                DocValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => DocValue::String(s.clone()),
        Value::Array(items) => DocValue::Array(
            items
                .iter()
                .map(from_tagged_json)
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Object(map) => {
            if let Some(instant) = tagged_date(map) {
                DocValue::Date(instant?)
            } else {
                DocValue::Object(
                    map.iter()
                        .map(|(k, v)| Ok((k.clone(), from_tagged_json(v)?)))
                        .collect::<Result<_>>()?,
                )
            }
        }
    })
}

/// Recognizes the `{"__type":"Date","value":…}` wrapper.
fn tagged_date(map: &Map<String, Value>) -> Option<Result<DateTime<Utc>>> {
    if map.get(DATE_TAG_KEY).and_then(Value::as_str) != Some(DATE_TAG) {
        return None;
    }
    let raw = map.get("value").and_then(Value::as_str)?;
    Some(
        DateTime::parse_from_rfc3339(raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| VellumError::validation(format!("invalid date '{raw}': {e}"))),
    )
}

/// Millisecond-precision RFC 3339, matching the precision documents carry.
pub fn format_instant(d: &DateTime<Utc>) -> String {
    d.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Content hashing
// ---------------------------------------------------------------------------

/// 32-bit FNV-1a over the source text; the parse-cache key.
pub fn fnv1a32(text: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in text.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

// ---------------------------------------------------------------------------
// Parse cache
// ---------------------------------------------------------------------------

/// Content-addressed LRU cache of parsed documents.
///
/// Keyed by [`fnv1a32`] of the source text. Hits return a clone, so callers
/// can never mutate cached state. Parsing dominates read-heavy workloads;
/// identical JSON text decodes to identical values, which is what makes
/// content addressing sound.
pub struct DocumentCache {
    inner: Mutex<LruCache<u32, DocValue>>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::with_capacity(PARSE_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the parsed form of `text`, decoding on miss.
    pub fn get_or_parse(&self, text: &str) -> Result<DocValue> {
        let key = fnv1a32(text);
        // A poisoned lock only means a panic elsewhere mid-access; the cache
        // holds immutable parse results, so recover and continue.
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = cache.get(&key) {
            return Ok(hit.clone());
        }
        let parsed = decode(text)?;
        cache.put(key, parsed.clone());
        Ok(parsed)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DocumentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DocumentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentCache").finish_non_exhaustive()
    }
}
