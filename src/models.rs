//! Data models for deduplicated events.
//!
//! A dedup key is an ordered tuple of scalar fields; the bucket key is the
//! time slot an event falls into.

use std::fmt;
use std::sync::Arc;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DedupError;

/// Identifier of a time slot: `timestamp_ms / span_ms`.
pub type BucketKey = u64;

/// One scalar component of a dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyField {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl fmt::Display for KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for KeyField {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for KeyField {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for KeyField {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

/// Identity of logically identical events.
///
/// Never empty; persisted as a JSON array of scalars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(Vec<KeyField>);

impl DedupKey {
    /// Build a key from its fields.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::MalformedKey`] if `fields` is empty.
    pub fn new(fields: Vec<KeyField>) -> Result<Self, DedupError> {
        if fields.is_empty() {
            return Err(DedupError::MalformedKey("dedup key has no fields".into()));
        }
        Ok(Self(fields))
    }

    /// Key made of a single field.
    #[must_use]
    pub fn single(field: impl Into<KeyField>) -> Self {
        Self(vec![field.into()])
    }

    /// Key fields in order.
    #[must_use]
    pub fn fields(&self) -> &[KeyField] {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}

/// An event the deduplicator can classify.
pub trait DedupEvent {
    /// Fields identifying logically identical events.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::MalformedKey`] when the event has no usable key.
    fn dedup_key(&self) -> Result<DedupKey, DedupError>;

    /// Event time in milliseconds since the Unix epoch.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::MalformedKey`] when the event has no usable timestamp.
    fn timestamp_ms(&self) -> Result<i64, DedupError>;
}

/// Where to find the key and time fields inside a JSON event.
///
/// Paths are dotted (`meta.source`) to reach nested objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    key_fields: Vec<String>,
    time_field: String,
}

impl KeySpec {
    /// Create a key spec.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::Config`] if no key field is given.
    pub fn new(key_fields: Vec<String>, time_field: impl Into<String>) -> Result<Self, DedupError> {
        if key_fields.is_empty() {
            return Err(DedupError::Config("at least one key field is required".into()));
        }
        Ok(Self {
            key_fields,
            time_field: time_field.into(),
        })
    }

    /// Extract the dedup key of a JSON event.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::MalformedKey`] if a key field is missing or not a scalar.
    pub fn key_of(&self, value: &Value) -> Result<DedupKey, DedupError> {
        let fields = self
            .key_fields
            .iter()
            .map(|path| key_field_at(value, path))
            .collect::<Result<Vec<_>, _>>()?;
        DedupKey::new(fields)
    }

    /// Extract the event time of a JSON event.
    ///
    /// Accepts integer epoch milliseconds or an RFC 3339 string.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::MalformedKey`] if the time field is missing or unparsable.
    pub fn timestamp_of(&self, value: &Value) -> Result<i64, DedupError> {
        let path = &self.time_field;
        match lookup(value, path) {
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                DedupError::MalformedKey(format!("time field '{path}' is not an integer"))
            }),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.timestamp_millis())
                .map_err(|e| {
                    DedupError::MalformedKey(format!("time field '{path}' is not RFC 3339: {e}"))
                }),
            Some(_) => Err(DedupError::MalformedKey(format!(
                "time field '{path}' must be a number or string"
            ))),
            None => Err(DedupError::MalformedKey(format!(
                "missing time field '{path}'"
            ))),
        }
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, segment| v.get(segment))
}

fn key_field_at(value: &Value, path: &str) -> Result<KeyField, DedupError> {
    match lookup(value, path) {
        Some(Value::Bool(b)) => Ok(KeyField::Bool(*b)),
        Some(Value::Number(n)) => n.as_i64().map(KeyField::Int).ok_or_else(|| {
            DedupError::MalformedKey(format!("key field '{path}' is not an integer"))
        }),
        Some(Value::String(s)) => Ok(KeyField::Text(s.clone())),
        Some(Value::Null) | None => Err(DedupError::MalformedKey(format!(
            "missing key field '{path}'"
        ))),
        Some(_) => Err(DedupError::MalformedKey(format!(
            "key field '{path}' is not a scalar"
        ))),
    }
}

/// A JSON event paired with the [`KeySpec`] that locates its key and time.
#[derive(Debug, Clone)]
pub struct JsonEvent {
    value: Value,
    spec: Arc<KeySpec>,
}

impl JsonEvent {
    #[must_use]
    pub fn new(value: Value, spec: Arc<KeySpec>) -> Self {
        Self { value, spec }
    }

    /// Raw event payload.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }
}

impl DedupEvent for JsonEvent {
    fn dedup_key(&self) -> Result<DedupKey, DedupError> {
        self.spec.key_of(&self.value)
    }

    fn timestamp_ms(&self) -> Result<i64, DedupError> {
        self.spec.timestamp_of(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(fields: &[&str]) -> Arc<KeySpec> {
        let fields = fields.iter().map(|f| (*f).to_string()).collect();
        Arc::new(KeySpec::new(fields, "ts").unwrap())
    }

    #[test]
    fn test_composite_key_extraction() {
        let event = JsonEvent::new(
            json!({"id": "abc", "meta": {"shard": 3}, "ts": 1500}),
            spec(&["id", "meta.shard"]),
        );

        let key = event.dedup_key().unwrap();
        assert_eq!(key.fields(), &[KeyField::from("abc"), KeyField::Int(3)]);
        assert_eq!(key.to_string(), "abc|3");
        assert_eq!(event.timestamp_ms().unwrap(), 1500);
    }

    #[test]
    fn test_rfc3339_timestamp() {
        let event = JsonEvent::new(
            json!({"id": 1, "ts": "1970-01-01T00:00:02.500Z"}),
            spec(&["id"]),
        );
        assert_eq!(event.timestamp_ms().unwrap(), 2500);
    }

    #[test]
    fn test_missing_key_is_malformed() {
        let event = JsonEvent::new(json!({"ts": 10}), spec(&["id"]));
        assert!(matches!(
            event.dedup_key(),
            Err(DedupError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_non_scalar_key_is_malformed() {
        let event = JsonEvent::new(json!({"id": [1, 2], "ts": 10}), spec(&["id"]));
        assert!(matches!(
            event.dedup_key(),
            Err(DedupError::MalformedKey(_))
        ));

        let event = JsonEvent::new(json!({"id": 1.5, "ts": 10}), spec(&["id"]));
        assert!(event.dedup_key().is_err());
    }

    #[test]
    fn test_missing_timestamp_is_malformed() {
        let event = JsonEvent::new(json!({"id": "x"}), spec(&["id"]));
        assert!(matches!(
            event.timestamp_ms(),
            Err(DedupError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(DedupKey::new(Vec::new()).is_err());
        assert!(KeySpec::new(Vec::new(), "ts").is_err());
    }

    #[test]
    fn test_key_serializes_as_array() {
        let key = DedupKey::new(vec![KeyField::from("a"), KeyField::Int(7), KeyField::Bool(true)])
            .unwrap();
        let encoded = serde_json::to_string(&key).unwrap();
        assert_eq!(encoded, r#"["a",7,true]"#);
        let decoded: DedupKey = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, key);
    }
}
