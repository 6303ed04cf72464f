//! Opaque server records.
//!
//! The engine interprets a single field of a record, its `id`. Everything else
//! is carried verbatim and compared structurally.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::errors::SyncError;

/// Prefix of ids minted locally for provisional records.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// A server-owned entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(deserialize_with = "id_from_string_or_number")]
    id: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Record {
    /// Build a record from an id and an opaque field map.
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        let mut fields = fields;
        fields.remove("id");
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Provisional record for an intended mutation payload.
    ///
    /// Non-object payloads are kept under a `body` field.
    pub fn provisional(temp_id: &str, payload: &Value) -> Self {
        let fields = match payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("body".to_string(), other.clone());
                map
            }
        };
        Self::new(temp_id, fields)
    }

    /// Record id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Opaque fields, `id` excluded.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Single field lookup.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Minted locally and not yet confirmed by the server.
    pub fn is_provisional(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    /// Decode one record from a response body.
    ///
    /// Accepts the record itself or a `{"data": {...}}` wrapper. `null` and
    /// objects without an `id` yield `None`.
    pub fn from_response(body: Value) -> Result<Option<Record>, SyncError> {
        let body = unwrap_data(body);
        match body {
            Value::Null => Ok(None),
            Value::Object(ref map) if !map.contains_key("id") => Ok(None),
            Value::Object(_) => serde_json::from_value(body)
                .map(Some)
                .map_err(|e| SyncError::InvalidResponse(format!("record: {}", e))),
            other => Err(SyncError::InvalidResponse(format!(
                "expected a record object, got {}",
                kind_of(&other)
            ))),
        }
    }
}

/// Decode a record list from a response body.
///
/// Accepts a bare array or a `{"data": [...]}` wrapper; `null` is the empty list.
pub fn decode_records(body: Value) -> Result<Vec<Record>, SyncError> {
    match unwrap_data(body) {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item)
                    .map_err(|e| SyncError::InvalidResponse(format!("record list: {}", e)))
            })
            .collect(),
        other => Err(SyncError::InvalidResponse(format!(
            "expected a record list, got {}",
            kind_of(&other)
        ))),
    }
}

fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "record id must be a string or number, got {}",
            kind_of(&other)
        ))),
    }
}
