//! Field values used in query filters and cursors.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// A value as the store models it.
///
/// Documents themselves carry plain JSON; `FieldValue` is what appears in
/// query descriptors, where references must stay distinguishable from
/// strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
	Null,
	Bool(bool),
	Number(Number),
	String(String),
	/// Reference to another document, by full path
	Reference(String),
	Array(Vec<FieldValue>),
	Timestamp { seconds: i64, nanos: u32 },
	Bytes(Vec<u8>),
	Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
	pub fn reference(path: impl Into<String>) -> Self {
		FieldValue::Reference(path.into())
	}

	/// Type name for diagnostics.
	pub fn kind(&self) -> &'static str {
		match self {
			FieldValue::Null => "null",
			FieldValue::Bool(_) => "boolean",
			FieldValue::Number(_) => "number",
			FieldValue::String(_) => "string",
			FieldValue::Reference(_) => "reference",
			FieldValue::Array(_) => "array",
			FieldValue::Timestamp { .. } => "timestamp",
			FieldValue::Bytes(_) => "bytes",
			FieldValue::Map(_) => "map",
		}
	}

	/// JSON representation as stored in documents. References become their path.
	pub fn to_json(&self) -> Value {
		match self {
			FieldValue::Null => Value::Null,
			FieldValue::Bool(b) => Value::Bool(*b),
			FieldValue::Number(n) => Value::Number(n.clone()),
			FieldValue::String(s) | FieldValue::Reference(s) => Value::String(s.clone()),
			FieldValue::Array(items) => Value::Array(items.iter().map(FieldValue::to_json).collect()),
			FieldValue::Timestamp { seconds, nanos } => {
				serde_json::json!({ "seconds": seconds, "nanos": nanos })
			}
			FieldValue::Bytes(bytes) => {
				Value::Array(bytes.iter().map(|b| Value::Number((*b).into())).collect())
			}
			FieldValue::Map(map) => {
				Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
			}
		}
	}

	pub fn as_array(&self) -> Option<&[FieldValue]> {
		match self {
			FieldValue::Array(items) => Some(items),
			_ => None,
		}
	}
}

impl From<&str> for FieldValue {
	fn from(s: &str) -> Self {
		FieldValue::String(s.to_string())
	}
}

impl From<String> for FieldValue {
	fn from(s: String) -> Self {
		FieldValue::String(s)
	}
}

impl From<&String> for FieldValue {
	fn from(s: &String) -> Self {
		FieldValue::String(s.clone())
	}
}

impl From<Box<str>> for FieldValue {
	fn from(s: Box<str>) -> Self {
		FieldValue::String(s.into())
	}
}

impl From<bool> for FieldValue {
	fn from(b: bool) -> Self {
		FieldValue::Bool(b)
	}
}

impl From<i64> for FieldValue {
	fn from(n: i64) -> Self {
		FieldValue::Number(n.into())
	}
}

impl From<i32> for FieldValue {
	fn from(n: i32) -> Self {
		FieldValue::Number(n.into())
	}
}

impl From<u64> for FieldValue {
	fn from(n: u64) -> Self {
		FieldValue::Number(n.into())
	}
}

/// Non-finite floats have no JSON form and map to `Null`.
impl From<f64> for FieldValue {
	fn from(n: f64) -> Self {
		Number::from_f64(n).map_or(FieldValue::Null, FieldValue::Number)
	}
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
	fn from(items: Vec<T>) -> Self {
		FieldValue::Array(items.into_iter().map(Into::into).collect())
	}
}

impl From<&Value> for FieldValue {
	fn from(value: &Value) -> Self {
		match value {
			Value::Null => FieldValue::Null,
			Value::Bool(b) => FieldValue::Bool(*b),
			Value::Number(n) => FieldValue::Number(n.clone()),
			Value::String(s) => FieldValue::String(s.clone()),
			Value::Array(items) => FieldValue::Array(items.iter().map(FieldValue::from).collect()),
			Value::Object(map) => {
				FieldValue::Map(map.iter().map(|(k, v)| (k.clone(), FieldValue::from(v))).collect())
			}
		}
	}
}

// vim: ts=4
