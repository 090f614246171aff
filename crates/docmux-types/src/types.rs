//! Core identifiers and the cached document representation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of one mounted consumer.
///
/// Equality and hashing only look at the sequence number; the label is a
/// diagnostic aid (the registration site in debug builds).
#[derive(Debug, Clone, Eq)]
pub struct CallerId {
	seq: u64,
	label: Option<Box<str>>,
}

impl CallerId {
	pub fn new(seq: u64) -> Self {
		Self { seq, label: None }
	}

	pub fn with_label(seq: u64, label: impl Into<Box<str>>) -> Self {
		Self { seq, label: Some(label.into()) }
	}

	pub fn seq(&self) -> u64 {
		self.seq
	}

	pub fn label(&self) -> Option<&str> {
		self.label.as_deref()
	}
}

impl PartialEq for CallerId {
	fn eq(&self, other: &Self) -> bool {
		self.seq == other.seq
	}
}

impl Hash for CallerId {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.seq.hash(state);
	}
}

impl fmt::Display for CallerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.label {
			Some(label) => write!(f, "hook-{}@{}", self.seq, label),
			None => write!(f, "hook-{}", self.seq),
		}
	}
}

/// A subscribable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogicalKey {
	/// A single document path, e.g. `repos/1`
	Document(Box<str>),
	/// A collection served by id, e.g. `tags`
	Collection(Box<str>),
	/// A canonical query string
	Query(Box<str>),
}

impl LogicalKey {
	pub fn as_str(&self) -> &str {
		match self {
			LogicalKey::Document(s) | LogicalKey::Collection(s) | LogicalKey::Query(s) => s,
		}
	}

	/// Same key with its path normalized. Query keys are already canonical.
	pub fn normalized(&self) -> LogicalKey {
		match self {
			LogicalKey::Document(path) => LogicalKey::Document(crate::utils::normalize_path(path).into()),
			LogicalKey::Collection(path) => {
				LogicalKey::Collection(crate::utils::normalize_path(path).into())
			}
			LogicalKey::Query(key) => LogicalKey::Query(key.clone()),
		}
	}
}

impl fmt::Display for LogicalKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			LogicalKey::Document(path) => write!(f, "doc:{}", path),
			LogicalKey::Collection(path) => write!(f, "col:{}", path),
			LogicalKey::Query(key) => write!(f, "query:{}", key),
		}
	}
}

/// Snapshot of one document as last delivered by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
	pub id: Box<str>,
	/// Full path, `<collection>/<id>`
	pub path: Box<str>,
	pub data: Value,
}

impl Document {
	pub fn new(path: impl Into<Box<str>>, data: Value) -> Self {
		let path = path.into();
		let id = crate::utils::doc_id(&path).into();
		Self { id, path, data }
	}

	/// Collection path (everything before the last segment).
	pub fn collection(&self) -> &str {
		crate::utils::parent_path(&self.path).unwrap_or_default()
	}

	pub fn get(&self, field: &str) -> Option<&Value> {
		self.data.get(field)
	}
}

// vim: ts=4
