//! Realtime Store Adapter
//!
//! Trait and types for the backing realtime document database. The
//! multiplexer never talks to a store directly; it consumes this interface.
//!
//! Subscriptions are streams: the first item of a query stream is the
//! full initial result (every document reported as `Added`), later items
//! carry the full current result plus the incremental changes. Dropping
//! the stream is the unsubscribe.

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::pin::Pin;

use crate::prelude::*;
use crate::query::QueryDescriptor;

/// Maximum number of operations a single `batch_write` accepts.
pub const MAX_BATCH_OPS: usize = 500;

/// Maximum list length of an `in` / `array-contains-any` filter.
pub const MAX_IN_LIST: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
	Added,
	Modified,
	Removed,
}

/// One incremental change record. `doc` carries the full document; for
/// `Removed` it is the last known version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocChange {
	pub kind: ChangeKind,
	pub doc: Document,
}

impl DocChange {
	pub fn added(doc: Document) -> Self {
		Self { kind: ChangeKind::Added, doc }
	}

	pub fn modified(doc: Document) -> Self {
		Self { kind: ChangeKind::Modified, doc }
	}

	pub fn removed(doc: Document) -> Self {
		Self { kind: ChangeKind::Removed, doc }
	}
}

/// Result set delivered by a query subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySnapshot {
	/// Full current result set, in query order
	pub docs: Vec<Document>,
	/// Changes since the previous snapshot of the same subscription
	pub changes: Vec<DocChange>,
}

/// State of one document delivered by a document subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
	pub path: Box<str>,
	pub exists: bool,
	pub data: Option<Value>,
}

impl DocumentSnapshot {
	pub fn id(&self) -> &str {
		crate::utils::doc_id(&self.path)
	}

	/// The document, if it exists.
	pub fn into_document(self) -> Option<Document> {
		match (self.exists, self.data) {
			(true, Some(data)) => Some(Document::new(self.path, data)),
			(true, None) => Some(Document::new(self.path, Value::Object(serde_json::Map::new()))),
			(false, _) => None,
		}
	}
}

/// A write inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WriteOp {
	/// Create or fully replace a document
	Set { path: Box<str>, data: Value },
	/// Shallow-merge fields into an existing document
	Update { path: Box<str>, data: Value },
	Delete { path: Box<str> },
}

impl WriteOp {
	pub fn path(&self) -> &str {
		match self {
			WriteOp::Set { path, .. } | WriteOp::Update { path, .. } | WriteOp::Delete { path } => {
				path
			}
		}
	}
}

pub type SnapshotStream = Pin<Box<dyn Stream<Item = MxResult<QuerySnapshot>> + Send>>;
pub type DocumentStream = Pin<Box<dyn Stream<Item = MxResult<DocumentSnapshot>> + Send>>;

/// Realtime document store.
///
/// Subscribing is synchronous (the stream is lazy); writes are async and
/// resolve when the store acknowledged them.
#[async_trait]
pub trait StoreAdapter: Debug + Send + Sync {
	/// Subscribe to a query. Errors reported by the store arrive as `Err`
	/// items and are passed to callers unchanged.
	fn subscribe_query(&self, query: &QueryDescriptor) -> MxResult<SnapshotStream>;

	/// Subscribe to a single document.
	fn subscribe_document(&self, path: &str) -> MxResult<DocumentStream>;

	/// Run a query once.
	async fn get_query(&self, query: &QueryDescriptor) -> MxResult<Vec<Document>>;

	/// Shallow-merge `patch` into the document at `path`.
	async fn write_field(&self, path: &str, patch: Value) -> MxResult<()>;

	/// Commit up to `MAX_BATCH_OPS` operations atomically.
	async fn batch_write(&self, ops: Vec<WriteOp>) -> MxResult<()>;
}

// vim: ts=4
