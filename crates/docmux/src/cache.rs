//! Per-collection document cache
//!
//! Holds the last known version of every document a collection listener
//! has delivered. Change records replace or delete whole documents, so
//! applying the same record twice is a no-op.

use docmux_types::patch::apply_patch;
use docmux_types::store_adapter::{ChangeKind, DocChange};
use serde_json::Value;
use std::collections::HashMap;

use crate::prelude::*;

#[derive(Debug, Default)]
pub struct DocCache {
	docs: HashMap<Box<str>, Document>,
}

impl DocCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.docs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.docs.is_empty()
	}

	pub fn get(&self, id: &str) -> Option<&Document> {
		self.docs.get(id)
	}

	pub fn contains(&self, id: &str) -> bool {
		self.docs.contains_key(id)
	}

	/// Apply one change record.
	pub fn apply(&mut self, change: &DocChange) {
		match change.kind {
			ChangeKind::Added | ChangeKind::Modified => {
				self.docs.insert(change.doc.id.clone(), change.doc.clone());
			}
			ChangeKind::Removed => {
				self.docs.remove(&change.doc.id);
			}
		}
	}

	pub fn remove(&mut self, id: &str) -> Option<Document> {
		self.docs.remove(id)
	}

	/// The documents for `ids` in the requested order, if all are cached.
	pub fn collect<S: AsRef<str>>(&self, ids: &[S]) -> Option<Vec<Document>> {
		ids.iter().map(|id| self.docs.get(id.as_ref()).cloned()).collect()
	}

	/// Ids from `ids` that are not cached.
	pub fn missing<'a, S: AsRef<str>>(&self, ids: &'a [S]) -> impl Iterator<Item = &'a str> {
		ids.iter().map(AsRef::as_ref).filter(|id| !self.docs.contains_key(*id))
	}

	/// Optimistically apply a field patch to a cached document.
	/// Returns false if the document is not cached.
	pub fn patch(&mut self, id: &str, patch: &Value) -> MxResult<bool> {
		match self.docs.get_mut(id) {
			Some(doc) => {
				apply_patch(&mut doc.data, patch)?;
				Ok(true)
			}
			None => Ok(false),
		}
	}
}


// vim: ts=4
