//! Batched writes and cascading delete
//!
//! The store commits at most `MAX_BATCH_OPS` operations per batch, so larger
//! write sets are split and committed one batch after the other. A failure
//! stops the sequence; batches already committed stay committed.

use docmux_types::query::{Filter, FilterOp, QueryDescriptor};
use docmux_types::store_adapter::{MAX_BATCH_OPS, StoreAdapter, WriteOp};
use docmux_types::utils::{check_collection_path, doc_path};
use docmux_types::value::FieldValue;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use crate::config::RegistryConfig;
use crate::prelude::*;

/// How a linking document refers to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkKind {
	/// The field holds one parent id
	Id,
	/// The field holds an array of parent ids
	IdArray,
}

/// What happens to a linking document when its parent is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnDelete {
	/// Delete it, cascading further through `children`
	Delete,
	/// Drop the deleted ids from the link field (`Id` links are cleared)
	Unlink,
}

/// Documents in `collection` linking to the deleted documents through `field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cascade {
	pub collection: String,
	pub field: String,
	pub link: LinkKind,
	pub action: OnDelete,
	/// Links into `collection`, followed when its documents are deleted
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub children: Vec<Cascade>,
}

impl Cascade {
	pub fn delete(collection: impl Into<String>, field: impl Into<String>, link: LinkKind) -> Self {
		Self {
			collection: collection.into(),
			field: field.into(),
			link,
			action: OnDelete::Delete,
			children: Vec::new(),
		}
	}

	pub fn unlink(collection: impl Into<String>, field: impl Into<String>, link: LinkKind) -> Self {
		Self {
			collection: collection.into(),
			field: field.into(),
			link,
			action: OnDelete::Unlink,
			children: Vec::new(),
		}
	}

	pub fn with_children(mut self, children: Vec<Cascade>) -> Self {
		self.children = children;
		self
	}
}

/// Outcome of [`delete_docs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
	/// Documents deleted, cascaded ones included
	pub deleted: usize,
	/// Documents whose link fields were rewritten
	pub unlinked: usize,
	/// Batches committed
	pub batches: usize,
}

/// Commit `ops` in batches of at most `batch_limit`, each awaited before
/// the next is issued. Returns the number of batches committed.
///
/// If a batch fails after others were committed the error is wrapped in
/// [`Error::BatchFailed`]; nothing is rolled back.
pub async fn commit_batches(
	store: &dyn StoreAdapter,
	ops: Vec<WriteOp>,
	batch_limit: usize,
) -> MxResult<usize> {
	let limit = batch_limit.clamp(1, MAX_BATCH_OPS);
	let total = ops.len().div_ceil(limit);
	let mut committed = 0;
	let mut ops = ops.into_iter().peekable();

	while ops.peek().is_some() {
		let batch = ops.by_ref().take(limit).collect::<Vec<_>>();
		let size = batch.len();
		if let Err(err) = store.batch_write(batch).await {
			warn!(committed, total, error = %err, "Batch commit failed");
			if committed == 0 {
				return Err(err);
			}
			return Err(Error::BatchFailed { committed, source: Box::new(err) });
		}
		committed += 1;
		debug!(batch = committed, total, ops = size, "Batch committed");
	}
	Ok(committed)
}

/// Delete the documents `ids` of `collection` and apply `cascades` to
/// everything linking to them.
///
/// Linked documents are looked up with one-shot queries before anything is
/// written. Link rewrites are committed first, then cascaded deletes
/// (deepest first), then the requested documents.
pub async fn delete_docs<S: AsRef<str>>(
	store: &dyn StoreAdapter,
	collection: &str,
	ids: &[S],
	cascades: &[Cascade],
	config: &RegistryConfig,
) -> MxResult<DeleteReport> {
	check_collection_path(collection)?;
	let ids = ids.iter().map(|id| Box::<str>::from(id.as_ref())).collect::<Vec<_>>();

	let mut plan = Plan::new(config.chunk_size);
	for id in &ids {
		plan.visited.insert(doc_path(collection, id).into());
	}
	plan_cascades(store, collection, ids.clone(), cascades, &mut plan).await?;
	for id in &ids {
		plan.deletes.push(doc_path(collection, id).into());
	}

	let (ops, unlinked) = plan.into_ops();
	let deleted = ops.len() - unlinked;
	info!(collection = %collection, deleted, unlinked, "Deleting documents");
	let batches = commit_batches(store, ops, config.batch_limit).await?;
	Ok(DeleteReport { deleted, unlinked, batches })
}

struct Plan {
	group_size: usize,
	/// Paths already scheduled for deletion
	visited: HashSet<Box<str>>,
	/// Deletes, children before parents
	deletes: Vec<Box<str>>,
	unlinks: HashMap<Box<str>, Map<String, Value>>,
	unlink_order: Vec<Box<str>>,
}

impl Plan {
	fn new(group_size: usize) -> Self {
		Self {
			group_size: group_size.max(1),
			visited: HashSet::new(),
			deletes: Vec::new(),
			unlinks: HashMap::new(),
			unlink_order: Vec::new(),
		}
	}

	fn unlink(&mut self, doc: &Document, cascade: &Cascade, removed: &HashSet<&str>) {
		if !self.unlinks.contains_key(&doc.path) {
			self.unlink_order.push(doc.path.clone());
		}
		let fields = self.unlinks.entry(doc.path.clone()).or_default();
		let value = match cascade.link {
			LinkKind::Id => Value::Null,
			LinkKind::IdArray => {
				// an earlier cascade level may already have filtered this array
				let current = fields.get(&cascade.field).or_else(|| doc.get(&cascade.field));
				let kept = current
					.and_then(Value::as_array)
					.map(|items| {
						items
							.iter()
							.filter(|v| v.as_str().is_none_or(|id| !removed.contains(id)))
							.cloned()
							.collect::<Vec<_>>()
					})
					.unwrap_or_default();
				Value::Array(kept)
			}
		};
		fields.insert(cascade.field.clone(), value);
	}

	fn into_ops(self) -> (Vec<WriteOp>, usize) {
		let mut ops = Vec::with_capacity(self.unlink_order.len() + self.deletes.len());
		let mut unlinks = self.unlinks;
		for path in self.unlink_order {
			if self.visited.contains(&path) {
				continue;
			}
			if let Some(fields) = unlinks.remove(&path) {
				ops.push(WriteOp::Update { path, data: Value::Object(fields) });
			}
		}
		let unlinked = ops.len();
		ops.extend(self.deletes.into_iter().map(|path| WriteOp::Delete { path }));
		(ops, unlinked)
	}
}

fn plan_cascades<'a>(
	store: &'a dyn StoreAdapter,
	collection: &'a str,
	ids: Vec<Box<str>>,
	cascades: &'a [Cascade],
	plan: &'a mut Plan,
) -> BoxFuture<'a, MxResult<()>> {
	Box::pin(async move {
		if ids.is_empty() {
			return Ok(());
		}
		for cascade in cascades {
			let linked = find_linked(store, cascade, &ids, plan.group_size).await?;
			debug!(
				collection = %collection,
				linked_collection = %cascade.collection,
				field = %cascade.field,
				found = linked.len(),
				"Cascade lookup"
			);
			match cascade.action {
				OnDelete::Delete => {
					let mut fresh = Vec::new();
					for doc in linked {
						if plan.visited.insert(doc.path.clone()) {
							fresh.push(doc.id);
						}
					}
					plan_cascades(store, &cascade.collection, fresh.clone(), &cascade.children, plan)
						.await?;
					for id in fresh {
						plan.deletes.push(doc_path(&cascade.collection, &id).into());
					}
				}
				OnDelete::Unlink => {
					let removed = ids.iter().map(AsRef::as_ref).collect::<HashSet<&str>>();
					for doc in &linked {
						plan.unlink(doc, cascade, &removed);
					}
				}
			}
		}
		Ok(())
	})
}

/// Documents of `cascade.collection` linking to any of `ids`.
async fn find_linked(
	store: &dyn StoreAdapter,
	cascade: &Cascade,
	ids: &[Box<str>],
	group_size: usize,
) -> MxResult<Vec<Document>> {
	check_collection_path(&cascade.collection)?;
	let mut seen = HashSet::new();
	let mut linked = Vec::new();
	for group in ids.chunks(group_size) {
		let values = group.iter().map(|id| FieldValue::String(id.to_string())).collect::<Vec<_>>();
		let filter = match (cascade.link, values.as_slice()) {
			(LinkKind::Id, [single]) => Filter::eq(cascade.field.as_str(), single.clone()),
			(LinkKind::Id, _) => Filter::any_of(cascade.field.as_str(), values),
			(LinkKind::IdArray, _) => Filter::field(
				cascade.field.as_str(),
				FilterOp::ArrayContainsAny,
				FieldValue::Array(values),
			),
		};
		let query = QueryDescriptor::collection(cascade.collection.as_str()).with_filter(filter);
		for doc in store.get_query(&query).await? {
			if seen.insert(doc.path.clone()) {
				linked.push(doc);
			}
		}
	}
	Ok(linked)
}

// vim: ts=4
