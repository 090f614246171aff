//! In-memory realtime document store.
//!
//! Implements [`StoreAdapter`] over a sorted map of documents. Every commit
//! broadcasts the paths it touched; each live subscription re-evaluates
//! its query against the current data and yields the difference. The
//! store also counts subscribe/unsubscribe calls and can inject failures,
//! which is what the multiplexer's tests assert against.

#![forbid(unsafe_code)]

pub mod eval;

use async_trait::async_trait;
use docmux_types::patch::apply_patch;
use docmux_types::prelude::*;
use docmux_types::query::{Filter, QueryDescriptor};
use docmux_types::store_adapter::*;
use docmux_types::utils::{check_document_path, parent_path};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Store configuration options
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
	/// Broadcast channel capacity for change notifications
	pub broadcast_capacity: usize,

	/// Operations accepted per `batch_write`
	pub max_batch_ops: usize,

	/// List length accepted by `in` / `array-contains-any` filters
	pub max_in_list: usize,
}

impl Default for MemoryStoreConfig {
	fn default() -> Self {
		Self { broadcast_capacity: 1000, max_batch_ops: MAX_BATCH_OPS, max_in_list: MAX_IN_LIST }
	}
}

/// Call accounting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
	/// `subscribe_query` calls
	pub query_subscribes: usize,
	/// `subscribe_document` calls
	pub document_subscribes: usize,
	/// Subscription streams dropped
	pub unsubscribes: usize,
	/// Subscription streams currently alive
	pub active: usize,
	/// One-shot `get_query` calls
	pub reads: usize,
	/// Successful `write_field` calls
	pub writes: usize,
	/// Successful `batch_write` calls
	pub batches: usize,
}

#[derive(Debug, Default)]
struct Failures {
	/// Subscriptions on paths with this prefix yield the error
	subscriptions: Vec<(Box<str>, Error)>,
	writes: Option<Error>,
	/// Batches still allowed to commit before batch writes start failing
	batches_left: Option<usize>,
}

#[derive(Debug)]
struct Inner {
	config: MemoryStoreConfig,
	docs: Mutex<BTreeMap<Box<str>, Value>>,
	change_tx: broadcast::Sender<Arc<[Box<str>]>>,
	stats: Mutex<StoreStats>,
	failures: Mutex<Failures>,
	subscribed: Mutex<Vec<QueryDescriptor>>,
}

impl Inner {
	fn query(&self, query: &QueryDescriptor) -> Vec<Document> {
		eval::execute_query(&self.docs.lock(), query)
	}

	fn document(&self, path: &str) -> DocumentSnapshot {
		let data = self.docs.lock().get(path).cloned();
		DocumentSnapshot { path: path.into(), exists: data.is_some(), data }
	}

	fn notify(&self, paths: Vec<Box<str>>) {
		if paths.is_empty() {
			return;
		}
		// no receivers is fine
		let _ = self.change_tx.send(paths.into());
	}

	fn subscription_failure(&self, path: &str) -> Option<Error> {
		self.failures
			.lock()
			.subscriptions
			.iter()
			.find(|(prefix, _)| path.starts_with(&**prefix))
			.map(|(_, err)| err.clone())
	}
}

/// Counts the end of a subscription when its stream is dropped.
struct SubscriptionGuard {
	inner: Arc<Inner>,
}

impl Drop for SubscriptionGuard {
	fn drop(&mut self) {
		let mut stats = self.inner.stats.lock();
		stats.unsubscribes += 1;
		stats.active = stats.active.saturating_sub(1);
	}
}

/// In-memory implementation of [`StoreAdapter`].
///
/// Cheap to clone; clones share data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
	inner: Arc<Inner>,
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new(MemoryStoreConfig::default())
	}
}

impl MemoryStore {
	pub fn new(config: MemoryStoreConfig) -> Self {
		let (change_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
		Self {
			inner: Arc::new(Inner {
				config,
				docs: Mutex::new(BTreeMap::new()),
				change_tx,
				stats: Mutex::new(StoreStats::default()),
				failures: Mutex::new(Failures::default()),
				subscribed: Mutex::new(Vec::new()),
			}),
		}
	}

	/// Create or replace a document.
	pub fn set(&self, path: &str, data: Value) {
		self.inner.docs.lock().insert(path.into(), data);
		self.inner.notify(vec![path.into()]);
	}

	/// Delete a document. Returns false if it did not exist.
	pub fn delete(&self, path: &str) -> bool {
		let existed = self.inner.docs.lock().remove(path).is_some();
		if existed {
			self.inner.notify(vec![path.into()]);
		}
		existed
	}

	pub fn get(&self, path: &str) -> Option<Value> {
		self.inner.docs.lock().get(path).cloned()
	}

	/// Number of stored documents.
	pub fn len(&self) -> usize {
		self.inner.docs.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.docs.lock().is_empty()
	}

	pub fn stats(&self) -> StoreStats {
		self.inner.stats.lock().clone()
	}

	/// Every query passed to `subscribe_query`, in call order.
	pub fn subscribed_queries(&self) -> Vec<QueryDescriptor> {
		self.inner.subscribed.lock().clone()
	}

	/// Make subscriptions on paths starting with `prefix` yield `err`.
	pub fn fail_subscriptions(&self, prefix: &str, err: Error) {
		self.inner.failures.lock().subscriptions.push((prefix.into(), err));
	}

	/// Make `write_field` fail with `err` (`None` clears it).
	pub fn fail_writes(&self, err: Option<Error>) {
		self.inner.failures.lock().writes = err;
	}

	/// Let `count` more batches commit, then fail every batch write.
	pub fn fail_batches_after(&self, count: usize) {
		self.inner.failures.lock().batches_left = Some(count);
	}

	pub fn clear_failures(&self) {
		*self.inner.failures.lock() = Failures::default();
	}

	fn check_query(&self, query: &QueryDescriptor) -> MxResult<()> {
		fn check(filter: &Filter, max: usize) -> MxResult<()> {
			match filter {
				Filter::Field { field, op, value } if op.takes_list() => {
					let len = value.as_array().map_or(1, <[_]>::len);
					if len > max {
						return Err(Error::InvalidArgument(format!(
							"'{}' filter on {} has {} values, at most {} allowed",
							op.as_str().trim(),
							field,
							len,
							max
						)));
					}
					Ok(())
				}
				Filter::Field { .. } => Ok(()),
				Filter::And(subs) | Filter::Or(subs) => subs.iter().try_for_each(|f| check(f, max)),
			}
		}
		query.filters.iter().try_for_each(|f| check(f, self.inner.config.max_in_list))
	}

	fn open_subscription(&self) -> SubscriptionGuard {
		self.inner.stats.lock().active += 1;
		SubscriptionGuard { inner: Arc::clone(&self.inner) }
	}
}

#[async_trait]
impl StoreAdapter for MemoryStore {
	fn subscribe_query(&self, query: &QueryDescriptor) -> MxResult<SnapshotStream> {
		self.check_query(query)?;
		self.inner.stats.lock().query_subscribes += 1;
		self.inner.subscribed.lock().push(query.clone());
		let guard = self.open_subscription();
		debug!(path = %query.path, filters = query.filters.len(), "Query subscription opened");

		if let Some(err) = self.inner.subscription_failure(&query.path) {
			let stream = async_stream::stream! {
				let _guard = guard;
				yield Err::<QuerySnapshot, _>(err);
			};
			return Ok(Box::pin(stream));
		}

		// Subscribe to broadcast FIRST to avoid losing commits before the first read
		let mut rx = self.inner.change_tx.subscribe();
		let inner = Arc::clone(&self.inner);
		let query = query.clone();

		let stream = async_stream::stream! {
			let _guard = guard;
			let mut current = inner.query(&query);
			let changes = current.iter().cloned().map(DocChange::added).collect();
			yield Ok::<_, Error>(QuerySnapshot { docs: current.clone(), changes });

			loop {
				match rx.recv().await {
					Ok(paths) => {
						if !paths.iter().any(|p| parent_path(p) == Some(query.path.as_str())) {
							continue;
						}
					}
					Err(broadcast::error::RecvError::Lagged(n)) => {
						warn!("Query subscription lagged, missed {} commits", n);
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}

				let next = inner.query(&query);
				let changes = eval::diff(&current, &next);
				if changes.is_empty() {
					continue;
				}
				current = next;
				yield Ok(QuerySnapshot { docs: current.clone(), changes });
			}
		};

		Ok(Box::pin(stream))
	}

	fn subscribe_document(&self, path: &str) -> MxResult<DocumentStream> {
		check_document_path(path)?;
		self.inner.stats.lock().document_subscribes += 1;
		let guard = self.open_subscription();
		debug!(path = %path, "Document subscription opened");

		if let Some(err) = self.inner.subscription_failure(path) {
			let stream = async_stream::stream! {
				let _guard = guard;
				yield Err::<DocumentSnapshot, _>(err);
			};
			return Ok(Box::pin(stream));
		}

		let mut rx = self.inner.change_tx.subscribe();
		let inner = Arc::clone(&self.inner);
		let path: Box<str> = path.into();

		let stream = async_stream::stream! {
			let _guard = guard;
			let mut current = inner.document(&path);
			yield Ok::<_, Error>(current.clone());

			loop {
				match rx.recv().await {
					Ok(paths) => {
						if !paths.iter().any(|p| *p == path) {
							continue;
						}
					}
					Err(broadcast::error::RecvError::Lagged(n)) => {
						warn!("Document subscription lagged, missed {} commits", n);
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}

				let next = inner.document(&path);
				if next == current {
					continue;
				}
				current = next;
				yield Ok(current.clone());
			}
		};

		Ok(Box::pin(stream))
	}

	async fn get_query(&self, query: &QueryDescriptor) -> MxResult<Vec<Document>> {
		self.check_query(query)?;
		self.inner.stats.lock().reads += 1;
		Ok(self.inner.query(query))
	}

	async fn write_field(&self, path: &str, patch: Value) -> MxResult<()> {
		check_document_path(path)?;
		if let Some(err) = self.inner.failures.lock().writes.clone() {
			return Err(err);
		}
		{
			let mut docs = self.inner.docs.lock();
			let doc = docs.get_mut(path).ok_or_else(|| Error::NotFound(path.into()))?;
			apply_patch(doc, &patch)?;
		}
		self.inner.stats.lock().writes += 1;
		self.inner.notify(vec![path.into()]);
		Ok(())
	}

	async fn batch_write(&self, ops: Vec<WriteOp>) -> MxResult<()> {
		if ops.len() > self.inner.config.max_batch_ops {
			return Err(Error::InvalidArgument(format!(
				"batch of {} operations exceeds the limit of {}",
				ops.len(),
				self.inner.config.max_batch_ops
			)));
		}
		{
			let mut failures = self.inner.failures.lock();
			match failures.batches_left.as_mut() {
				Some(0) => return Err(Error::Unavailable("batch commit rejected".into())),
				Some(left) => *left -= 1,
				None => {}
			}
		}

		let paths = {
			let mut docs = self.inner.docs.lock();
			// apply to a copy so a failing op leaves nothing behind
			let mut next = docs.clone();
			for op in &ops {
				check_document_path(op.path())?;
				match op {
					WriteOp::Set { path, data } => {
						next.insert(path.clone(), data.clone());
					}
					WriteOp::Update { path, data } => {
						let doc = next.get_mut(path).ok_or_else(|| Error::NotFound(path.clone()))?;
						apply_patch(doc, data)?;
					}
					WriteOp::Delete { path } => {
						next.remove(path);
					}
				}
			}
			*docs = next;
			ops.iter().map(|op| Box::<str>::from(op.path())).collect::<Vec<_>>()
		};

		self.inner.stats.lock().batches += 1;
		debug!(ops = paths.len(), "Batch committed");
		self.inner.notify(paths);
		Ok(())
	}
}

// vim: ts=4
