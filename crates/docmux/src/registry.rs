//! Subscription registry
//!
//! Keeps at most one live store subscription per logical key and fans its
//! results out to every registered caller.
//!
//! - Collection keys are served by a [`ChunkedIdListener`]. The first
//!   registration schedules the listener start after `start_delay`, so
//!   callers mounting together are batched into one request. The listener
//!   is shut down as soon as its last caller leaves.
//! - Document and query keys are owned by one caller. When the owner leaves
//!   the subscription stays up for `grace_period`; a caller registering in
//!   that window takes it over without any store traffic.
//!
//! All state sits behind one mutex. Callbacks are collected while it is held
//! and invoked after it is released.

use docmux_types::query::QueryDescriptor;
use docmux_types::store_adapter::{DocumentSnapshot, StoreAdapter, WriteOp};
use docmux_types::utils::{
	check_collection_path, check_document_path, doc_id, normalize_path, parent_path,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::batch::{self, Cascade, DeleteReport};
use crate::canonical::canonical_key;
use crate::chunked::{ChunkEvent, ChunkSink, ChunkedIdListener};
use crate::collection::{CollectionRecord, DocsCaller};
use crate::config::RegistryConfig;
use crate::deliver::{Deliveries, DocCallback, DocsCallback, ErrorCallback};
use crate::prelude::*;
use crate::shared::{SharedCaller, SharedRecord, SharedRecords, forward};

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
	/// Collection listeners, waiting or started
	pub collections: usize,
	/// Live document subscriptions, including ones in their grace period
	pub documents: usize,
	/// Live query subscriptions, including ones in their grace period
	pub queries: usize,
	/// Registered callers over all keys
	pub callers: usize,
	/// Chunk subscriptions over all collection listeners
	pub chunks: usize,
}

/// Result of [`SubscriptionRegistry::register_docs_hook`].
#[derive(Debug)]
pub struct DocsRegistration {
	/// All requested documents, in requested order, if they were cached
	pub cached: Option<Vec<Document>>,
	pub registration: Registration,
}

/// Result of [`SubscriptionRegistry::register_doc_hook`].
#[derive(Debug)]
pub struct DocRegistration {
	pub cached: Option<Document>,
	pub registration: Registration,
}

/// Result of [`SubscriptionRegistry::register_query_hook`].
#[derive(Debug)]
pub struct QueryRegistration {
	pub key: LogicalKey,
	pub cached: Option<Vec<Document>>,
	pub registration: Registration,
}

#[derive(Default)]
struct RegistryState {
	collections: HashMap<Box<str>, CollectionRecord>,
	documents: SharedRecords<Document>,
	queries: SharedRecords<Vec<Document>>,
	/// Callers unregistered from a key, until they register on it again
	retired: HashSet<(LogicalKey, CallerId)>,
	next_generation: u64,
	next_epoch: u64,
}

impl RegistryState {
	fn generation(&mut self) -> u64 {
		self.next_generation += 1;
		self.next_generation
	}

	fn epoch(&mut self) -> u64 {
		self.next_epoch += 1;
		self.next_epoch
	}

	fn revive(&mut self, key: &LogicalKey, hook: &CallerId) {
		if !self.retired.is_empty() {
			self.retired.remove(&(key.clone(), hook.clone()));
		}
	}
}

struct Inner {
	store: Arc<dyn StoreAdapter>,
	config: RegistryConfig,
	state: Mutex<RegistryState>,
}

/// Multiplexes caller registrations onto store subscriptions.
///
/// Cheap to clone; clones share state. Must be used from within a tokio
/// runtime: subscriptions and timers run as tasks.
#[derive(Clone)]
pub struct SubscriptionRegistry {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for SubscriptionRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SubscriptionRegistry")
			.field("store", &self.inner.store)
			.field("config", &self.inner.config)
			.finish_non_exhaustive()
	}
}

impl SubscriptionRegistry {
	/// Create a registry with default config
	pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
		Self::with_config(store, RegistryConfig::default())
	}

	pub fn with_config(store: Arc<dyn StoreAdapter>, config: RegistryConfig) -> Self {
		Self {
			inner: Arc::new(Inner { store, config, state: Mutex::new(RegistryState::default()) }),
		}
	}

	pub fn config(&self) -> &RegistryConfig {
		&self.inner.config
	}

	pub fn store(&self) -> &Arc<dyn StoreAdapter> {
		&self.inner.store
	}

	/// Register a caller for the documents `ids` of `collection`.
	///
	/// Returns the documents right away if every one of them is cached;
	/// otherwise they arrive through `on_docs` once all are loaded. An id
	/// that turns out not to exist is reported through `on_error` as
	/// [`Error::NotFound`], once, after the listener is fully loaded.
	pub fn register_docs_hook<S: AsRef<str>>(
		&self,
		hook: CallerId,
		collection: &str,
		ids: &[S],
		on_docs: DocsCallback,
		on_error: Option<ErrorCallback>,
	) -> MxResult<DocsRegistration> {
		check_collection_path(collection)?;
		let collection = normalize_path(collection);
		let collection = collection.as_str();
		let ids = ids.iter().map(|id| Box::<str>::from(id.as_ref())).collect::<Vec<_>>();
		let key = LogicalKey::Collection(collection.into());
		let active = Arc::new(AtomicBool::new(true));
		let mut out = Deliveries::new();

		let mut guard = self.inner.state.lock();
		let state = &mut *guard;
		let mut created = None;
		let record = match state.collections.entry(collection.into()) {
			Entry::Occupied(entry) => entry.into_mut(),
			Entry::Vacant(entry) => {
				state.next_generation += 1;
				let generation = state.next_generation;
				let listener = ChunkedIdListener::new(
					Arc::clone(&self.inner.store),
					collection,
					&[] as &[&str],
					self.inner.config.chunk_size,
					self.chunk_sink(collection, generation),
				);
				created = Some(generation);
				entry.insert(CollectionRecord::new(generation, listener))
			}
		};
		if record.callers.iter().any(|c| c.id == hook) {
			return Err(Error::InvalidArgument(format!("{} already registered on {}", hook, key)));
		}

		let added = record.listener.add_ids(&ids)?;
		let cached = record.cache.collect(&ids);
		debug!(
			caller = %hook,
			key = %key,
			ids = ids.len(),
			new = added.len(),
			cached = cached.is_some(),
			"Docs hook registered"
		);
		record.callers.push(DocsCaller {
			id: hook.clone(),
			ids,
			on_docs,
			on_error,
			active: Arc::clone(&active),
			delivered: cached.is_some(),
			reported: HashSet::new(),
		});
		if cached.is_none() && added.is_empty() && record.listener.is_loaded() {
			// nothing new to subscribe: whatever is missing is missing for good
			record.notify(&HashSet::new(), &mut out);
		}
		state.revive(&key, &hook);
		drop(guard);

		if let Some(generation) = created {
			self.schedule_start(collection, generation);
		}
		out.run();

		Ok(DocsRegistration { cached, registration: self.registration(key, hook, active) })
	}

	/// Change the ids a docs hook wants.
	///
	/// If everything is cached the caller is notified before this returns
	/// and the store is not touched; otherwise the listener subscribes to
	/// whatever is new.
	pub fn update_doc_ids<S: AsRef<str>>(
		&self,
		collection: &str,
		hook: &CallerId,
		ids: &[S],
	) -> MxResult<()> {
		let collection = normalize_path(collection);
		let collection = collection.as_str();
		let ids = ids.iter().map(|id| Box::<str>::from(id.as_ref())).collect::<Vec<_>>();
		let mut out = Deliveries::new();
		{
			let mut state = self.inner.state.lock();
			let record = state.collections.get_mut(collection).ok_or(Error::UnknownCaller)?;
			let pos = record.callers.iter().position(|c| &c.id == hook).ok_or(Error::UnknownCaller)?;

			let cached = record.cache.collect(&ids);
			let caller = &mut record.callers[pos];
			caller.reported.retain(|id| ids.contains(id));
			caller.ids = ids;

			match cached {
				Some(docs) => {
					caller.delivered = true;
					out.docs(&caller.active, &caller.on_docs, docs);
				}
				None => {
					caller.delivered = false;
					let added = record.listener.add_ids(&record.callers[pos].ids)?;
					debug!(caller = %hook, collection = %collection, new = added.len(), "Docs hook ids updated");
					if added.is_empty() && record.listener.is_loaded() {
						record.notify(&HashSet::new(), &mut out);
					}
				}
			}
		}
		out.run();
		Ok(())
	}

	/// Register a caller for a single document.
	///
	/// The first caller opens the subscription and owns it; later callers
	/// get the cached document right away. A caller registering while the
	/// subscription is in its grace period takes it over.
	pub fn register_doc_hook(
		&self,
		hook: CallerId,
		path: &str,
		on_doc: DocCallback,
		on_error: Option<ErrorCallback>,
	) -> MxResult<DocRegistration> {
		check_document_path(path)?;
		let path = normalize_path(path);
		let path = path.as_str();
		let key = LogicalKey::Document(path.into());
		let active = Arc::new(AtomicBool::new(true));
		let mut out = Deliveries::new();

		let mut guard = self.inner.state.lock();
		let state = &mut *guard;
		if state.documents.get(path).is_none() {
			let generation = state.generation();
			let stream = self.inner.store.subscribe_document(path)?;
			let weak = Arc::downgrade(&self.inner);
			let doc_path: Box<str> = path.into();
			let task = forward(stream, move |result| {
				if let Some(inner) = weak.upgrade() {
					inner.on_document_event(&doc_path, generation, result);
				}
			});
			debug!(key = %key, "Document subscribed");
			state.documents.insert(path.into(), SharedRecord::new(key.clone(), generation, task));
		}
		let record = state.documents.get_mut(path).ok_or(Error::UnknownCaller)?;
		if record.contains(&hook) {
			return Err(Error::InvalidArgument(format!("{} already registered on {}", hook, key)));
		}

		let cached = record.value.clone();
		let mut caller = SharedCaller {
			id: hook.clone(),
			on_value: on_doc,
			on_error,
			active: Arc::clone(&active),
			reported: false,
		};
		if record.missing {
			caller.reported = true;
			out.error(&caller.active, caller.on_error.as_ref(), &hook, Error::NotFound(path.into()));
		}
		let owner = record.join(caller);
		debug!(caller = %hook, key = %key, owner, cached = cached.is_some(), "Doc hook registered");
		state.revive(&key, &hook);
		drop(guard);
		out.run();

		Ok(DocRegistration { cached, registration: self.registration(key, hook, active) })
	}

	/// Register a caller for the results of a query.
	///
	/// Queries are shared by canonical key, with the same ownership and
	/// grace period as document hooks.
	pub fn register_query_hook(
		&self,
		hook: CallerId,
		query: &QueryDescriptor,
		on_docs: DocsCallback,
		on_error: Option<ErrorCallback>,
	) -> MxResult<QueryRegistration> {
		check_collection_path(&query.path)?;
		let canonical: Box<str> = canonical_key(query)?.into();
		let mut query = query.clone();
		query.path = normalize_path(&query.path);
		let key = LogicalKey::Query(canonical.clone());
		let active = Arc::new(AtomicBool::new(true));

		let mut guard = self.inner.state.lock();
		let state = &mut *guard;
		if state.queries.get(&canonical).is_none() {
			let generation = state.generation();
			let stream = self.inner.store.subscribe_query(&query)?;
			let weak = Arc::downgrade(&self.inner);
			let query_key = canonical.clone();
			let task = forward(stream, move |result| {
				if let Some(inner) = weak.upgrade() {
					inner.on_query_event(&query_key, generation, result.map(|s| s.docs));
				}
			});
			debug!(key = %key, "Query subscribed");
			state.queries.insert(canonical.clone(), SharedRecord::new(key.clone(), generation, task));
		}
		let record = state.queries.get_mut(&canonical).ok_or(Error::UnknownCaller)?;
		if record.contains(&hook) {
			return Err(Error::InvalidArgument(format!("{} already registered on {}", hook, key)));
		}

		let cached = record.value.clone();
		let owner = record.join(SharedCaller {
			id: hook.clone(),
			on_value: on_docs,
			on_error,
			active: Arc::clone(&active),
			reported: false,
		});
		debug!(caller = %hook, key = %key, owner, cached = cached.is_some(), "Query hook registered");
		state.revive(&key, &hook);
		drop(guard);

		Ok(QueryRegistration {
			key: key.clone(),
			cached,
			registration: self.registration(key, hook, active),
		})
	}

	/// Remove a caller from a key. Same as [`Registration::unregister`],
	/// for callers that keep ids rather than handles: a second call fails
	/// with [`Error::AlreadyUnregistered`].
	pub fn unregister(&self, key: &LogicalKey, hook: &CallerId) -> MxResult<()> {
		self.inner.unregister(key, hook)
	}

	/// Whether `hook` was unregistered from `key` and has not registered on
	/// it again.
	pub fn was_unregistered(&self, key: &LogicalKey, hook: &CallerId) -> bool {
		self.inner.state.lock().retired.contains(&(key.normalized(), hook.clone()))
	}

	/// Drop the unregister history of `hook`, once its ids are no longer in
	/// use.
	pub fn forget_caller(&self, hook: &CallerId) {
		self.inner.state.lock().retired.retain(|(_, id)| id != hook);
	}

	/// Optimistically apply `patch` to every cached copy of the document at
	/// `path`, notify the affected callers, then write it to the store.
	///
	/// The cached copies are not rolled back if the write fails; the next
	/// snapshot from the store replaces them.
	pub async fn write_field(&self, path: &str, patch: Value) -> MxResult<()> {
		check_document_path(path)?;
		if !patch.is_object() {
			return Err(Error::InvalidArgument("field patch must be an object".into()));
		}
		let path = normalize_path(path);
		let out = self.inner.overlay(&path, &patch)?;
		out.run();
		self.inner.store.write_field(&path, patch).await
	}

	/// Commit `ops` in batches of at most `batch_limit` operations.
	/// Returns the number of batches committed.
	pub async fn batch_write(&self, ops: Vec<WriteOp>) -> MxResult<usize> {
		batch::commit_batches(self.inner.store.as_ref(), ops, self.inner.config.batch_limit).await
	}

	/// Delete documents of `collection` along with everything linked to
	/// them through `cascades`.
	pub async fn delete_docs<S: AsRef<str>>(
		&self,
		collection: &str,
		ids: &[S],
		cascades: &[Cascade],
	) -> MxResult<DeleteReport> {
		let collection = normalize_path(collection);
		batch::delete_docs(self.inner.store.as_ref(), &collection, ids, cascades, &self.inner.config)
			.await
	}

	pub fn stats(&self) -> RegistryStats {
		let state = self.inner.state.lock();
		RegistryStats {
			collections: state.collections.len(),
			documents: state.documents.len(),
			queries: state.queries.len(),
			callers: state.collections.values().map(|r| r.callers.len()).sum::<usize>()
				+ state.documents.callers()
				+ state.queries.callers(),
			chunks: state.collections.values().map(|r| r.listener.chunks().count()).sum(),
		}
	}

	/// Current owner of a key. For collection keys this is the earliest
	/// registered caller still present.
	pub fn owner_of(&self, key: &LogicalKey) -> Option<CallerId> {
		let key = key.normalized();
		let state = self.inner.state.lock();
		match &key {
			LogicalKey::Collection(path) => {
				state.collections.get(path).and_then(|r| r.callers.first()).map(|c| c.id.clone())
			}
			LogicalKey::Document(path) => {
				state.documents.get(path).and_then(|r| r.ownership.owner().cloned())
			}
			LogicalKey::Query(canonical) => {
				state.queries.get(canonical).and_then(|r| r.ownership.owner().cloned())
			}
		}
	}

	/// Chunk layout of a collection listener, for diagnostics.
	pub fn chunks_of(&self, collection: &str) -> Vec<Vec<Box<str>>> {
		let state = self.inner.state.lock();
		state
			.collections
			.get(normalize_path(collection).as_str())
			.map(|r| r.listener.chunks().map(<[Box<str>]>::to_vec).collect())
			.unwrap_or_default()
	}

	fn registration(&self, key: LogicalKey, caller: CallerId, active: Arc<AtomicBool>) -> Registration {
		Registration {
			inner: Arc::downgrade(&self.inner),
			key,
			caller,
			active,
			done: AtomicBool::new(false),
		}
	}

	fn chunk_sink(&self, collection: &str, generation: u64) -> ChunkSink {
		let weak = Arc::downgrade(&self.inner);
		let collection: Box<str> = collection.into();
		Arc::new(move |event| {
			if let Some(inner) = weak.upgrade() {
				inner.on_chunk_event(&collection, generation, event);
			}
		})
	}

	fn schedule_start(&self, collection: &str, generation: u64) {
		let weak = Arc::downgrade(&self.inner);
		let delay = self.inner.config.start_delay;
		let collection: Box<str> = collection.into();
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			if let Some(inner) = weak.upgrade() {
				inner.start_collection(&collection, generation);
			}
		});
	}
}

impl Inner {
	fn start_collection(&self, collection: &str, generation: u64) {
		let mut out = Deliveries::new();
		{
			let mut state = self.state.lock();
			let Some(record) = state.collections.get_mut(collection) else {
				return;
			};
			if record.generation != generation || !record.is_waiting() {
				return;
			}
			if let Err(err) = record.listener.start() {
				warn!(collection = %collection, error = %err, "Collection listener failed to start");
				for caller in &record.callers {
					out.error(&caller.active, caller.on_error.as_ref(), &caller.id, err.clone());
				}
			}
		}
		out.run();
	}

	fn on_chunk_event(&self, collection: &str, generation: u64, event: ChunkEvent) {
		let out = {
			let mut state = self.state.lock();
			match state.collections.get_mut(collection) {
				Some(record) if record.generation == generation => record.on_chunk_event(event),
				_ => return,
			}
		};
		out.run();
	}

	fn on_document_event(&self, path: &str, generation: u64, result: MxResult<DocumentSnapshot>) {
		let out = {
			let mut state = self.state.lock();
			let Some(record) = state.documents.current(path, generation) else {
				return;
			};
			match result {
				Ok(snapshot) => record.on_document(snapshot),
				Err(err) => {
					warn!(path = %path, error = %err, "Document subscription failed");
					record.fail(&err)
				}
			}
		};
		out.run();
	}

	fn on_query_event(&self, canonical: &str, generation: u64, result: MxResult<Vec<Document>>) {
		let out = {
			let mut state = self.state.lock();
			let Some(record) = state.queries.current(canonical, generation) else {
				return;
			};
			match result {
				Ok(docs) => record.publish(docs),
				Err(err) => {
					warn!(key = %canonical, error = %err, "Query subscription failed");
					record.fail(&err)
				}
			}
		};
		out.run();
	}

	fn unregister(self: &Arc<Self>, key: &LogicalKey, hook: &CallerId) -> MxResult<()> {
		let key = &key.normalized();
		let mut state = self.state.lock();
		let retired = (key.clone(), hook.clone());
		if state.retired.contains(&retired) {
			return Err(Error::AlreadyUnregistered(hook.clone()));
		}
		let epoch = state.epoch();
		let grace = match key {
			LogicalKey::Collection(path) => {
				let record = state.collections.get_mut(path).ok_or(Error::UnknownCaller)?;
				if let Some(caller) = record.remove_caller(hook) {
					caller.active.store(false, Ordering::Release);
				} else {
					return Err(Error::UnknownCaller);
				}
				debug!(caller = %hook, key = %key, remaining = record.callers.len(), "Docs hook unregistered");
				if record.callers.is_empty()
					&& let Some(mut record) = state.collections.remove(path)
				{
					record.listener.shut_down();
				}
				None
			}
			LogicalKey::Document(path) => state.documents.leave(path, hook, epoch)?,
			LogicalKey::Query(canonical) => state.queries.leave(canonical, hook, epoch)?,
		};
		state.retired.insert(retired);
		drop(state);

		if let Some(epoch) = grace {
			let weak = Arc::downgrade(self);
			let delay = self.config.grace_period;
			let key = key.clone();
			tokio::spawn(async move {
				tokio::time::sleep(delay).await;
				if let Some(inner) = weak.upgrade() {
					inner.settle(&key, epoch);
				}
			});
		}
		Ok(())
	}

	fn settle(&self, key: &LogicalKey, epoch: u64) {
		let mut state = self.state.lock();
		match key {
			LogicalKey::Document(path) => state.documents.settle(path, epoch),
			LogicalKey::Query(canonical) => state.queries.settle(canonical, epoch),
			LogicalKey::Collection(_) => {}
		}
	}

	fn overlay(&self, path: &str, patch: &Value) -> MxResult<Deliveries> {
		let mut out = Deliveries::new();
		let mut state = self.state.lock();

		if let Some(record) = parent_path(path).and_then(|c| state.collections.get_mut(c)) {
			let id = doc_id(path);
			if record.cache.patch(id, patch)? {
				let touched = HashSet::from([Box::<str>::from(id)]);
				record.notify(&touched, &mut out);
			}
		}
		if let Some(record) = state.documents.get_mut(path) {
			out.append(record.overlay(path, patch)?);
		}
		for record in state.queries.values_mut() {
			out.append(record.overlay(path, patch)?);
		}
		debug!(path = %path, notified = out.len(), "Optimistic field update applied");
		Ok(out)
	}
}

/// Handle of one caller's registration on one key.
///
/// Unregistering is explicit; dropping the handle leaves the caller
/// registered.
pub struct Registration {
	inner: Weak<Inner>,
	key: LogicalKey,
	caller: CallerId,
	active: Arc<AtomicBool>,
	done: AtomicBool,
}

impl std::fmt::Debug for Registration {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Registration")
			.field("key", &self.key)
			.field("caller", &self.caller)
			.field("done", &self.done)
			.finish_non_exhaustive()
	}
}

impl Registration {
	pub fn key(&self) -> &LogicalKey {
		&self.key
	}

	pub fn caller(&self) -> &CallerId {
		&self.caller
	}

	pub fn is_active(&self) -> bool {
		!self.done.load(Ordering::Acquire)
	}

	/// Remove the caller from its key. No callback reaches the caller after
	/// this returns. Fails with [`Error::AlreadyUnregistered`] when called
	/// twice.
	pub fn unregister(&self) -> MxResult<()> {
		if self.done.swap(true, Ordering::AcqRel) {
			return Err(Error::AlreadyUnregistered(self.caller.clone()));
		}
		self.active.store(false, Ordering::Release);
		match self.inner.upgrade() {
			Some(inner) => inner.unregister(&self.key, &self.caller),
			None => Ok(()),
		}
	}
}

// vim: ts=4
