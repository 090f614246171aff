//! Caller registration facade
//!
//! The API a UI binding layer talks to. Each mounted consumer gets a
//! [`Mount`] carrying a caller id that stays the same for the life of the
//! mount, however often the consumer changes what it wants. Ids come from
//! a counter and are never reused.

use docmux_types::query::QueryDescriptor;
use docmux_types::utils::{check_collection_path, check_document_path, normalize_path};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::canonical::canonical_key;
use crate::deliver::{DocCallback, DocsCallback, ErrorCallback};
use crate::prelude::*;
use crate::registry::{Registration, SubscriptionRegistry};

/// What a consumer wants.
#[derive(Debug, Clone, PartialEq)]
pub enum Want {
	/// Documents of a collection by id, delivered in the requested order
	Ids { collection: String, ids: Vec<String> },
	Document { path: String },
	Query(QueryDescriptor),
}

impl Want {
	pub fn ids<S: AsRef<str>>(collection: impl Into<String>, ids: &[S]) -> Self {
		Want::Ids {
			collection: collection.into(),
			ids: ids.iter().map(|id| id.as_ref().to_string()).collect(),
		}
	}

	pub fn document(path: impl Into<String>) -> Self {
		Want::Document { path: path.into() }
	}

	/// The logical key this want is served under. Fails on the same path
	/// and query errors registering it would.
	pub fn key(&self) -> MxResult<LogicalKey> {
		Ok(match self {
			Want::Ids { collection, .. } => {
				check_collection_path(collection)?;
				LogicalKey::Collection(normalize_path(collection).into())
			}
			Want::Document { path } => {
				check_document_path(path)?;
				LogicalKey::Document(normalize_path(path).into())
			}
			Want::Query(query) => {
				check_collection_path(&query.path)?;
				LogicalKey::Query(canonical_key(query)?.into())
			}
		})
	}
}

/// A result delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum HookValue {
	Docs(Vec<Document>),
	Document(Document),
}

impl HookValue {
	pub fn docs(&self) -> &[Document] {
		match self {
			HookValue::Docs(docs) => docs,
			HookValue::Document(doc) => std::slice::from_ref(doc),
		}
	}
}

pub type ResultCallback = Arc<dyn Fn(&HookValue) + Send + Sync>;

/// Outcome of a registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Registered {
	pub key: LogicalKey,
	/// The current result, if it was already cached
	pub cached: Option<HookValue>,
}

struct ActiveHook {
	registration: Registration,
	on_result: ResultCallback,
	on_error: Option<ErrorCallback>,
}

struct FacadeInner {
	registry: SubscriptionRegistry,
	next_id: AtomicU64,
	hooks: Mutex<HashMap<CallerId, Vec<ActiveHook>>>,
}

/// Per-caller front end of a [`SubscriptionRegistry`].
#[derive(Clone)]
pub struct Facade {
	inner: Arc<FacadeInner>,
}

impl std::fmt::Debug for Facade {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Facade")
			.field("next_id", &self.inner.next_id)
			.field("mounted", &self.inner.hooks.lock().len())
			.finish_non_exhaustive()
	}
}

impl Facade {
	pub fn new(registry: SubscriptionRegistry) -> Self {
		Self {
			inner: Arc::new(FacadeInner {
				registry,
				next_id: AtomicU64::new(0),
				hooks: Mutex::new(HashMap::new()),
			}),
		}
	}

	pub fn registry(&self) -> &SubscriptionRegistry {
		&self.inner.registry
	}

	/// Allocate a caller id for a new consumer. Debug builds label it with
	/// the mounting call site.
	#[track_caller]
	pub fn mount(&self) -> Mount {
		let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
		let id = if cfg!(debug_assertions) {
			let location = Location::caller();
			CallerId::with_label(seq, format!("{}:{}", location.file(), location.line()))
		} else {
			CallerId::new(seq)
		};
		debug!(caller = %id, "Mounted");
		Mount { facade: self.clone(), id, unmounted: false }
	}

	/// Register `caller` for `want`.
	pub fn register(
		&self,
		caller: &CallerId,
		want: Want,
		on_result: ResultCallback,
		on_error: Option<ErrorCallback>,
	) -> MxResult<Registered> {
		let registry = &self.inner.registry;
		let (cached, registration) = match want {
			Want::Ids { collection, ids } => {
				let reg = registry.register_docs_hook(
					caller.clone(),
					&collection,
					&ids,
					docs_callback(&on_result),
					on_error.clone(),
				)?;
				(reg.cached.map(HookValue::Docs), reg.registration)
			}
			Want::Document { path } => {
				let reg = registry.register_doc_hook(
					caller.clone(),
					&path,
					doc_callback(&on_result),
					on_error.clone(),
				)?;
				(reg.cached.map(HookValue::Document), reg.registration)
			}
			Want::Query(query) => {
				let reg = registry.register_query_hook(
					caller.clone(),
					&query,
					docs_callback(&on_result),
					on_error.clone(),
				)?;
				(reg.cached.map(HookValue::Docs), reg.registration)
			}
		};

		let key = registration.key().clone();
		self.inner
			.hooks
			.lock()
			.entry(caller.clone())
			.or_default()
			.push(ActiveHook { registration, on_result, on_error });
		Ok(Registered { key, cached })
	}

	/// Change what `caller` wants under `key`, keeping its caller id.
	///
	/// A new id set on the same collection is handed to the listener in
	/// place; anything else registers under the new key first and then
	/// leaves the old one, so a failed update keeps the old registration.
	/// A cached result of the new registration is delivered through the
	/// result callback before this returns.
	pub fn update_want(&self, key: &LogicalKey, caller: &CallerId, want: Want) -> MxResult<Registered> {
		let key = &key.normalized();
		let new_key = want.key()?;
		let (on_result, on_error) = self.callbacks(key, caller)?;

		if &new_key == key {
			if let Want::Ids { collection, ids } = &want {
				self.inner.registry.update_doc_ids(collection, caller, ids)?;
			}
			return Ok(Registered { key: new_key, cached: None });
		}

		let registered = self.register(caller, want, Arc::clone(&on_result), on_error)?;
		let old = self.take_hook(key, caller)?;
		old.registration.unregister()?;
		if let Some(cached) = &registered.cached {
			on_result(cached);
		}
		debug!(caller = %caller, from = %key, to = %registered.key, "Want changed");
		Ok(registered)
	}

	/// Unregister `caller` from `key`. Fails with
	/// [`Error::AlreadyUnregistered`] when called twice.
	pub fn unregister(&self, key: &LogicalKey, caller: &CallerId) -> MxResult<()> {
		let key = &key.normalized();
		match self.take_hook(key, caller) {
			Ok(hook) => hook.registration.unregister(),
			Err(Error::UnknownCaller) if self.inner.registry.was_unregistered(key, caller) => {
				Err(Error::AlreadyUnregistered(caller.clone()))
			}
			Err(err) => Err(err),
		}
	}

	/// Unregister `caller` from every key. Returns how many registrations
	/// were removed.
	pub fn unregister_all(&self, caller: &CallerId) -> usize {
		let hooks = self.inner.hooks.lock().remove(caller).unwrap_or_default();
		let count = hooks.len();
		for hook in hooks {
			if let Err(err) = hook.registration.unregister() {
				warn!(caller = %caller, key = %hook.registration.key(), error = %err, "Unregister failed");
			}
		}
		self.inner.registry.forget_caller(caller);
		count
	}

	/// Keys `caller` is registered on.
	pub fn keys_of(&self, caller: &CallerId) -> Vec<LogicalKey> {
		self.inner
			.hooks
			.lock()
			.get(caller)
			.map(|hooks| hooks.iter().map(|h| h.registration.key().clone()).collect())
			.unwrap_or_default()
	}

	fn callbacks(
		&self,
		key: &LogicalKey,
		caller: &CallerId,
	) -> MxResult<(ResultCallback, Option<ErrorCallback>)> {
		let hooks = self.inner.hooks.lock();
		hooks
			.get(caller)
			.and_then(|hooks| hooks.iter().find(|h| h.registration.key() == key))
			.map(|h| (Arc::clone(&h.on_result), h.on_error.clone()))
			.ok_or(Error::UnknownCaller)
	}

	fn take_hook(&self, key: &LogicalKey, caller: &CallerId) -> MxResult<ActiveHook> {
		let mut hooks = self.inner.hooks.lock();
		let list = hooks.get_mut(caller).ok_or(Error::UnknownCaller)?;
		let pos = list.iter().position(|h| h.registration.key() == key).ok_or(Error::UnknownCaller)?;
		let hook = list.remove(pos);
		if list.is_empty() {
			hooks.remove(caller);
		}
		Ok(hook)
	}
}

fn docs_callback(on_result: &ResultCallback) -> DocsCallback {
	let on_result = Arc::clone(on_result);
	Arc::new(move |docs: &[Document]| on_result(&HookValue::Docs(docs.to_vec())))
}

fn doc_callback(on_result: &ResultCallback) -> DocCallback {
	let on_result = Arc::clone(on_result);
	Arc::new(move |doc: &Document| on_result(&HookValue::Document(doc.clone())))
}

/// One mounted consumer. Dropping it unregisters everything it registered.
pub struct Mount {
	facade: Facade,
	id: CallerId,
	unmounted: bool,
}

impl std::fmt::Debug for Mount {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Mount").field("id", &self.id).field("unmounted", &self.unmounted).finish()
	}
}

impl Mount {
	pub fn id(&self) -> &CallerId {
		&self.id
	}

	pub fn register(
		&self,
		want: Want,
		on_result: ResultCallback,
		on_error: Option<ErrorCallback>,
	) -> MxResult<Registered> {
		self.facade.register(&self.id, want, on_result, on_error)
	}

	pub fn use_docs<S: AsRef<str>>(
		&self,
		collection: &str,
		ids: &[S],
		on_result: ResultCallback,
		on_error: Option<ErrorCallback>,
	) -> MxResult<Registered> {
		self.register(Want::ids(collection, ids), on_result, on_error)
	}

	pub fn use_doc(
		&self,
		path: &str,
		on_result: ResultCallback,
		on_error: Option<ErrorCallback>,
	) -> MxResult<Registered> {
		self.register(Want::document(path), on_result, on_error)
	}

	pub fn use_query(
		&self,
		query: QueryDescriptor,
		on_result: ResultCallback,
		on_error: Option<ErrorCallback>,
	) -> MxResult<Registered> {
		self.register(Want::Query(query), on_result, on_error)
	}

	pub fn update(&self, key: &LogicalKey, want: Want) -> MxResult<Registered> {
		self.facade.update_want(key, &self.id, want)
	}

	pub fn unregister(&self, key: &LogicalKey) -> MxResult<()> {
		self.facade.unregister(key, &self.id)
	}

	pub fn keys(&self) -> Vec<LogicalKey> {
		self.facade.keys_of(&self.id)
	}

	/// Unregister everything. Later calls are no-ops.
	pub fn unmount(&mut self) {
		if std::mem::replace(&mut self.unmounted, true) {
			return;
		}
		let count = self.facade.unregister_all(&self.id);
		debug!(caller = %self.id, registrations = count, "Unmounted");
	}
}

impl Drop for Mount {
	fn drop(&mut self) {
		self.unmount();
	}
}

// vim: ts=4
