//! Owned subscriptions
//!
//! Document and query keys are served by a single store subscription owned
//! by one caller; everybody else listens. The record outlives its owner by
//! the grace period so a consumer re-mounting right away takes it over.

use docmux_types::patch::apply_patch;
use docmux_types::store_adapter::DocumentSnapshot;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::AbortHandle;

use crate::deliver::{Deliveries, DocCallback, DocsCallback, ErrorCallback};
use crate::ownership::{Ownership, Settle};
use crate::prelude::*;

/// Value kept by an owned subscription, and how it reaches callers.
pub(crate) trait SharedValue: Clone + Send + 'static {
	type Callback: Clone + Send + Sync;

	fn deliver(out: &mut Deliveries, active: &Arc<AtomicBool>, callback: &Self::Callback, value: Self);

	/// Apply a field patch to the document at `path`, if this value holds it.
	fn patch(&mut self, path: &str, patch: &Value) -> MxResult<bool>;
}

impl SharedValue for Document {
	type Callback = DocCallback;

	fn deliver(out: &mut Deliveries, active: &Arc<AtomicBool>, callback: &DocCallback, value: Self) {
		out.doc(active, callback, value);
	}

	fn patch(&mut self, path: &str, patch: &Value) -> MxResult<bool> {
		if &*self.path != path {
			return Ok(false);
		}
		apply_patch(&mut self.data, patch)?;
		Ok(true)
	}
}

impl SharedValue for Vec<Document> {
	type Callback = DocsCallback;

	fn deliver(out: &mut Deliveries, active: &Arc<AtomicBool>, callback: &DocsCallback, value: Self) {
		out.docs(active, callback, value);
	}

	fn patch(&mut self, path: &str, patch: &Value) -> MxResult<bool> {
		let mut patched = false;
		for doc in self.iter_mut().filter(|doc| &*doc.path == path) {
			apply_patch(&mut doc.data, patch)?;
			patched = true;
		}
		Ok(patched)
	}
}

pub(crate) struct SharedCaller<V: SharedValue> {
	pub id: CallerId,
	pub on_value: V::Callback,
	pub on_error: Option<ErrorCallback>,
	pub active: Arc<AtomicBool>,
	/// Already told the document does not exist
	pub reported: bool,
}

pub(crate) struct SharedRecord<V: SharedValue> {
	pub key: LogicalKey,
	pub generation: u64,
	pub ownership: Ownership,
	pub callers: Vec<SharedCaller<V>>,
	pub value: Option<V>,
	/// Document subscriptions only: the document existed at some point
	pub existed: bool,
	/// Document subscriptions only: the store answered and it does not exist
	pub missing: bool,
	task: Option<AbortHandle>,
}

impl<V: SharedValue> SharedRecord<V> {
	pub fn new(key: LogicalKey, generation: u64, task: AbortHandle) -> Self {
		Self {
			key,
			generation,
			ownership: Ownership::Unowned,
			callers: Vec::new(),
			value: None,
			existed: false,
			missing: false,
			task: Some(task),
		}
	}

	pub fn contains(&self, id: &CallerId) -> bool {
		self.callers.iter().any(|c| &c.id == id)
	}

	/// Add a caller. Returns true if it became the owner.
	pub fn join(&mut self, caller: SharedCaller<V>) -> bool {
		let handed_off = self.ownership.is_pending();
		let owner = self.ownership.claim(&caller.id);
		if handed_off {
			debug!(key = %self.key, caller = %caller.id, "Pending subscription taken over");
		}
		self.callers.push(caller);
		owner
	}

	pub fn remove_caller(&mut self, id: &CallerId) -> Option<SharedCaller<V>> {
		let pos = self.callers.iter().position(|c| &c.id == id)?;
		Some(self.callers.remove(pos))
	}

	/// Deliver a new value to every caller.
	pub fn publish(&mut self, value: V) -> Deliveries {
		let mut out = Deliveries::new();
		for caller in &mut self.callers {
			caller.reported = false;
			V::deliver(&mut out, &caller.active, &caller.on_value, value.clone());
		}
		self.value = Some(value);
		out
	}

	/// Pass a store error to every caller.
	pub fn fail(&self, err: &Error) -> Deliveries {
		let mut out = Deliveries::new();
		for caller in &self.callers {
			out.error(&caller.active, caller.on_error.as_ref(), &caller.id, err.clone());
		}
		out
	}

	/// Optimistically patch the cached value and re-deliver it.
	pub fn overlay(&mut self, path: &str, patch: &Value) -> MxResult<Deliveries> {
		let Some(mut value) = self.value.take() else {
			return Ok(Deliveries::new());
		};
		let result = value.patch(path, patch);
		match result {
			Ok(true) => Ok(self.publish(value)),
			Ok(false) => {
				self.value = Some(value);
				Ok(Deliveries::new())
			}
			Err(err) => {
				self.value = Some(value);
				Err(err)
			}
		}
	}

	/// Stop the store subscription.
	pub fn cancel(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

impl SharedRecord<Document> {
	pub fn on_document(&mut self, snapshot: DocumentSnapshot) -> Deliveries {
		let path = snapshot.path.clone();
		if let Some(doc) = snapshot.into_document() {
			self.existed = true;
			self.missing = false;
			return self.publish(doc);
		}

		let mut out = Deliveries::new();
		let err = if self.existed {
			warn!(path = %path, "Document disappeared from its subscription");
			self.existed = false;
			self.value = None;
			Error::DocumentVanished(path)
		} else {
			Error::NotFound(path)
		};
		self.missing = true;
		for caller in self.callers.iter_mut().filter(|c| !c.reported) {
			caller.reported = true;
			out.error(&caller.active, caller.on_error.as_ref(), &caller.id, err.clone());
		}
		out
	}
}

impl<V: SharedValue> Drop for SharedRecord<V> {
	fn drop(&mut self) {
		self.cancel();
	}
}

/// The owned subscriptions of one key space.
pub(crate) struct SharedRecords<V: SharedValue> {
	records: HashMap<Box<str>, SharedRecord<V>>,
}

impl<V: SharedValue> Default for SharedRecords<V> {
	fn default() -> Self {
		Self { records: HashMap::new() }
	}
}

impl<V: SharedValue> SharedRecords<V> {
	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn callers(&self) -> usize {
		self.records.values().map(|r| r.callers.len()).sum()
	}

	pub fn get(&self, key: &str) -> Option<&SharedRecord<V>> {
		self.records.get(key)
	}

	pub fn get_mut(&mut self, key: &str) -> Option<&mut SharedRecord<V>> {
		self.records.get_mut(key)
	}

	pub fn insert(&mut self, key: Box<str>, record: SharedRecord<V>) -> &mut SharedRecord<V> {
		self.records.entry(key).insert_entry(record).into_mut()
	}

	pub fn values_mut(&mut self) -> impl Iterator<Item = &mut SharedRecord<V>> {
		self.records.values_mut()
	}

	/// Look up the record for an event of subscription `generation`.
	pub fn current(&mut self, key: &str, generation: u64) -> Option<&mut SharedRecord<V>> {
		self.records.get_mut(key).filter(|r| r.generation == generation)
	}

	/// Remove a caller. Returns the grace epoch to arm a timer for if the
	/// caller was the owner.
	pub fn leave(&mut self, key: &str, caller: &CallerId, epoch: u64) -> MxResult<Option<u64>> {
		let record = self.records.get_mut(key).ok_or(Error::UnknownCaller)?;
		let removed = record.remove_caller(caller).ok_or(Error::UnknownCaller)?;
		removed.active.store(false, Ordering::Release);
		let released = record.ownership.release(caller, epoch);
		if released.is_some() {
			debug!(key = %record.key, caller = %caller, remaining = record.callers.len(), "Owner left, grace period started");
		}
		Ok(released)
	}

	/// The grace timer for `epoch` fired on `key`.
	pub fn settle(&mut self, key: &str, epoch: u64) {
		let Some(record) = self.records.get_mut(key) else {
			return;
		};
		let next = record.callers.first().map(|c| c.id.clone());
		match record.ownership.settle(epoch, next.as_ref()) {
			Settle::Stale => {}
			Settle::Reassigned(owner) => {
				debug!(key = %record.key, owner = %owner, "Ownership reassigned");
			}
			Settle::Relinquish => {
				if let Some(mut record) = self.records.remove(key) {
					record.cancel();
					debug!(key = %record.key, "Subscription released");
				}
			}
		}
	}
}

pub(crate) type ItemStream<T> = Pin<Box<dyn Stream<Item = MxResult<T>> + Send>>;

/// Forward every item of a store stream to `sink` until the stream ends or
/// the returned handle is aborted.
pub(crate) fn forward<T, F>(mut stream: ItemStream<T>, sink: F) -> AbortHandle
where
	T: Send + 'static,
	F: Fn(MxResult<T>) + Send + 'static,
{
	tokio::spawn(async move {
		while let Some(item) = stream.next().await {
			sink(item);
		}
	})
	.abort_handle()
}

// vim: ts=4
