//! Deferred callback delivery
//!
//! Registry state is mutated under its lock, but caller callbacks run only
//! after the lock is released: a callback may call back into the registry.
//! Each delivery re-checks the caller's `active` flag right before running,
//! so a caller unregistered in between never sees a late callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::prelude::*;

pub type DocsCallback = Arc<dyn Fn(&[Document]) + Send + Sync>;
pub type DocCallback = Arc<dyn Fn(&Document) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

type Delivery = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub(crate) struct Deliveries {
	queue: Vec<Delivery>,
}

impl Deliveries {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.queue.len()
	}

	fn push(&mut self, active: &Arc<AtomicBool>, deliver: impl FnOnce() + Send + 'static) {
		let active = Arc::clone(active);
		self.queue.push(Box::new(move || {
			if active.load(Ordering::Acquire) {
				deliver();
			}
		}));
	}

	pub fn docs(&mut self, active: &Arc<AtomicBool>, on_docs: &DocsCallback, docs: Vec<Document>) {
		let on_docs = Arc::clone(on_docs);
		self.push(active, move || on_docs(docs.as_slice()));
	}

	pub fn doc(&mut self, active: &Arc<AtomicBool>, on_doc: &DocCallback, doc: Document) {
		let on_doc = Arc::clone(on_doc);
		self.push(active, move || on_doc(&doc));
	}

	/// Queue an error for a caller, or log it if the caller has no error channel.
	pub fn error(
		&mut self,
		active: &Arc<AtomicBool>,
		on_error: Option<&ErrorCallback>,
		caller: &CallerId,
		err: Error,
	) {
		match on_error {
			Some(on_error) => {
				let on_error = Arc::clone(on_error);
				self.push(active, move || on_error(&err));
			}
			None => warn!(caller = %caller, error = %err, "Unhandled subscription error"),
		}
	}

	pub fn append(&mut self, mut other: Deliveries) {
		self.queue.append(&mut other.queue);
	}

	/// Run every queued delivery, in queue order. Must be called without
	/// holding the registry lock.
	pub fn run(self) {
		for delivery in self.queue {
			delivery();
		}
	}
}

// vim: ts=4
