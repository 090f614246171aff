//! Shared test helpers
//!
//! A registry over a seeded memory store, and recorders that collect what
//! callbacks receive.

#![allow(dead_code)]

use docmux::types::prelude::*;
use docmux::{
	DocCallback, DocsCallback, ErrorCallback, HookValue, RegistryConfig, ResultCallback,
	SubscriptionRegistry,
};
use docmux_store_adapter_memory::MemoryStore;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

pub fn setup() -> (MemoryStore, SubscriptionRegistry) {
	setup_with(RegistryConfig::default())
}

pub fn setup_with(config: RegistryConfig) -> (MemoryStore, SubscriptionRegistry) {
	init_tracing();
	let store = MemoryStore::default();
	let registry = SubscriptionRegistry::with_config(Arc::new(store.clone()), config);
	(store, registry)
}

/// Seed `collection` with documents `{"name": <id>}`.
pub fn seed(store: &MemoryStore, collection: &str, ids: &[&str]) {
	for id in ids {
		store.set(&format!("{}/{}", collection, id), json!({ "name": id }));
	}
}

/// Let spawned tasks run until nothing is ready, moving the paused clock
/// forward by a millisecond at most.
pub async fn settle() {
	tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn advance(ms: u64) {
	tokio::time::sleep(Duration::from_millis(ms)).await;
}

pub fn caller(seq: u64) -> CallerId {
	CallerId::new(seq)
}

/// Collects every result and error delivered to one caller.
#[derive(Default)]
pub struct Recorder {
	results: Mutex<Vec<Vec<Document>>>,
	errors: Mutex<Vec<Error>>,
}

impl Recorder {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn on_docs(self: &Arc<Self>) -> DocsCallback {
		let this = Arc::clone(self);
		Arc::new(move |docs: &[Document]| this.results.lock().push(docs.to_vec()))
	}

	pub fn on_doc(self: &Arc<Self>) -> DocCallback {
		let this = Arc::clone(self);
		Arc::new(move |doc: &Document| this.results.lock().push(vec![doc.clone()]))
	}

	pub fn on_result(self: &Arc<Self>) -> ResultCallback {
		let this = Arc::clone(self);
		Arc::new(move |value: &HookValue| this.results.lock().push(value.docs().to_vec()))
	}

	pub fn on_error(self: &Arc<Self>) -> Option<ErrorCallback> {
		let this = Arc::clone(self);
		Some(Arc::new(move |err: &Error| this.errors.lock().push(err.clone())))
	}

	pub fn result_count(&self) -> usize {
		self.results.lock().len()
	}

	pub fn errors(&self) -> Vec<Error> {
		self.errors.lock().clone()
	}

	/// Ids of the latest result.
	pub fn last_ids(&self) -> Option<Vec<String>> {
		self.results.lock().last().map(|docs| docs.iter().map(|d| d.id.to_string()).collect())
	}

	/// A field of the first document of the latest result.
	pub fn last_field(&self, field: &str) -> Option<Value> {
		self.results.lock().last().and_then(|docs| docs.first()).and_then(|d| d.get(field).cloned())
	}
}

// vim: ts=4
