//! Collection-by-ids records
//!
//! One record per collection key: a chunked listener, the callers sharing
//! it, and the merged document cache all callers read from.

use docmux_types::store_adapter::QuerySnapshot;
use docmux_types::utils::doc_path;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::cache::DocCache;
use crate::chunked::{ChunkEvent, ChunkedIdListener, ListenerState};
use crate::deliver::{Deliveries, DocsCallback, ErrorCallback};
use crate::prelude::*;

pub(crate) struct DocsCaller {
	pub id: CallerId,
	pub ids: Vec<Box<str>>,
	pub on_docs: DocsCallback,
	pub on_error: Option<ErrorCallback>,
	pub active: Arc<AtomicBool>,
	/// Received at least one result
	pub delivered: bool,
	/// Missing ids already reported as not found
	pub reported: HashSet<Box<str>>,
}

pub(crate) struct CollectionRecord {
	/// Distinguishes this record from earlier ones under the same key
	pub generation: u64,
	pub listener: ChunkedIdListener,
	pub callers: Vec<DocsCaller>,
	pub cache: DocCache,
}

impl CollectionRecord {
	pub fn new(generation: u64, listener: ChunkedIdListener) -> Self {
		Self { generation, listener, callers: Vec::new(), cache: DocCache::new() }
	}

	pub fn collection(&self) -> &str {
		self.listener.collection()
	}

	pub fn is_waiting(&self) -> bool {
		self.listener.state() == ListenerState::Waiting
	}

	pub fn remove_caller(&mut self, id: &CallerId) -> Option<DocsCaller> {
		let pos = self.callers.iter().position(|c| &c.id == id)?;
		Some(self.callers.remove(pos))
	}

	/// Apply a chunk event and work out who needs to hear about it.
	pub fn on_chunk_event(&mut self, event: ChunkEvent) -> Deliveries {
		let mut out = Deliveries::new();
		if !self.listener.is_current(event.chunk, event.seq) {
			debug!(collection = %self.collection(), chunk = event.chunk, "Dropping stale chunk event");
			return out;
		}

		let snapshot = match event.result {
			Ok(snapshot) => snapshot,
			Err(err) => {
				warn!(collection = %self.collection(), chunk = event.chunk, error = %err, "Chunk subscription failed");
				let chunk_ids = self.listener.chunk_ids(event.chunk);
				for caller in &self.callers {
					if caller.ids.iter().any(|id| chunk_ids.contains(id)) {
						out.error(&caller.active, caller.on_error.as_ref(), &caller.id, err.clone());
					}
				}
				return out;
			}
		};

		let first = self.listener.mark_loaded(event.chunk);
		let touched = self.apply_snapshot(event.chunk, &snapshot, first);
		self.notify(&touched, &mut out);
		out
	}

	/// Merge a chunk snapshot into the cache. Returns the ids whose cached
	/// state changed.
	fn apply_snapshot(
		&mut self,
		chunk: usize,
		snapshot: &QuerySnapshot,
		first: bool,
	) -> HashSet<Box<str>> {
		let mut touched = HashSet::new();
		for change in &snapshot.changes {
			self.cache.apply(change);
			touched.insert(change.doc.id.clone());
		}

		// A (re)subscribed chunk only reports what exists now; anything
		// cached for its ids but absent from the result is gone.
		if first {
			let present = snapshot.docs.iter().map(|d| &*d.id).collect::<HashSet<_>>();
			let stale = self
				.listener
				.chunk_ids(chunk)
				.iter()
				.filter(|id| {
					let id: &str = id;
					!present.contains(id) && self.cache.contains(id)
				})
				.cloned()
				.collect::<Vec<_>>();
			for id in stale {
				self.cache.remove(&id);
				touched.insert(id);
			}
		}
		touched
	}

	/// Queue results for callers whose documents are all cached and either
	/// changed or were never delivered; once the listener is fully loaded,
	/// queue not-found errors for ids that are still missing.
	pub fn notify(&mut self, touched: &HashSet<Box<str>>, out: &mut Deliveries) {
		let loaded = self.listener.is_loaded();
		let collection = self.listener.collection().to_string();

		for caller in &mut self.callers {
			let affected = !caller.delivered || caller.ids.iter().any(|id| touched.contains(id));
			if let Some(docs) = self.cache.collect(&caller.ids) {
				caller.reported.clear();
				if affected {
					caller.delivered = true;
					out.docs(&caller.active, &caller.on_docs, docs);
				}
				continue;
			}

			caller.reported.retain(|id| !self.cache.contains(id));
			if !loaded {
				continue;
			}
			let missing = self
				.cache
				.missing(&caller.ids)
				.filter(|id| !caller.reported.contains(*id))
				.map(Box::<str>::from)
				.collect::<Vec<_>>();
			for id in missing {
				let err = Error::NotFound(doc_path(&collection, &id).into());
				out.error(&caller.active, caller.on_error.as_ref(), &caller.id, err);
				caller.reported.insert(id);
			}
		}
	}
}

// vim: ts=4
