//! Chunked id listener
//!
//! Serves "documents of this collection with these ids" over the store's
//! `__name__ in [...]` filter, whose list length is capped. The id set is
//! split into chunks of at most `chunk_size` ids, each with its own
//! subscription; all chunk streams feed one sink.
//!
//! Chunks are append-only. New ids first fill the most recent chunk (which
//! is resubscribed with the larger list), overflow opens new chunks. Ids
//! are never removed from a running listener, and only count as known once
//! their chunk subscription was opened.

use docmux_types::query::QueryDescriptor;
use docmux_types::store_adapter::{MAX_IN_LIST, QuerySnapshot, StoreAdapter};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::AbortHandle;

use crate::canonical::ids_key;
use crate::prelude::*;

/// A snapshot (or store error) delivered by one chunk subscription.
#[derive(Debug)]
pub struct ChunkEvent {
	pub chunk: usize,
	/// Subscription sequence number; stale once the chunk was resubscribed
	pub seq: u64,
	pub result: MxResult<QuerySnapshot>,
}

pub type ChunkSink = Arc<dyn Fn(ChunkEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
	/// Collecting ids, nothing subscribed yet
	Waiting,
	Started,
	/// Terminal
	Stopped,
}

#[derive(Debug)]
struct Chunk {
	ids: Vec<Box<str>>,
	loaded: bool,
	seq: u64,
	task: Option<AbortHandle>,
}

pub struct ChunkedIdListener {
	store: Arc<dyn StoreAdapter>,
	collection: Box<str>,
	chunk_size: usize,
	state: ListenerState,
	/// Ids recorded while waiting, in arrival order
	pending: Vec<Box<str>>,
	known: HashSet<Box<str>>,
	chunks: Vec<Chunk>,
	next_seq: u64,
	sink: ChunkSink,
}

impl std::fmt::Debug for ChunkedIdListener {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChunkedIdListener")
			.field("collection", &self.collection)
			.field("state", &self.state)
			.field("pending", &self.pending.len())
			.field("chunks", &self.chunks)
			.finish_non_exhaustive()
	}
}

impl ChunkedIdListener {
	/// `chunk_size` is capped at the store's `in` list ceiling.
	pub fn new<S: AsRef<str>>(
		store: Arc<dyn StoreAdapter>,
		collection: &str,
		ids: &[S],
		chunk_size: usize,
		sink: ChunkSink,
	) -> Self {
		let mut listener = Self {
			store,
			collection: collection.into(),
			chunk_size: chunk_size.clamp(1, MAX_IN_LIST),
			state: ListenerState::Waiting,
			pending: Vec::new(),
			known: HashSet::new(),
			chunks: Vec::new(),
			next_seq: 0,
			sink,
		};
		let fresh = listener.fresh(ids);
		listener.known.extend(fresh.iter().cloned());
		listener.pending = fresh;
		listener
	}

	pub fn collection(&self) -> &str {
		&self.collection
	}

	pub fn state(&self) -> ListenerState {
		self.state
	}

	/// True once every chunk delivered at least one snapshot.
	pub fn is_loaded(&self) -> bool {
		self.state == ListenerState::Started && self.chunks.iter().all(|c| c.loaded)
	}

	pub fn contains(&self, id: &str) -> bool {
		self.known.contains(id)
	}

	/// Current chunk layout.
	pub fn chunks(&self) -> impl Iterator<Item = &[Box<str>]> {
		self.chunks.iter().map(|c| c.ids.as_slice())
	}

	pub fn chunk_ids(&self, chunk: usize) -> &[Box<str>] {
		self.chunks.get(chunk).map(|c| c.ids.as_slice()).unwrap_or_default()
	}

	/// Open one subscription per chunk of the ids recorded so far.
	pub fn start(&mut self) -> MxResult<()> {
		match self.state {
			ListenerState::Stopped => return Err(Error::ListenerShutDown(self.collection.clone())),
			ListenerState::Started => return Ok(()),
			ListenerState::Waiting => {}
		}
		self.state = ListenerState::Started;

		let pending = std::mem::take(&mut self.pending);
		debug!(
			collection = %self.collection,
			ids = pending.len(),
			chunks = pending.len().div_ceil(self.chunk_size),
			"Starting chunked listener"
		);

		let mut opened = 0;
		for ids in pending.chunks(self.chunk_size) {
			if let Err(err) = self.open_chunk(self.chunks.len(), ids.to_vec()) {
				for id in &pending[opened..] {
					self.known.remove(id);
				}
				return Err(err);
			}
			opened += ids.len();
		}
		Ok(())
	}

	/// Add ids to the listener. Returns the ids that were not known before.
	///
	/// While waiting the ids are only recorded; once started they are
	/// packed into the last chunk and, on overflow, into new chunks. If a
	/// subscription cannot be opened the ids it would have carried stay
	/// unknown and the chunk keeps its previous subscription.
	pub fn add_ids<S: AsRef<str>>(&mut self, ids: &[S]) -> MxResult<Vec<Box<str>>> {
		if self.state == ListenerState::Stopped {
			return Err(Error::ListenerShutDown(self.collection.clone()));
		}
		let new_ids = self.fresh(ids);
		if self.state == ListenerState::Waiting {
			self.known.extend(new_ids.iter().cloned());
			self.pending.extend(new_ids.iter().cloned());
			return Ok(new_ids);
		}

		let mut rest = new_ids.as_slice();

		if let Some(last) = self.chunks.len().checked_sub(1) {
			let room = self.chunk_size.saturating_sub(self.chunks[last].ids.len());
			let take = room.min(rest.len());
			if take > 0 {
				let mut grown = self.chunks[last].ids.clone();
				grown.extend_from_slice(&rest[..take]);
				self.open_chunk(last, grown)?;
				self.known.extend(rest[..take].iter().cloned());
				rest = &rest[take..];
			}
		}

		for ids in rest.chunks(self.chunk_size) {
			self.open_chunk(self.chunks.len(), ids.to_vec())?;
			self.known.extend(ids.iter().cloned());
		}

		Ok(new_ids)
	}

	/// Whether an event comes from the live subscription of its chunk.
	pub fn is_current(&self, chunk: usize, seq: u64) -> bool {
		self.state == ListenerState::Started
			&& self.chunks.get(chunk).is_some_and(|c| c.seq == seq && c.task.is_some())
	}

	/// Mark a chunk as answered. Returns true if this was its first snapshot.
	pub fn mark_loaded(&mut self, chunk: usize) -> bool {
		match self.chunks.get_mut(chunk) {
			Some(c) => !std::mem::replace(&mut c.loaded, true),
			None => false,
		}
	}

	/// Cancel every chunk subscription. Idempotent.
	pub fn shut_down(&mut self) {
		if self.state == ListenerState::Stopped {
			return;
		}
		let mut cancelled = 0;
		for chunk in &mut self.chunks {
			if let Some(task) = chunk.task.take() {
				task.abort();
				cancelled += 1;
			}
		}
		self.state = ListenerState::Stopped;
		debug!(collection = %self.collection, chunks = cancelled, "Chunked listener shut down");
	}

	/// Ids not known yet, first occurrence only.
	fn fresh<S: AsRef<str>>(&self, ids: &[S]) -> Vec<Box<str>> {
		let mut seen = HashSet::new();
		ids.iter()
			.map(|id| id.as_ref())
			.filter(|id| !self.known.contains(*id) && seen.insert(*id))
			.map(Box::<str>::from)
			.collect()
	}

	/// Open a subscription for chunk `index` carrying `ids`, replacing the
	/// chunk's previous subscription. `index == chunks.len()` appends a new
	/// chunk. Nothing changes if the store refuses the subscription.
	fn open_chunk(&mut self, index: usize, ids: Vec<Box<str>>) -> MxResult<()> {
		let query = QueryDescriptor::by_ids(&*self.collection, &ids);
		let mut stream = self.store.subscribe_query(&query)?;

		let seq = self.next_seq;
		self.next_seq += 1;
		debug!(
			key = %ids_key(&self.collection, &ids),
			chunk = index,
			ids = ids.len(),
			resubscribe = index < self.chunks.len(),
			"Chunk subscribed"
		);

		let sink = Arc::clone(&self.sink);
		let handle = tokio::spawn(async move {
			while let Some(result) = stream.next().await {
				sink(ChunkEvent { chunk: index, seq, result });
			}
		});
		let chunk = Chunk { ids, loaded: false, seq, task: Some(handle.abort_handle()) };
		match self.chunks.get_mut(index) {
			Some(old) => {
				if let Some(task) = old.task.take() {
					task.abort();
				}
				*old = chunk;
			}
			None => self.chunks.push(chunk),
		}
		Ok(())
	}
}

impl Drop for ChunkedIdListener {
	fn drop(&mut self) {
		self.shut_down();
	}
}


// vim: ts=4
