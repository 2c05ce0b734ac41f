//! Event coalescing
//!
//! Raw notifications arrive from arbitrary watch callback threads and are
//! merged per folder into a pending batch keyed by the affected path, so
//! repeated events on the same file collapse to its latest kind. Editors
//! and copy tools emit bursts of modify events per file; without this the
//! consumer would re-render on every burst member instead of once per
//! quiet period.

use std::{
	collections::{HashMap, VecDeque},
	sync::Arc,
	time::Instant,
};

use parking_lot::Mutex;

use crate::path::FolderPath;

use super::{event::ChangeEvent, metrics::WatcherMetrics};

/// Everything recorded for one folder since its last flush.
#[derive(Debug)]
pub struct PendingBatch {
	pub folder: FolderPath,
	/// Latest retained event per changed path.
	pub events: HashMap<std::path::PathBuf, ChangeEvent>,
	pub created_at: Instant,
}

impl PendingBatch {
	fn new(folder: FolderPath) -> Self {
		Self {
			folder,
			events: HashMap::new(),
			created_at: Instant::now(),
		}
	}
}

#[derive(Debug, Default)]
struct Inner {
	batches: HashMap<FolderPath, PendingBatch>,
	/// Folders queued for dispatch, exactly once per live batch.
	queue: VecDeque<FolderPath>,
}

/// Producer-side pending state. `record` is the only entry point reached
/// from watch callbacks and costs one map update under a short lock.
#[derive(Debug)]
pub struct EventCoalescer {
	inner: Mutex<Inner>,
	metrics: Arc<WatcherMetrics>,
}

impl EventCoalescer {
	pub fn new(metrics: Arc<WatcherMetrics>) -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
			metrics,
		}
	}

	/// Merge one raw notification into the folder's pending batch. The last
	/// write wins per changed path: a rapid modify-then-delete collapses to
	/// the delete. The folder is queued for dispatch exactly once, when its
	/// batch comes into existence.
	pub fn record(&self, folder: &FolderPath, event: ChangeEvent) {
		let mut inner = self.inner.lock();
		let Inner { batches, queue } = &mut *inner;

		let newly_created = !batches.contains_key(folder);
		let batch = batches
			.entry(folder.clone())
			.or_insert_with(|| PendingBatch::new(folder.clone()));

		if batch.events.insert(event.path.clone(), event).is_some() {
			self.metrics.record_event_coalesced();
		}
		self.metrics.record_event();

		if newly_created {
			queue.push_back(folder.clone());
		}
	}

	/// Dequeue the oldest pending batch, removing it from the active map
	/// regardless of what the caller does with it.
	pub fn pop_next(&self) -> Option<PendingBatch> {
		let mut inner = self.inner.lock();
		let Inner { batches, queue } = &mut *inner;

		while let Some(folder) = queue.pop_front() {
			if let Some(batch) = batches.remove(&folder) {
				return Some(batch);
			}
		}

		None
	}

	pub fn pending_batches(&self) -> usize {
		self.inner.lock().batches.len()
	}

	/// Drop all pending state.
	pub fn clear(&self) {
		let mut inner = self.inner.lock();
		inner.batches.clear();
		inner.queue.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::watcher::event::ChangeKind;
	use pretty_assertions::assert_eq;
	use std::{path::PathBuf, sync::atomic::Ordering};

	fn coalescer() -> EventCoalescer {
		EventCoalescer::new(Arc::new(WatcherMetrics::new()))
	}

	fn event(path: &str, kind: ChangeKind) -> ChangeEvent {
		ChangeEvent::new(PathBuf::from(path), kind)
	}

	#[test]
	fn burst_on_one_path_collapses_to_latest_kind() {
		let c = coalescer();
		let folder = FolderPath::new("/photos");

		for _ in 0..50 {
			c.record(&folder, event("/photos/img.jpg", ChangeKind::Changed));
		}

		let batch = c.pop_next().expect("one batch pending");
		assert_eq!(batch.events.len(), 1);
		assert_eq!(
			batch.events[&PathBuf::from("/photos/img.jpg")].kind,
			ChangeKind::Changed
		);
		assert_eq!(c.metrics.events_coalesced.load(Ordering::Relaxed), 49);
	}

	#[test]
	fn modify_then_delete_keeps_the_delete() {
		let c = coalescer();
		let folder = FolderPath::new("/photos");

		c.record(&folder, event("/photos/img.jpg", ChangeKind::Changed));
		c.record(&folder, event("/photos/img.jpg", ChangeKind::Deleted));

		let batch = c.pop_next().unwrap();
		assert_eq!(
			batch.events[&PathBuf::from("/photos/img.jpg")].kind,
			ChangeKind::Deleted
		);
	}

	#[test]
	fn batch_is_queued_exactly_once() {
		let c = coalescer();
		let folder = FolderPath::new("/photos");

		c.record(&folder, event("/photos/a.jpg", ChangeKind::Created));
		c.record(&folder, event("/photos/b.jpg", ChangeKind::Created));

		let batch = c.pop_next().unwrap();
		assert_eq!(batch.events.len(), 2);
		assert!(c.pop_next().is_none());
	}

	#[test]
	fn folders_flush_in_enqueue_order() {
		let c = coalescer();
		let first = FolderPath::new("/photos/a");
		let second = FolderPath::new("/photos/b");

		c.record(&first, event("/photos/a/1.jpg", ChangeKind::Created));
		c.record(&second, event("/photos/b/2.jpg", ChangeKind::Created));
		// More events on an already-queued folder must not reorder it
		c.record(&first, event("/photos/a/3.jpg", ChangeKind::Created));

		assert_eq!(c.pop_next().unwrap().folder, first);
		assert_eq!(c.pop_next().unwrap().folder, second);
		assert!(c.pop_next().is_none());
	}

	#[test]
	fn requeue_after_pop_starts_a_fresh_batch() {
		let c = coalescer();
		let folder = FolderPath::new("/photos");

		c.record(&folder, event("/photos/a.jpg", ChangeKind::Created));
		let first = c.pop_next().unwrap();
		assert_eq!(first.events.len(), 1);

		c.record(&folder, event("/photos/b.jpg", ChangeKind::Created));
		let second = c.pop_next().unwrap();
		assert_eq!(second.events.len(), 1);
		assert!(second.events.contains_key(&PathBuf::from("/photos/b.jpg")));
	}
}
