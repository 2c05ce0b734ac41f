//! Counters for the watch pipeline

use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline counters, shared across the coalescer, dispatch loop, and
/// registry. Relaxed ordering throughout; these inform diagnostics, not
/// control flow.
#[derive(Debug, Default)]
pub struct WatcherMetrics {
	/// Raw events accepted into a pending batch.
	pub events_recorded: AtomicU64,
	/// Events that overwrote an earlier event for the same path.
	pub events_coalesced: AtomicU64,
	/// Events actually handed to the consumer.
	pub events_delivered: AtomicU64,
	/// Batches delivered (fully or capped).
	pub batches_dispatched: AtomicU64,
	/// Batches dropped whole: oversized, folder gone, or re-queued mid-cycle.
	pub batches_discarded: AtomicU64,
	/// Watch handles torn down and recreated by the error state machine.
	pub watch_resets: AtomicU64,
}

impl WatcherMetrics {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_event(&self) {
		self.events_recorded.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_event_coalesced(&self) {
		self.events_coalesced.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_events_delivered(&self, count: u64) {
		self.events_delivered.fetch_add(count, Ordering::Relaxed);
	}

	pub fn record_batch_dispatched(&self) {
		self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_batch_discarded(&self) {
		self.batches_discarded.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_watch_reset(&self) {
		self.watch_resets.fetch_add(1, Ordering::Relaxed);
	}
}
