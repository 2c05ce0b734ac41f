//! Batch dispatch
//!
//! A single perpetual background task periodically drains a bounded number
//! of pending batches and delivers each batch's events to the externally
//! supplied consumer, one event at a time, so the consumer never observes
//! two deliveries concurrently.

use std::{collections::HashSet, pin::pin, sync::Arc, time::Duration};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use tokio::{
	spawn,
	task::JoinHandle,
	time::{interval_at, sleep, timeout, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::{config::WatcherConfig, existence::ExistenceCache};

use super::{coalesce::EventCoalescer, event::ChangeConsumer, metrics::WatcherMetrics};

#[derive(Debug)]
pub(super) struct DispatchLoop {
	stop_tx: chan::Sender<()>,
	handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
	grace: Duration,
}

impl DispatchLoop {
	pub(super) fn spawn(
		config: WatcherConfig,
		coalescer: Arc<EventCoalescer>,
		existence: Arc<ExistenceCache>,
		consumer: Arc<dyn ChangeConsumer>,
		metrics: Arc<WatcherMetrics>,
	) -> Self {
		let (stop_tx, stop_rx) = chan::bounded(1);
		let grace = config.shutdown_grace();

		let handle = spawn(
			async move {
				while let Err(e) = spawn(
					run_cycles(
						config.clone(),
						Arc::clone(&coalescer),
						Arc::clone(&existence),
						Arc::clone(&consumer),
						Arc::clone(&metrics),
						stop_rx.clone(),
					)
					.in_current_span(),
				)
				.await
				{
					if e.is_panic() {
						error!(?e, "Dispatch loop panicked;");
					} else {
						trace!("Dispatch loop received shutdown signal and will exit...");
						break;
					}
					trace!("Restarting dispatch loop processing task...");
				}

				info!("Dispatch loop gracefully shutdown");
			}
			.in_current_span(),
		);

		Self {
			stop_tx,
			handle: parking_lot::Mutex::new(Some(handle)),
			grace,
		}
	}

	/// Best-effort stop request without waiting; used from `Drop`.
	pub(super) fn request_stop(&self) {
		let _ = self.stop_tx.try_send(());
	}

	/// Stop the loop and wait up to the grace period for the in-flight
	/// delivery to finish. Safe to call more than once.
	pub(super) async fn stop(&self) {
		self.request_stop();

		let handle = self.handle.lock().take();
		if let Some(mut handle) = handle {
			match timeout(self.grace, &mut handle).await {
				Ok(Ok(())) => {}
				Ok(Err(e)) => error!(?e, "Failed to join dispatch loop task;"),
				Err(_) => {
					warn!("Dispatch loop did not finish within grace period; aborting task");
					handle.abort();
				}
			}
		}
	}
}

async fn run_cycles(
	config: WatcherConfig,
	coalescer: Arc<EventCoalescer>,
	existence: Arc<ExistenceCache>,
	consumer: Arc<dyn ChangeConsumer>,
	metrics: Arc<WatcherMetrics>,
	stop_rx: chan::Receiver<()>,
) {
	enum StreamMessage {
		Tick,
		Stop,
	}

	let quiet_interval = config.quiet_interval();
	let mut tick = interval_at(Instant::now() + quiet_interval, quiet_interval);
	tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

	let mut msg_stream = pin!((
		IntervalStream::new(tick).map(|_| StreamMessage::Tick),
		stop_rx.map(|()| StreamMessage::Stop),
	)
		.merge());

	while let Some(msg) = msg_stream.next().await {
		match msg {
			StreamMessage::Tick => {
				if let Err(e) =
					run_one_cycle(&config, &coalescer, &existence, &consumer, &metrics).await
				{
					error!(?e, "Dispatch cycle failed; backing off before retrying;");
					sleep(config.failure_backoff()).await;
				}
			}

			StreamMessage::Stop => {
				debug!("Stopping dispatch loop");
				break;
			}
		}
	}
}

/// Drain up to the per-cycle batch cap and deliver.
///
/// A folder already processed in this cycle is skipped outright; a batch it
/// re-queued mid-drain is discarded, not replayed. A batch whose folder no
/// longer exists, or which holds more events than the discard threshold
/// (a scan or bulk operation, not discrete edits), is dropped whole rather
/// than flooding the consumer.
pub(crate) async fn run_one_cycle(
	config: &WatcherConfig,
	coalescer: &EventCoalescer,
	existence: &ExistenceCache,
	consumer: &Arc<dyn ChangeConsumer>,
	metrics: &WatcherMetrics,
) -> anyhow::Result<()> {
	let mut processed = HashSet::new();

	for _ in 0..config.max_batches_per_cycle {
		let Some(batch) = coalescer.pop_next() else {
			break;
		};

		if !processed.insert(batch.folder.clone()) {
			trace!(folder = %batch.folder, "Folder re-queued mid-cycle; discarding batch;");
			metrics.record_batch_discarded();
			continue;
		}

		if batch.events.len() > config.discard_threshold {
			warn!(
				folder = %batch.folder,
				events = batch.events.len(),
				"Oversized batch implies a bulk operation; discarding;"
			);
			metrics.record_batch_discarded();
			continue;
		}

		if !existence.directory_exists(&batch.folder, false) {
			debug!(folder = %batch.folder, "Folder vanished before dispatch; discarding batch;");
			metrics.record_batch_discarded();
			continue;
		}

		let folder = batch.folder;
		let mut delivered = 0u64;
		for (_, event) in batch
			.events
			.into_iter()
			.take(config.max_events_per_batch)
		{
			consumer.on_change(&folder, event).await?;
			delivered += 1;
		}

		metrics.record_events_delivered(delivered);
		metrics.record_batch_dispatched();
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		path::FolderPath,
		watcher::event::{ChangeEvent, ChangeKind},
	};
	use async_trait::async_trait;
	use pretty_assertions::assert_eq;
	use std::{
		path::PathBuf,
		sync::atomic::{AtomicBool, Ordering},
	};
	use tempfile::tempdir;

	#[derive(Default)]
	struct Recorder {
		seen: parking_lot::Mutex<Vec<(FolderPath, ChangeEvent)>>,
		in_flight: AtomicBool,
	}

	#[async_trait]
	impl ChangeConsumer for Recorder {
		async fn on_change(&self, folder: &FolderPath, event: ChangeEvent) -> anyhow::Result<()> {
			// Deliveries must never overlap
			assert!(!self.in_flight.swap(true, Ordering::SeqCst));
			tokio::task::yield_now().await;
			self.seen.lock().push((folder.clone(), event));
			self.in_flight.store(false, Ordering::SeqCst);
			Ok(())
		}
	}

	struct Harness {
		config: WatcherConfig,
		coalescer: Arc<EventCoalescer>,
		existence: Arc<ExistenceCache>,
		consumer: Arc<Recorder>,
		consumer_dyn: Arc<dyn ChangeConsumer>,
		metrics: Arc<WatcherMetrics>,
	}

	fn harness() -> Harness {
		let metrics = Arc::new(WatcherMetrics::new());
		let consumer = Arc::new(Recorder::default());
		Harness {
			config: WatcherConfig::default(),
			coalescer: Arc::new(EventCoalescer::new(Arc::clone(&metrics))),
			existence: Arc::new(ExistenceCache::new(Duration::from_secs(5))),
			consumer_dyn: Arc::clone(&consumer) as Arc<dyn ChangeConsumer>,
			consumer,
			metrics,
		}
	}

	async fn run(h: &Harness) {
		run_one_cycle(
			&h.config,
			&h.coalescer,
			&h.existence,
			&h.consumer_dyn,
			&h.metrics,
		)
		.await
		.unwrap();
	}

	fn fill(h: &Harness, folder: &FolderPath, count: usize) {
		for i in 0..count {
			h.coalescer.record(
				folder,
				ChangeEvent::new(
					PathBuf::from(format!("{folder}/img_{i}.jpg")),
					ChangeKind::Changed,
				),
			);
		}
	}

	#[tokio::test]
	async fn oversized_batch_is_discarded_whole() {
		let root = tempdir().unwrap();
		let h = harness();
		let folder = FolderPath::new(root.path());

		fill(&h, &folder, 150);
		run(&h).await;

		assert_eq!(h.consumer.seen.lock().len(), 0);
		assert_eq!(h.metrics.batches_discarded.load(Ordering::Relaxed), 1);
		assert_eq!(h.metrics.batches_dispatched.load(Ordering::Relaxed), 0);
	}

	#[tokio::test]
	async fn delivery_is_capped_per_batch() {
		let root = tempdir().unwrap();
		let h = harness();
		let folder = FolderPath::new(root.path());

		fill(&h, &folder, 30);
		run(&h).await;

		assert_eq!(h.consumer.seen.lock().len(), 20);
		assert_eq!(h.metrics.events_delivered.load(Ordering::Relaxed), 20);
		assert_eq!(h.metrics.batches_dispatched.load(Ordering::Relaxed), 1);
	}

	#[tokio::test]
	async fn vanished_folder_batch_is_discarded() {
		let h = harness();
		let folder = FolderPath::new("/definitely/not/here");

		fill(&h, &folder, 3);
		run(&h).await;

		assert_eq!(h.consumer.seen.lock().len(), 0);
		assert_eq!(h.metrics.batches_discarded.load(Ordering::Relaxed), 1);
	}

	#[tokio::test]
	async fn cycle_drains_bounded_batch_count() {
		let root = tempdir().unwrap();
		let h = harness();

		for i in 0..15 {
			let dir = root.path().join(format!("f{i}"));
			std::fs::create_dir(&dir).unwrap();
			fill(&h, &FolderPath::new(&dir), 1);
		}

		run(&h).await;
		assert_eq!(h.metrics.batches_dispatched.load(Ordering::Relaxed), 10);
		assert_eq!(h.coalescer.pending_batches(), 5);

		run(&h).await;
		assert_eq!(h.metrics.batches_dispatched.load(Ordering::Relaxed), 15);
		assert_eq!(h.coalescer.pending_batches(), 0);
	}
}
