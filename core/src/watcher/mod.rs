//! Folder watching
//!
//! Owns the set of active directory watches (one per folder, bounded),
//! detects and repairs failing watches, and feeds raw change notifications
//! into the coalescing pipeline. Watch callbacks fire on arbitrary threads
//! owned by the OS watch backend; everything they touch is either the
//! coalescer's short lock or an unbounded error channel drained by a
//! supervisor task, so a slow consumer can never stall watch registration.

pub mod coalesce;
mod dispatch;
pub mod event;
pub mod metrics;

pub use coalesce::{EventCoalescer, PendingBatch};
pub use event::{ChangeConsumer, ChangeEvent, ChangeKind};
pub use metrics::WatcherMetrics;

use std::{
	collections::{hash_map::Entry, HashMap, HashSet},
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use async_channel as chan;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{spawn, task::JoinHandle};
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use crate::{config::WatcherConfig, existence::ExistenceCache, path::FolderPath};

use dispatch::DispatchLoop;

#[derive(Error, Debug)]
pub enum WatcherError {
	#[error("Watch subsystem error: (error: {0})")]
	Notify(#[from] notify::Error),
}

/// Live subscription to OS-level change notifications for one folder.
///
/// At most one handle exists per normalized folder path at any time.
#[derive(Debug)]
struct WatchHandle {
	watcher: RecommendedWatcher,
	error_count: u32,
	last_reset: Instant,
}

impl WatchHandle {
	fn new(watcher: RecommendedWatcher) -> Self {
		Self {
			watcher,
			error_count: 0,
			last_reset: Instant::now(),
		}
	}
}

/// When to tear down and recreate a failing watch handle.
///
/// The threshold prevents silent permanent failure, the cooldown prevents a
/// reset storm; a handle always eventually retries while its folder exists.
#[derive(Debug, Clone, Copy)]
struct ResetPolicy {
	threshold: u32,
	cooldown: Duration,
}

impl ResetPolicy {
	fn should_reset_at(&self, error_count: u32, last_reset: Instant, now: Instant) -> bool {
		error_count >= self.threshold && now.duration_since(last_reset) >= self.cooldown
	}

	fn should_reset(&self, error_count: u32, last_reset: Instant) -> bool {
		self.should_reset_at(error_count, last_reset, Instant::now())
	}
}

/// The bounded watch table. All mutations go through one mutex; none of
/// them ever waits on the coalescer or the dispatch loop.
struct WatchRegistry {
	config: WatcherConfig,
	reset_policy: ResetPolicy,
	handles: Mutex<HashMap<FolderPath, WatchHandle>>,
	ignored: Arc<Mutex<HashSet<PathBuf>>>,
	coalescer: Arc<EventCoalescer>,
	existence: Arc<ExistenceCache>,
	error_tx: chan::Sender<FolderPath>,
	metrics: Arc<WatcherMetrics>,
}

impl WatchRegistry {
	fn new(
		config: WatcherConfig,
		coalescer: Arc<EventCoalescer>,
		existence: Arc<ExistenceCache>,
		error_tx: chan::Sender<FolderPath>,
		metrics: Arc<WatcherMetrics>,
	) -> Self {
		Self {
			reset_policy: ResetPolicy {
				threshold: config.error_reset_threshold,
				cooldown: config.error_cooldown(),
			},
			config,
			handles: Mutex::new(HashMap::new()),
			ignored: Arc::new(Mutex::new(HashSet::new())),
			coalescer,
			existence,
			error_tx,
			metrics,
		}
	}

	#[instrument(skip(self), fields(folder = %folder))]
	fn watch(&self, folder: &FolderPath) -> Result<(), WatcherError> {
		{
			let handles = self.handles.lock();
			if handles.contains_key(folder) {
				trace!("Folder already watched");
				return Ok(());
			}
			if handles.len() >= self.config.max_watchers {
				warn!(
					capacity = self.config.max_watchers,
					"Watcher capacity exhausted; folder left unwatched;"
				);
				return Ok(());
			}
		}

		// A stale cached positive is dangerous right before attaching
		if !self.existence.directory_exists(folder, true) {
			debug!("Folder missing; not watching");
			return Ok(());
		}

		let watcher = self.create_watcher(folder)?;

		let mut handles = self.handles.lock();
		if handles.len() >= self.config.max_watchers {
			warn!(
				capacity = self.config.max_watchers,
				"Watcher capacity exhausted; folder left unwatched;"
			);
			return Ok(());
		}
		match handles.entry(folder.clone()) {
			// Lost a race with a concurrent watch call; ours is dropped
			Entry::Occupied(_) => {}
			Entry::Vacant(slot) => {
				slot.insert(WatchHandle::new(watcher));
				trace!("Now watching folder");
			}
		}

		Ok(())
	}

	/// Release the watch for `folder` and for every watched folder below
	/// it; a removed subtree must not leave orphaned watches behind.
	#[instrument(skip(self), fields(folder = %folder))]
	fn unwatch(&self, folder: &FolderPath) {
		let removed = {
			let mut handles = self.handles.lock();
			let doomed: Vec<FolderPath> = handles
				.keys()
				.filter(|watched| watched.is_within(folder))
				.cloned()
				.collect();
			doomed
				.iter()
				.filter_map(|key| handles.remove(key))
				.collect::<Vec<_>>()
		};

		if !removed.is_empty() {
			trace!(removed = removed.len(), "Stopped watching folder subtree");
		}
		// OS watches are released here, outside the table lock
		drop(removed);
	}

	fn unwatch_all(&self) {
		let removed: Vec<WatchHandle> = {
			let mut handles = self.handles.lock();
			handles.drain().map(|(_, handle)| handle).collect()
		};

		if !removed.is_empty() {
			debug!(removed = removed.len(), "Stopped watching all folders");
		}
	}

	fn watched_count(&self) -> usize {
		self.handles.lock().len()
	}

	fn set_ignored(&self, path: PathBuf, ignore: bool) {
		let mut ignored = self.ignored.lock();
		if ignore {
			ignored.insert(path);
		} else {
			ignored.remove(&path);
		}
	}

	/// One raised watch error. Counts toward the reset threshold; the
	/// handle is only recycled once the cooldown since its last reset has
	/// also elapsed.
	fn note_error(&self, folder: &FolderPath) {
		let should_reset = {
			let mut handles = self.handles.lock();
			let Some(handle) = handles.get_mut(folder) else {
				return;
			};
			handle.error_count += 1;
			self.reset_policy
				.should_reset(handle.error_count, handle.last_reset)
		};

		if should_reset {
			self.reset(folder);
		}
	}

	/// Tear the handle down and, only if the folder still exists, recreate
	/// it from scratch. The fresh handle starts with a clean error count
	/// and reset time whether or not recreation succeeded.
	#[instrument(skip(self), fields(folder = %folder))]
	fn reset(&self, folder: &FolderPath) {
		let Some(old) = self.handles.lock().remove(folder) else {
			return;
		};
		drop(old);
		self.metrics.record_watch_reset();

		if !self.existence.directory_exists(folder, true) {
			debug!("Folder gone; watch stays released after reset");
			return;
		}

		match self.create_watcher(folder) {
			Ok(watcher) => {
				let mut handles = self.handles.lock();
				if let Entry::Vacant(slot) = handles.entry(folder.clone()) {
					slot.insert(WatchHandle::new(watcher));
				}
				trace!("Watch recreated after error reset");
			}
			Err(e) => error!(?e, "Unable to recreate watch after reset;"),
		}
	}

	fn create_watcher(&self, folder: &FolderPath) -> Result<RecommendedWatcher, WatcherError> {
		let coalescer = Arc::clone(&self.coalescer);
		let ignored = Arc::clone(&self.ignored);
		let error_tx = self.error_tx.clone();
		let callback_folder = folder.clone();

		let mut watcher = RecommendedWatcher::new(
			move |result: notify::Result<notify::Event>| match result {
				Ok(event) => {
					let Some(kind) = event::change_kind(&event.kind) else {
						return;
					};

					for path in &event.paths {
						if event::is_junk(path) || ignored.lock().contains(path) {
							continue;
						}
						coalescer.record(&callback_folder, ChangeEvent::new(path.clone(), kind));
					}
				}
				Err(e) => {
					warn!(folder = %callback_folder, ?e, "Watch reported an error;");
					// Not blocking the callback thread: the channel is unbounded
					if error_tx.send_blocking(callback_folder.clone()).is_err() {
						error!(folder = %callback_folder, "Tried to report a watch error to a closed channel;");
					}
				}
			},
			Config::default(),
		)?;

		watcher.watch(folder.as_path(), RecursiveMode::NonRecursive)?;
		Ok(watcher)
	}

	#[cfg(test)]
	fn error_count(&self, folder: &FolderPath) -> Option<u32> {
		self.handles.lock().get(folder).map(|h| h.error_count)
	}

	#[cfg(test)]
	fn backdate_last_reset(&self, folder: &FolderPath, by: Duration) {
		let mut handles = self.handles.lock();
		if let Some(handle) = handles.get_mut(folder) {
			handle.last_reset = Instant::now()
				.checked_sub(by)
				.expect("monotonic clock reaches far enough back");
		}
	}
}

/// Watches folders and delivers coalesced change batches to one consumer.
///
/// The public face of the watch pipeline: a bounded [`WatchRegistry`], the
/// [`EventCoalescer`] its callbacks feed, a supervisor task applying the
/// error-reset state machine, and the dispatch loop delivering to the
/// consumer for the service's lifetime.
pub struct FolderWatcherService {
	registry: Arc<WatchRegistry>,
	metrics: Arc<WatcherMetrics>,
	dispatch: DispatchLoop,
	error_tx: chan::Sender<FolderPath>,
	supervisor: Mutex<Option<JoinHandle<()>>>,
	shut_down: AtomicBool,
}

impl FolderWatcherService {
	pub fn new(
		config: WatcherConfig,
		consumer: Arc<dyn ChangeConsumer>,
		existence: Arc<ExistenceCache>,
	) -> Self {
		let metrics = Arc::new(WatcherMetrics::new());
		let coalescer = Arc::new(EventCoalescer::new(Arc::clone(&metrics)));
		let (error_tx, error_rx) = chan::unbounded();

		let registry = Arc::new(WatchRegistry::new(
			config.clone(),
			Arc::clone(&coalescer),
			Arc::clone(&existence),
			error_tx.clone(),
			Arc::clone(&metrics),
		));

		let supervisor = spawn({
			let registry = Arc::clone(&registry);
			async move {
				while let Ok(folder) = error_rx.recv().await {
					registry.note_error(&folder);
				}
				trace!("Watch error supervisor exiting");
			}
			.in_current_span()
		});

		let dispatch = DispatchLoop::spawn(config, coalescer, existence, consumer, Arc::clone(&metrics));

		debug!("Folder watcher service initialized");

		Self {
			registry,
			metrics,
			dispatch,
			error_tx,
			supervisor: Mutex::new(Some(supervisor)),
			shut_down: AtomicBool::new(false),
		}
	}

	/// Begin watching `path`. A no-op when already watched, when the folder
	/// is missing, or when capacity is exhausted; watch subsystem failures
	/// are reported and the folder is simply left unwatched.
	pub fn watch(&self, path: impl AsRef<Path>) {
		let folder = FolderPath::new(path);
		if let Err(e) = self.registry.watch(&folder) {
			error!(folder = %folder, ?e, "Unable to watch folder;");
		}
	}

	/// Stop watching `path` and every watched folder below it.
	pub fn unwatch(&self, path: impl AsRef<Path>) {
		self.registry.unwatch(&FolderPath::new(path));
	}

	pub fn unwatch_all(&self) {
		self.registry.unwatch_all();
	}

	pub fn watched_count(&self) -> usize {
		self.registry.watched_count()
	}

	/// Mute (or unmute) change notifications for one exact path; used by
	/// the application to silence echoes of its own writes, e.g. sidecar
	/// updates.
	pub fn ignore_path(&self, path: impl Into<PathBuf>, ignore: bool) {
		self.registry.set_ignored(path.into(), ignore);
	}

	pub fn metrics(&self) -> Arc<WatcherMetrics> {
		Arc::clone(&self.metrics)
	}

	/// Release every watch, stop the dispatch loop with a bounded grace
	/// period, and wind down the supervisor. Calling this twice is a no-op.
	pub async fn shutdown(&self) {
		if self.shut_down.swap(true, Ordering::SeqCst) {
			return;
		}

		debug!("Shutting down folder watcher service");
		self.registry.unwatch_all();
		self.dispatch.stop().await;
		self.error_tx.close();

		let supervisor = self.supervisor.lock().take();
		if let Some(handle) = supervisor {
			if let Err(e) = handle.await {
				error!(?e, "Failed to join watch error supervisor;");
			}
		}

		info!("Folder watcher service shutdown");
	}
}

impl Drop for FolderWatcherService {
	fn drop(&mut self) {
		if !self.shut_down.load(Ordering::SeqCst) {
			self.dispatch.request_stop();
			self.error_tx.close();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use std::fs;
	use tempfile::tempdir;

	fn registry(max_watchers: usize) -> Arc<WatchRegistry> {
		let metrics = Arc::new(WatcherMetrics::new());
		let coalescer = Arc::new(EventCoalescer::new(Arc::clone(&metrics)));
		let existence = Arc::new(ExistenceCache::new(Duration::from_secs(5)));
		let (error_tx, _error_rx) = chan::unbounded();
		let config = WatcherConfig {
			max_watchers,
			..Default::default()
		};

		Arc::new(WatchRegistry::new(
			config, coalescer, existence, error_tx, metrics,
		))
	}

	#[test]
	fn watch_is_idempotent() {
		let root = tempdir().unwrap();
		let reg = registry(10);
		let folder = FolderPath::new(root.path());

		reg.watch(&folder).unwrap();
		reg.watch(&folder).unwrap();

		assert_eq!(reg.watched_count(), 1);
	}

	#[test]
	fn missing_folder_is_declined() {
		let reg = registry(10);
		reg.watch(&FolderPath::new("/definitely/not/here")).unwrap();
		assert_eq!(reg.watched_count(), 0);
	}

	#[test]
	fn capacity_is_enforced() {
		let root = tempdir().unwrap();
		let reg = registry(2);

		for name in ["a", "b", "c"] {
			let dir = root.path().join(name);
			fs::create_dir(&dir).unwrap();
			reg.watch(&FolderPath::new(&dir)).unwrap();
		}

		assert_eq!(reg.watched_count(), 2);
	}

	#[test]
	fn unwatch_releases_whole_subtree() {
		let root = tempdir().unwrap();
		let reg = registry(10);

		for rel in ["a", "a/b", "c"] {
			let dir = root.path().join(rel);
			fs::create_dir_all(&dir).unwrap();
			reg.watch(&FolderPath::new(&dir)).unwrap();
		}
		assert_eq!(reg.watched_count(), 3);

		reg.unwatch(&FolderPath::new(root.path().join("a")));
		assert_eq!(reg.watched_count(), 1);

		reg.unwatch_all();
		assert_eq!(reg.watched_count(), 0);
	}

	#[test]
	fn reset_policy_requires_threshold_and_cooldown() {
		let policy = ResetPolicy {
			threshold: 5,
			cooldown: Duration::from_secs(30),
		};
		let start = Instant::now();

		// Five errors within ten seconds: cooldown not yet elapsed
		assert!(!policy.should_reset_at(5, start, start + Duration::from_secs(10)));
		// Cooldown elapsed but not enough errors
		assert!(!policy.should_reset_at(4, start, start + Duration::from_secs(31)));
		// Both conditions met
		assert!(policy.should_reset_at(5, start, start + Duration::from_secs(31)));
		assert!(policy.should_reset_at(7, start, start + Duration::from_secs(31)));
	}

	#[test]
	fn errors_below_threshold_leave_handle_in_place() {
		let root = tempdir().unwrap();
		let reg = registry(10);
		let folder = FolderPath::new(root.path());

		reg.watch(&folder).unwrap();
		reg.backdate_last_reset(&folder, Duration::from_secs(60));

		for _ in 0..4 {
			reg.note_error(&folder);
		}

		assert_eq!(reg.error_count(&folder), Some(4));
		assert_eq!(reg.metrics.watch_resets.load(Ordering::Relaxed), 0);
	}

	#[test]
	fn threshold_after_cooldown_recycles_the_handle() {
		let root = tempdir().unwrap();
		let reg = registry(10);
		let folder = FolderPath::new(root.path());

		reg.watch(&folder).unwrap();
		reg.backdate_last_reset(&folder, Duration::from_secs(60));

		for _ in 0..5 {
			reg.note_error(&folder);
		}

		assert_eq!(reg.metrics.watch_resets.load(Ordering::Relaxed), 1);
		// Recreated from scratch with a clean slate
		assert_eq!(reg.watched_count(), 1);
		assert_eq!(reg.error_count(&folder), Some(0));
	}

	#[test]
	fn threshold_within_cooldown_defers_the_reset() {
		let root = tempdir().unwrap();
		let reg = registry(10);
		let folder = FolderPath::new(root.path());

		reg.watch(&folder).unwrap();

		// Fresh handle: cooldown since creation has not elapsed
		for _ in 0..5 {
			reg.note_error(&folder);
		}
		assert_eq!(reg.metrics.watch_resets.load(Ordering::Relaxed), 0);
		assert_eq!(reg.error_count(&folder), Some(5));

		// Once the cooldown window passes, the next error trips the reset
		reg.backdate_last_reset(&folder, Duration::from_secs(31));
		reg.note_error(&folder);
		assert_eq!(reg.metrics.watch_resets.load(Ordering::Relaxed), 1);
		assert_eq!(reg.error_count(&folder), Some(0));
	}

	#[test]
	fn reset_of_vanished_folder_stays_released() {
		let root = tempdir().unwrap();
		let dir = root.path().join("gone");
		fs::create_dir(&dir).unwrap();

		let reg = registry(10);
		let folder = FolderPath::new(&dir);
		reg.watch(&folder).unwrap();
		reg.backdate_last_reset(&folder, Duration::from_secs(60));

		fs::remove_dir(&dir).unwrap();
		for _ in 0..5 {
			reg.note_error(&folder);
		}

		assert_eq!(reg.metrics.watch_resets.load(Ordering::Relaxed), 1);
		assert_eq!(reg.watched_count(), 0);
	}

	struct NullConsumer;

	#[async_trait::async_trait]
	impl ChangeConsumer for NullConsumer {
		async fn on_change(&self, _: &FolderPath, _: ChangeEvent) -> anyhow::Result<()> {
			Ok(())
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn shutdown_is_idempotent() {
		let root = tempdir().unwrap();
		let existence = Arc::new(ExistenceCache::new(Duration::from_secs(5)));
		let service = FolderWatcherService::new(
			WatcherConfig::default(),
			Arc::new(NullConsumer),
			existence,
		);

		service.watch(root.path());
		assert_eq!(service.watched_count(), 1);

		service.shutdown().await;
		assert_eq!(service.watched_count(), 0);
		service.shutdown().await;
	}
}
