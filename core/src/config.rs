//! Configuration for the watch pipeline and caches
//!
//! All numeric thresholds are defaults, not contracts; the settings layer
//! that owns persistence lives outside this crate and hands these structs in.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for the watch registry, coalescer, and dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
	/// Maximum number of concurrently watched folders.
	pub max_watchers: usize,
	/// Quiet interval the dispatch loop sleeps between drains, letting
	/// bursts finish coalescing.
	pub quiet_interval_ms: u64,
	/// Maximum number of pending batches drained per dispatch cycle.
	pub max_batches_per_cycle: usize,
	/// Maximum events delivered out of a single batch.
	pub max_events_per_batch: usize,
	/// A batch holding more events than this is discarded whole; a burst
	/// that size means a scan or bulk operation, not discrete edits.
	pub discard_threshold: usize,
	/// Watch errors tolerated before a handle is torn down and recreated.
	pub error_reset_threshold: u32,
	/// Minimum time between two resets of the same handle.
	pub error_cooldown_secs: u64,
	/// Grace period shutdown waits for an in-flight dispatch cycle.
	pub shutdown_grace_ms: u64,
	/// Extra sleep after a failed dispatch cycle before retrying.
	pub failure_backoff_ms: u64,
}

impl Default for WatcherConfig {
	fn default() -> Self {
		Self {
			max_watchers: 100,
			quiet_interval_ms: 300,
			max_batches_per_cycle: 10,
			max_events_per_batch: 20,
			discard_threshold: 100,
			error_reset_threshold: 5,
			error_cooldown_secs: 30,
			shutdown_grace_ms: 1000,
			failure_backoff_ms: 2000,
		}
	}
}

impl WatcherConfig {
	pub fn quiet_interval(&self) -> Duration {
		Duration::from_millis(self.quiet_interval_ms)
	}

	pub fn error_cooldown(&self) -> Duration {
		Duration::from_secs(self.error_cooldown_secs)
	}

	pub fn shutdown_grace(&self) -> Duration {
		Duration::from_millis(self.shutdown_grace_ms)
	}

	pub fn failure_backoff(&self) -> Duration {
		Duration::from_millis(self.failure_backoff_ms)
	}
}

/// Tuning for the directory-existence cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
	/// How long a cached existence answer stays valid.
	pub existence_ttl_secs: u64,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			existence_ttl_secs: 5,
		}
	}
}

impl CacheConfig {
	pub fn existence_ttl(&self) -> Duration {
		Duration::from_secs(self.existence_ttl_secs)
	}
}
