//! Short-TTL directory-existence cache
//!
//! Answers "does this directory exist" without hitting the file system on
//! every query. Entries expire pull-based: an expired entry is re-verified
//! on the next query, not proactively evicted. Shared between the watch
//! threads and the consumer context, so all access goes through one short
//! lock that is never held across file system probes.

use std::{
	collections::HashMap,
	io::ErrorKind,
	time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::trace;

use crate::{config::CacheConfig, path::FolderPath};

#[derive(Debug, Clone, Copy)]
struct ExistenceEntry {
	exists: bool,
	checked_at: Instant,
}

#[derive(Debug)]
pub struct ExistenceCache {
	entries: Mutex<HashMap<FolderPath, ExistenceEntry>>,
	ttl: Duration,
}

impl ExistenceCache {
	pub fn new(ttl: Duration) -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
			ttl,
		}
	}

	pub fn from_config(config: &CacheConfig) -> Self {
		Self::new(config.existence_ttl())
	}

	/// Whether `path` currently exists as a directory.
	///
	/// Answers from cache within the TTL unless `bypass_cache` forces a live
	/// check; a stale positive is dangerous right before attaching a watch.
	pub fn directory_exists(&self, path: &FolderPath, bypass_cache: bool) -> bool {
		if !bypass_cache {
			if let Some(entry) = self.entries.lock().get(path) {
				if entry.checked_at.elapsed() < self.ttl {
					return entry.exists;
				}
			}
		}

		let exists = path.as_path().is_dir();
		self.entries.lock().insert(
			path.clone(),
			ExistenceEntry {
				exists,
				checked_at: Instant::now(),
			},
		);

		exists
	}

	/// Whether `path` has at least one subdirectory. Never cached: expander
	/// placeholders in the tree must reflect the live answer.
	///
	/// Access denied means "assume true" so the consumer shows an expander
	/// instead of silently hiding children; any other failure means "false".
	pub fn has_subdirectories(&self, path: &FolderPath) -> bool {
		let entries = match std::fs::read_dir(path.as_path()) {
			Ok(entries) => entries,
			Err(e) if e.kind() == ErrorKind::PermissionDenied => return true,
			Err(e) => {
				trace!(path = %path, ?e, "Unable to enumerate folder for subdirectory probe;");
				return false;
			}
		};

		for entry in entries.flatten() {
			if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
				return true;
			}
		}

		false
	}

	/// Drop the entry for `path`; with `recursive`, also every cached entry
	/// below it.
	pub fn invalidate(&self, path: &FolderPath, recursive: bool) {
		let mut entries = self.entries.lock();
		if recursive {
			entries.retain(|cached, _| !cached.is_within(path));
		} else {
			entries.remove(path);
		}
	}

	pub fn clear(&self) {
		self.entries.lock().clear();
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}
}
