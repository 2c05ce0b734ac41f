//! Per-folder tags and rating
//!
//! Reads and writes the sidecar record stored inside each folder and caches
//! it keyed by normalized path. A cached entry is valid only while the
//! sidecar's on-disk mtime is at or before the mtime recorded at cache
//! time; newer writes invalidate lazily on the next read. Bulk recursive
//! scans pause caching via an RAII guard so thousands of one-shot reads
//! don't pollute the cache.
//!
//! Metadata is best-effort, not critical-path: read failures degrade to the
//! empty record and a diagnostic, they never reach the caller.

pub mod sidecar;

use std::{
	collections::HashMap,
	io::{self, ErrorKind},
	path::{Path, PathBuf},
	sync::atomic::{AtomicBool, Ordering},
	time::SystemTime,
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::path::FolderPath;

use sidecar::sidecar_path;

#[derive(Error, Debug)]
pub enum MetadataError {
	#[error("Unable to create folder for sidecar: <path='{path}'> (error: {source})")]
	CreateFolder { path: PathBuf, source: io::Error },

	#[error("Unable to write sidecar: <path='{path}'> (error: {source})")]
	WriteSidecar { path: PathBuf, source: io::Error },
}

/// Tags plus rating for one folder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord {
	/// Case-insensitively deduplicated, order-preserving.
	pub tags: Vec<String>,
	/// Clamped to `[0, 5]`.
	pub rating: u8,
}

#[derive(Debug, Clone)]
struct CachedRecord {
	record: MetadataRecord,
	/// Sidecar mtime at the time of caching; `None` when no sidecar existed.
	sidecar_mtime: Option<SystemTime>,
}

impl CachedRecord {
	fn is_valid_against(&self, on_disk: Option<SystemTime>) -> bool {
		match (on_disk, self.sidecar_mtime) {
			(None, None) => true,
			(Some(current), Some(recorded)) => current <= recorded,
			_ => false,
		}
	}
}

#[derive(Debug, Default)]
pub struct MetadataStore {
	cache: Mutex<HashMap<FolderPath, CachedRecord>>,
	caching_disabled: AtomicBool,
}

impl MetadataStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn caching_enabled(&self) -> bool {
		!self.caching_disabled.load(Ordering::SeqCst)
	}

	pub fn set_caching_enabled(&self, enabled: bool) {
		self.caching_disabled.store(!enabled, Ordering::SeqCst);
	}

	/// Pause caching for the lifetime of the returned guard, restoring the
	/// prior setting on drop even when the caller unwinds mid-scan.
	pub fn pause_caching(&self) -> CachingPause<'_> {
		let was_enabled = self.caching_enabled();
		self.set_caching_enabled(false);
		CachingPause {
			store: self,
			was_enabled,
		}
	}

	pub fn clear_cache(&self) {
		self.cache.lock().clear();
	}

	pub fn cached_entry_count(&self) -> usize {
		self.cache.lock().len()
	}

	pub async fn tags(&self, folder: &FolderPath) -> Vec<String> {
		self.read(folder).await.tags
	}

	pub async fn rating(&self, folder: &FolderPath) -> u8 {
		self.read(folder).await.rating
	}

	/// Read the folder's record, from cache when the cached entry is still
	/// valid against the sidecar's on-disk mtime.
	pub async fn read(&self, folder: &FolderPath) -> MetadataRecord {
		let sidecar = sidecar_path(folder);

		if self.caching_enabled() {
			let cached = self.cache.lock().get(folder).cloned();
			if let Some(cached) = cached {
				if cached.is_valid_against(sidecar_mtime(&sidecar).await) {
					return cached.record;
				}
			}
		}

		let (record, mtime) = match tokio::fs::read_to_string(&sidecar).await {
			Ok(content) => {
				let (tags, rating) = sidecar::decode(&content);
				(MetadataRecord { tags, rating }, sidecar_mtime(&sidecar).await)
			}
			Err(e) if e.kind() == ErrorKind::NotFound => (MetadataRecord::default(), None),
			Err(e) => {
				warn!(folder = %folder, ?e, "Unable to read folder sidecar;");
				return MetadataRecord::default();
			}
		};

		if self.caching_enabled() {
			self.cache.lock().insert(
				folder.clone(),
				CachedRecord {
					record: record.clone(),
					sidecar_mtime: mtime,
				},
			);
		}

		record
	}

	/// Normalize, clamp, and persist the record, creating the folder if it
	/// is absent. Folder creation or sidecar write failure is fatal to this
	/// call only.
	pub async fn set_tags_and_rating(
		&self,
		folder: &FolderPath,
		tags: impl IntoIterator<Item = impl AsRef<str>>,
		rating: u8,
	) -> Result<(), MetadataError> {
		let tags = sidecar::normalize_tags(tags);
		let rating = sidecar::clamp_rating(rating);
		let content = sidecar::encode(&tags, rating);

		if !folder.as_path().is_dir() {
			tokio::fs::create_dir_all(folder.as_path())
				.await
				.map_err(|source| MetadataError::CreateFolder {
					path: folder.as_path().to_owned(),
					source,
				})?;
		}

		let sidecar = sidecar_path(folder);
		tokio::fs::write(&sidecar, content.as_bytes())
			.await
			.map_err(|source| MetadataError::WriteSidecar {
				path: sidecar.clone(),
				source,
			})?;

		let mtime = sidecar_mtime(&sidecar).await;
		let mut cache = self.cache.lock();
		cache.remove(folder);
		if self.caching_enabled() {
			cache.insert(
				folder.clone(),
				CachedRecord {
					record: MetadataRecord { tags, rating },
					sidecar_mtime: mtime,
				},
			);
		}

		Ok(())
	}

	/// Carry the source folder's record over to `destination` and drop the
	/// source cache entry. The source sidecar stays on disk; file-move
	/// semantics are the caller's decision.
	pub async fn move_metadata(
		&self,
		source: &FolderPath,
		destination: &FolderPath,
	) -> Result<(), MetadataError> {
		let record = self.read(source).await;
		self.set_tags_and_rating(destination, &record.tags, record.rating)
			.await?;
		self.cache.lock().remove(source);
		Ok(())
	}

	/// Like [`Self::move_metadata`], but the source sidecar and its cache
	/// entry are left untouched.
	pub async fn copy_metadata(
		&self,
		source: &FolderPath,
		destination: &FolderPath,
	) -> Result<(), MetadataError> {
		let record = self.read(source).await;
		self.set_tags_and_rating(destination, &record.tags, record.rating)
			.await
	}

	/// Replace `old_tag` with `new_tag` in every candidate folder carrying
	/// it, re-deduplicating per folder. Per-folder write failures are logged
	/// and skipped so siblings still proceed. The whole cache is cleared
	/// afterwards; a global rename invalidates everything cheaply.
	///
	/// Returns the number of folders updated.
	pub async fn rename_tag_everywhere(
		&self,
		old_tag: &str,
		new_tag: &str,
		candidates: &[FolderPath],
	) -> usize {
		let old_folded = old_tag.to_lowercase();
		let mut renamed = 0;

		for folder in candidates {
			let record = self.read(folder).await;
			if !record.tags.iter().any(|t| t.to_lowercase() == old_folded) {
				continue;
			}

			let replaced: Vec<String> = record
				.tags
				.iter()
				.map(|t| {
					if t.to_lowercase() == old_folded {
						new_tag.to_string()
					} else {
						t.clone()
					}
				})
				.collect();

			if let Err(e) = self
				.set_tags_and_rating(folder, &replaced, record.rating)
				.await
			{
				warn!(folder = %folder, ?e, "Unable to persist renamed tag;");
				continue;
			}

			renamed += 1;
		}

		self.clear_cache();
		renamed
	}
}

/// Restores the prior caching setting when dropped.
#[must_use = "caching resumes as soon as the guard is dropped"]
pub struct CachingPause<'a> {
	store: &'a MetadataStore,
	was_enabled: bool,
}

impl Drop for CachingPause<'_> {
	fn drop(&mut self) {
		self.store.set_caching_enabled(self.was_enabled);
	}
}

async fn sidecar_mtime(sidecar: &Path) -> Option<SystemTime> {
	tokio::fs::metadata(sidecar)
		.await
		.ok()
		.and_then(|m| m.modified().ok())
}
