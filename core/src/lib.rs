//! Lightbox core
//!
//! Keeps an in-memory view of a directory tree (and per-folder metadata)
//! synchronized with a live, mutating file system:
//!
//! - **FolderWatcherService**: bounded registry of per-folder watches with
//!   failure detection and self-healing
//! - **EventCoalescer** / dispatch loop: collapses raw change notification
//!   storms into a few ordered, deduplicated deliveries to a single consumer
//! - **MetadataStore**: per-folder tags/rating sidecar, cached against the
//!   sidecar's on-disk mtime
//! - **ExistenceCache**: short-TTL directory-existence memo
//! - **TreeLoader**: builds folder nodes with metadata attached, lazily or
//!   via full recursive scans
//!
//! The presentation layer consumes the outputs (a folder tree, a serialized
//! stream of change events, tag/rating values) and lives elsewhere.

pub mod config;
pub mod existence;
pub mod metadata;
pub mod path;
pub mod tree;
pub mod watcher;

pub use config::{CacheConfig, WatcherConfig};
pub use existence::ExistenceCache;
pub use metadata::{MetadataError, MetadataRecord, MetadataStore};
pub use path::FolderPath;
pub use tree::{FolderNode, TreeError, TreeLoader};
pub use watcher::{
	ChangeConsumer, ChangeEvent, ChangeKind, FolderWatcherService, WatcherError, WatcherMetrics,
};
