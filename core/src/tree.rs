//! Folder tree loading
//!
//! Builds [`FolderNode`]s with tags and rating attached, either lazily
//! (root plus immediate children, the UI's expand-on-demand path) or as a
//! full recursive scan. Scans pause the metadata cache for their whole
//! duration so thousands of one-shot sidecar reads don't pollute it.

use std::{io::ErrorKind, path::Path, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::{
	existence::ExistenceCache, metadata::MetadataStore, path::FolderPath,
	watcher::FolderWatcherService,
};

#[derive(Error, Debug)]
pub enum TreeError {
	#[error("Unable to enumerate folder: <path='{path}'> (error: {source})")]
	Enumerate {
		path: std::path::PathBuf,
		source: std::io::Error,
	},
}

/// One folder in the tree. The parent exclusively owns its children; a node
/// never outlives its parent's removal.
#[derive(Debug, Clone)]
pub struct FolderNode {
	pub path: FolderPath,
	pub name: String,
	pub tags: Vec<String>,
	pub rating: u8,
	/// Live probe result backing the consumer's expander placeholder.
	pub has_subdirectories: bool,
	pub children: Vec<FolderNode>,
}

pub struct TreeLoader {
	metadata: Arc<MetadataStore>,
	existence: Arc<ExistenceCache>,
	watcher: Arc<FolderWatcherService>,
}

impl TreeLoader {
	pub fn new(
		metadata: Arc<MetadataStore>,
		existence: Arc<ExistenceCache>,
		watcher: Arc<FolderWatcherService>,
	) -> Self {
		Self {
			metadata,
			existence,
			watcher,
		}
	}

	/// Build the root node with its immediate children and begin watching
	/// the root.
	#[instrument(skip(self, path), fields(root = %path.as_ref().display()))]
	pub async fn load_root(&self, path: impl AsRef<Path>) -> Result<FolderNode, TreeError> {
		let folder = FolderPath::new(path);
		let mut root = self.build_node(&folder).await;

		self.load_children(&mut root).await?;
		self.watcher.watch(root.path.as_path());

		Ok(root)
	}

	/// Enumerate `parent`'s immediate subdirectories into child nodes, each
	/// attached as a watch target. Entries raising access-denied are
	/// skipped, not fatal.
	pub async fn load_children(&self, parent: &mut FolderNode) -> Result<(), TreeError> {
		parent.children = self.children_of(&parent.path, true).await?;
		Ok(())
	}

	/// Depth-first scan of the whole subtree under `path`, with metadata
	/// caching paused for the duration and any stale cache dropped first.
	/// Access-denied branches are skipped; any other per-branch failure is
	/// logged and that branch abandoned while siblings continue.
	#[instrument(skip(self, path), fields(root = %path.as_ref().display()))]
	pub async fn load_tree(&self, path: impl AsRef<Path>, watch: bool) -> Result<FolderNode, TreeError> {
		let _pause = self.metadata.pause_caching();
		self.metadata.clear_cache();

		let folder = FolderPath::new(path);
		let mut root = self.build_node(&folder).await;
		if watch {
			self.watcher.watch(root.path.as_path());
		}

		// An unreadable root is fatal; unreadable branches below are not
		root.children = self.children_of(&root.path, watch).await?;
		for child in &mut root.children {
			self.load_subtree(child, watch).await;
		}
		debug!("Recursive tree scan finished");

		Ok(root)
	}

	fn load_subtree<'a>(&'a self, node: &'a mut FolderNode, watch: bool) -> BoxFuture<'a, ()> {
		async move {
			match self.children_of(&node.path, watch).await {
				Ok(children) => {
					node.children = children;
					for child in &mut node.children {
						self.load_subtree(child, watch).await;
					}
				}
				Err(e) => warn!(folder = %node.path, ?e, "Abandoning branch of tree scan;"),
			}
		}
		.boxed()
	}

	async fn children_of(
		&self,
		folder: &FolderPath,
		watch: bool,
	) -> Result<Vec<FolderNode>, TreeError> {
		let mut entries = match tokio::fs::read_dir(folder.as_path()).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == ErrorKind::PermissionDenied => {
				trace!(folder = %folder, "Access denied; skipping folder contents");
				return Ok(Vec::new());
			}
			Err(source) => {
				return Err(TreeError::Enumerate {
					path: folder.as_path().to_owned(),
					source,
				})
			}
		};

		let mut children = Vec::new();
		loop {
			match entries.next_entry().await {
				Ok(Some(entry)) => {
					let is_dir = match entry.file_type().await {
						Ok(file_type) => file_type.is_dir(),
						Err(e) => {
							trace!(path = %entry.path().display(), ?e, "Skipping unreadable entry");
							continue;
						}
					};
					if !is_dir {
						continue;
					}

					let child = FolderPath::new(entry.path());
					let node = self.build_node(&child).await;
					if watch {
						self.watcher.watch(child.as_path());
					}
					children.push(node);
				}
				Ok(None) => break,
				Err(e) => {
					warn!(folder = %folder, ?e, "Folder enumeration cut short;");
					break;
				}
			}
		}

		children.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
		Ok(children)
	}

	async fn build_node(&self, folder: &FolderPath) -> FolderNode {
		let record = self.metadata.read(folder).await;

		FolderNode {
			name: folder.name().to_string(),
			tags: record.tags,
			rating: record.rating,
			has_subdirectories: self.existence.has_subdirectories(folder),
			children: Vec::new(),
			path: folder.clone(),
		}
	}
}
