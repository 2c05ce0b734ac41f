//! Change events crossing the boundary to the consumer
//!
//! Raw `notify` events are reduced to four change kinds before coalescing;
//! OS litter is filtered out up front so photo folders full of `.DS_Store`
//! and `Thumbs.db` churn never reach the pipeline.

use std::{path::Path, path::PathBuf, time::SystemTime};

use async_trait::async_trait;
use notify::{
	event::{AccessKind, AccessMode, ModifyKind},
	EventKind,
};
use serde::{Deserialize, Serialize};

use crate::path::FolderPath;

/// What happened to a path inside a watched folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
	Created,
	Deleted,
	Renamed,
	Changed,
}

/// One retained change notification, keyed by `path` within its batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
	/// Absolute path of the entry that changed.
	pub path: PathBuf,
	pub kind: ChangeKind,
	/// When the raw notification was received.
	pub timestamp: SystemTime,
}

impl ChangeEvent {
	pub fn new(path: PathBuf, kind: ChangeKind) -> Self {
		Self {
			path,
			kind,
			timestamp: SystemTime::now(),
		}
	}
}

/// The single externally supplied consumer of coalesced change events.
///
/// Deliveries are serially awaited on one dispatch task; implementations
/// never observe two invocations concurrently and may mutate shared view
/// state without their own locking. A returned error fails the current
/// dispatch cycle, which logs and backs off.
#[async_trait]
pub trait ChangeConsumer: Send + Sync + 'static {
	async fn on_change(&self, folder: &FolderPath, event: ChangeEvent) -> anyhow::Result<()>;
}

/// Map a raw watch notification kind onto the consumer-facing taxonomy.
/// Returns `None` for kinds the pipeline does not propagate.
pub(crate) fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
	match kind {
		EventKind::Create(_) => Some(ChangeKind::Created),
		EventKind::Remove(_) => Some(ChangeKind::Deleted),
		EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
		EventKind::Modify(_) => Some(ChangeKind::Changed),
		// Linux signals a finished write as close-after-write
		EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(ChangeKind::Changed),
		_ => None,
	}
}

/// OS and editor litter that must not reach the consumer.
pub(crate) fn is_junk(path: &Path) -> bool {
	let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
		return false;
	};

	name == ".DS_Store"
		|| name.eq_ignore_ascii_case("Thumbs.db")
		|| name.ends_with(".tmp")
		|| name.ends_with(".swp")
		|| name.ends_with('~')
}

#[cfg(test)]
mod tests {
	use super::*;
	use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

	#[test]
	fn kinds_map_onto_consumer_taxonomy() {
		assert_eq!(
			change_kind(&EventKind::Create(CreateKind::File)),
			Some(ChangeKind::Created)
		);
		assert_eq!(
			change_kind(&EventKind::Remove(RemoveKind::Folder)),
			Some(ChangeKind::Deleted)
		);
		assert_eq!(
			change_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
			Some(ChangeKind::Renamed)
		);
		assert_eq!(
			change_kind(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
			Some(ChangeKind::Changed)
		);
		assert_eq!(
			change_kind(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
			Some(ChangeKind::Changed)
		);
		assert_eq!(
			change_kind(&EventKind::Access(AccessKind::Close(AccessMode::Write))),
			Some(ChangeKind::Changed)
		);
		assert_eq!(
			change_kind(&EventKind::Access(AccessKind::Open(AccessMode::Read))),
			None
		);
		assert_eq!(change_kind(&EventKind::Any), None);
	}

	#[test]
	fn junk_files_are_rejected() {
		assert!(is_junk(Path::new("/photos/.DS_Store")));
		assert!(is_junk(Path::new("/photos/thumbs.db")));
		assert!(is_junk(Path::new("/photos/upload.tmp")));
		assert!(is_junk(Path::new("/photos/.img.jpg.swp")));
		assert!(is_junk(Path::new("/photos/backup~")));

		assert!(!is_junk(Path::new("/photos/img.jpg")));
		assert!(!is_junk(Path::new("/photos/.lbtags")));
	}
}
