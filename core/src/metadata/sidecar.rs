//! Sidecar file codec
//!
//! One hidden UTF-8 text file per tagged folder, stored inside the folder it
//! describes. Wire format: `tag1#tag2#...#tagN|rating` — tags joined by `#`,
//! a single `|`, then the rating as a decimal integer in `[0,5]`. A missing
//! `|` segment defaults the rating to 0; a missing file is equivalent to
//! zero tags and rating 0.

use std::path::PathBuf;

use crate::path::FolderPath;

/// Hidden sidecar filename, one per tagged folder.
pub const SIDECAR_FILE_NAME: &str = ".lbtags";

const TAG_SEPARATOR: char = '#';
const RATING_SEPARATOR: char = '|';
const ILLEGAL_TAG_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|', '#'];
const MAX_TAG_LEN: usize = 50;

pub const MAX_RATING: u8 = 5;

pub fn sidecar_path(folder: &FolderPath) -> PathBuf {
	folder.as_path().join(SIDECAR_FILE_NAME)
}

pub fn clamp_rating(rating: u8) -> u8 {
	rating.min(MAX_RATING)
}

/// Trim, strip illegal characters, cap length, drop empties, and deduplicate
/// case-insensitively while keeping first-seen casing and order.
pub fn normalize_tags(tags: impl IntoIterator<Item = impl AsRef<str>>) -> Vec<String> {
	let mut seen = Vec::new();
	let mut normalized = Vec::new();

	for tag in tags {
		let cleaned: String = tag
			.as_ref()
			.trim()
			.chars()
			.filter(|c| !ILLEGAL_TAG_CHARS.contains(c))
			.take(MAX_TAG_LEN)
			.collect();

		if cleaned.is_empty() {
			continue;
		}

		let folded = cleaned.to_lowercase();
		if seen.contains(&folded) {
			continue;
		}

		seen.push(folded);
		normalized.push(cleaned);
	}

	normalized
}

/// Serialize an already-normalized record.
pub fn encode(tags: &[String], rating: u8) -> String {
	format!(
		"{}{}{}",
		tags.join(&TAG_SEPARATOR.to_string()),
		RATING_SEPARATOR,
		clamp_rating(rating)
	)
}

/// Parse sidecar content. Malformed input degrades field by field: an
/// unparsable rating becomes 0, out-of-range ratings clamp, tags are
/// re-normalized.
pub fn decode(content: &str) -> (Vec<String>, u8) {
	let content = content.trim();

	let (tag_part, rating_part) = match content.rsplit_once(RATING_SEPARATOR) {
		Some((tags, rating)) => (tags, Some(rating)),
		None => (content, None),
	};

	let tags = normalize_tags(tag_part.split(TAG_SEPARATOR));
	let rating = rating_part
		.and_then(|r| r.trim().parse::<u8>().ok())
		.map(clamp_rating)
		.unwrap_or(0);

	(tags, rating)
}
