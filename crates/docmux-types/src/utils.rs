//! Path helpers

use crate::prelude::*;

/// Last segment of a document path.
pub fn doc_id(path: &str) -> &str {
	path.rsplit('/').next().unwrap_or(path)
}

/// Everything before the last `/`, or `None` for a single segment.
pub fn parent_path(path: &str) -> Option<&str> {
	path.rfind('/').map(|pos| &path[..pos])
}

/// Join a collection path and a document id.
pub fn doc_path(collection: &str, id: &str) -> String {
	format!("{}/{}", collection, id)
}

/// Split a path into its non-empty segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
	path.split('/').filter(|s| !s.is_empty())
}

/// Path with empty segments dropped: `/tags//a/` becomes `tags/a`.
pub fn normalize_path(path: &str) -> String {
	segments(path).collect::<Vec<_>>().join("/")
}

/// Validate that `path` names a document: an even, non-zero number of segments.
pub fn check_document_path(path: &str) -> MxResult<()> {
	let count = segments(path).count();
	if count == 0 || count % 2 != 0 {
		return Err(Error::InvalidArgument(format!("not a document path: {:?}", path)));
	}
	Ok(())
}

/// Validate that `path` names a collection: an odd number of segments.
pub fn check_collection_path(path: &str) -> MxResult<()> {
	let count = segments(path).count();
	if count % 2 != 1 {
		return Err(Error::InvalidArgument(format!("not a collection path: {:?}", path)));
	}
	Ok(())
}


// vim: ts=4
