//! Maps object ids to their location under the storage root.

use std::path::{Path, PathBuf};

use crate::cache::entry::ObjectId;

/// Lays objects out as `root/<c0>/<c1>/<id>`, using the first two characters
/// of the id as a two-level shard so no directory grows too large.
#[derive(Debug, Clone)]
pub struct PathMapper {
    root: PathBuf,
}

impl PathMapper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, object_id: &ObjectId) -> PathBuf {
        // Ids are ASCII and at least two characters long.
        let id = object_id.as_str();
        self.root.join(&id[0..1]).join(&id[1..2]).join(id)
    }
}
