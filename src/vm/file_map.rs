//! Per-(file, class) mapping state.

use crate::registry::{FileKey, Pid};
use crate::vm::slots::ObjectId;

/// State shared by every mapping of one file in one class.
///
/// The shared class has a single instance per file, used by all processes;
/// the private class has one instance per (process, file). The object list
/// is kept newest-first: requests are matched against the most recently
/// created (and typically most specific) reservation before older ones.
pub(crate) struct FileMapping {
    /// Shared-between-processes, or private to `owner`.
    pub shared: bool,
    /// Creating process. Identifies the private-class registry slot.
    pub owner: Pid,
    pub key: FileKey,
    /// Cached file size. Refreshed at map time and by the ftruncate hook;
    /// faults and flushes treat bytes at and beyond it as a hole.
    pub file_size: u64,
    /// Backing objects, newest first.
    pub objects: Vec<ObjectId>,
}

impl FileMapping {
    pub fn new(shared: bool, owner: Pid, key: FileKey, file_size: u64) -> Self {
        Self {
            shared,
            owner,
            key,
            file_size,
            objects: Vec::new(),
        }
    }

    /// Insert a newly created object at the head.
    pub fn push_newest(&mut self, id: ObjectId) {
        self.objects.insert(0, id);
    }

    /// Detach a destroyed object. Returns true when no objects remain and
    /// the mapping itself must be destroyed.
    pub fn remove_object(&mut self, id: ObjectId) -> bool {
        self.objects.retain(|&o| o != id);
        self.objects.is_empty()
    }
}
