//! File-description registry.
//!
//! Maps a process plus a file identity to the file-mapping state shared by
//! all `mmap` calls on that file: one shared-class slot per file, one
//! private-class slot per (process, file). File identity is the device/inode
//! pair, so aliasing paths and duplicated descriptors resolve to the same
//! descriptor state.

use crate::error::{Error, Result};
use crate::vm::FileMapId;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::{FileType, Mode, OFlags, RawMode};
use std::collections::HashMap;
use std::path::Path;

/// Process identity within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

/// Stable identity of a file: device + inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey {
    dev: u64,
    ino: u64,
}

/// A file description usable with [`mmap`](crate::vm::AddressSpace::mmap).
///
/// Wraps an owned descriptor together with its registry key and open mode.
/// Construction validates that the descriptor refers to a regular file.
#[derive(Debug)]
pub struct FileDesc {
    fd: OwnedFd,
    key: FileKey,
    writable: bool,
}

impl FileDesc {
    /// Open `path` read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let fd = rustix::fs::open(path.as_ref(), OFlags::RDWR, Mode::empty())?;
        Self::from_fd(fd)
    }

    /// Open `path` read-only. Shared writable mappings of the result are
    /// rejected with `AccessDenied`.
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Result<Self> {
        let fd = rustix::fs::open(path.as_ref(), OFlags::RDONLY, Mode::empty())?;
        Self::from_fd(fd)
    }

    /// Adopt an already-open descriptor.
    ///
    /// # Errors
    ///
    /// Returns `BadDescriptor` if the descriptor is not a regular file.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let stat = rustix::fs::fstat(&fd)?;
        if FileType::from_raw_mode(stat.st_mode as RawMode) != FileType::RegularFile {
            return Err(Error::BadDescriptor("not a regular file"));
        }
        let key = FileKey {
            dev: stat.st_dev as u64,
            ino: stat.st_ino as u64,
        };
        let mode = rustix::fs::fcntl_getfl(&fd)?;
        let writable = mode.contains(OFlags::RDWR) || mode.contains(OFlags::WRONLY);
        Ok(Self { fd, key, writable })
    }

    /// Current file size in bytes.
    pub fn size(&self) -> Result<u64> {
        let stat = rustix::fs::fstat(&self.fd)?;
        Ok(stat.st_size.max(0) as u64)
    }

    /// Whether the file was opened with write access.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn key(&self) -> FileKey {
        self.key
    }
}

impl AsFd for FileDesc {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Registry index: shared slot per file, private slot per (process, file).
#[derive(Default)]
pub(crate) struct RegistryIndex {
    shared: HashMap<FileKey, FileMapId>,
    private: HashMap<(Pid, FileKey), FileMapId>,
}

impl RegistryIndex {
    /// Look up the mapping slot for `key` in the given class.
    pub fn find(&self, pid: Pid, key: FileKey, shared: bool) -> Option<FileMapId> {
        if shared {
            self.shared.get(&key).copied()
        } else {
            self.private.get(&(pid, key)).copied()
        }
    }

    /// Record the mapping slot for `key`.
    pub fn set(&mut self, pid: Pid, key: FileKey, shared: bool, id: FileMapId) {
        if shared {
            self.shared.insert(key, id);
        } else {
            self.private.insert((pid, key), id);
        }
    }

    /// Clear the mapping slot for `key`, called when the last memory object
    /// of the file mapping is destroyed.
    pub fn clear(&mut self, pid: Pid, key: FileKey, shared: bool) {
        if shared {
            self.shared.remove(&key);
        } else {
            self.private.remove(&(pid, key));
        }
    }

    /// Every mapping slot currently recorded for `key`, across classes.
    pub fn all_for_key(&self, key: FileKey) -> Vec<FileMapId> {
        let mut ids = Vec::new();
        if let Some(&id) = self.shared.get(&key) {
            ids.push(id);
        }
        ids.extend(
            self.private
                .iter()
                .filter(|((_, k), _)| *k == key)
                .map(|(_, &id)| id),
        );
        ids
    }

    /// The shared-class slot for `key`, if any.
    pub fn shared_for_key(&self, key: FileKey) -> Option<FileMapId> {
        self.shared.get(&key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mirage-test-{}-{}", name, std::process::id()))
    }

    #[test]
    fn test_desc_identity_by_inode() {
        let path = temp_path("registry-identity");
        std::fs::write(&path, b"x").unwrap();

        let a = FileDesc::open(&path).unwrap();
        let b = FileDesc::open(&path).unwrap();
        assert_eq!(a.key(), b.key());
        assert!(a.is_writable());

        let ro = FileDesc::open_readonly(&path).unwrap();
        assert!(!ro.is_writable());
        assert_eq!(ro.key(), a.key());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_non_regular_file_rejected() {
        let fd = rustix::fs::open("/dev/null", OFlags::RDWR, Mode::empty()).unwrap();
        let err = FileDesc::from_fd(fd).unwrap_err();
        assert!(matches!(err, Error::BadDescriptor(_)));
    }

    #[test]
    fn test_index_classes_are_distinct() {
        let mut index = RegistryIndex::default();
        let key = FileKey { dev: 1, ino: 2 };
        index.set(Pid(1), key, true, FileMapId(10));
        index.set(Pid(1), key, false, FileMapId(11));
        index.set(Pid(2), key, false, FileMapId(12));

        assert_eq!(index.find(Pid(1), key, true), Some(FileMapId(10)));
        assert_eq!(index.find(Pid(2), key, true), Some(FileMapId(10)));
        assert_eq!(index.find(Pid(1), key, false), Some(FileMapId(11)));
        assert_eq!(index.find(Pid(2), key, false), Some(FileMapId(12)));

        let mut all = index.all_for_key(key);
        all.sort_by_key(|id| id.0);
        assert_eq!(all, vec![FileMapId(10), FileMapId(11), FileMapId(12)]);

        index.clear(Pid(1), key, false);
        assert_eq!(index.find(Pid(1), key, false), None);
    }
}
