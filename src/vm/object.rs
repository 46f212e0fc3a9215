//! Memory objects: host reservations backing mappings.

use crate::error::Result;
use crate::host::HostMem;
use crate::vm::page::PageState;
use crate::vm::slots::FileMapId;
use std::ptr::NonNull;

/// What a memory object backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectKind {
    /// Anonymous storage, zero-filled on first touch. `giveable` marks
    /// shared-anonymous objects that fork exposes to child processes.
    Anon { giveable: bool },
    /// A window `[offset, offset + len)` of the file behind `map`.
    File { map: FileMapId, offset: u64 },
}

/// One host-level reservation.
///
/// File-backed objects belong to a `FileMapping` and may be shared by many
/// mappings (across processes for the shared class). `users` equals the sum
/// of the usage counters of every mapping node referencing this object; the
/// reservation is released when it reaches zero.
pub(crate) struct MemObject {
    base: NonNull<u8>,
    len: usize,
    pub users: u32,
    pub pages: Vec<PageState>,
    pub kind: ObjectKind,
}

// SAFETY: the reservation is plain memory addressed through raw pointers;
// every access is serialized by the store mutex.
unsafe impl Send for MemObject {}
unsafe impl Sync for MemObject {}

impl MemObject {
    /// Reserve backing for a file window. `len` must be page-aligned.
    pub fn new_file(
        host: &dyn HostMem,
        map: FileMapId,
        offset: u64,
        len: usize,
    ) -> Result<Self> {
        debug_assert_eq!(len % host.page_size(), 0);
        let base = host.reserve(len)?;
        Ok(Self {
            base,
            len,
            users: 0,
            pages: vec![PageState::Reserved; len / host.page_size()],
            kind: ObjectKind::File { map, offset },
        })
    }

    /// Reserve anonymous backing. `len` must be page-aligned.
    pub fn new_anon(host: &dyn HostMem, len: usize, giveable: bool) -> Result<Self> {
        debug_assert_eq!(len % host.page_size(), 0);
        let base = host.reserve(len)?;
        Ok(Self {
            base,
            len,
            users: 0,
            pages: vec![PageState::Reserved; len / host.page_size()],
            kind: ObjectKind::Anon { giveable },
        })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Pointer to page `idx` of the reservation.
    pub fn page_ptr(&self, idx: usize, page: usize) -> NonNull<u8> {
        debug_assert!(idx < self.pages.len());
        // SAFETY: idx is within the reservation, so the offset pointer is
        // non-null and in bounds.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(idx * page)) }
    }

    /// The file window this object backs, if file-backed.
    pub fn file_window(&self) -> Option<(u64, u64)> {
        match self.kind {
            ObjectKind::File { offset, .. } => Some((offset, offset + self.len as u64)),
            ObjectKind::Anon { .. } => None,
        }
    }

    /// The owning file mapping, if file-backed.
    pub fn file_map(&self) -> Option<FileMapId> {
        match self.kind {
            ObjectKind::File { map, .. } => Some(map),
            ObjectKind::Anon { .. } => None,
        }
    }

    /// Whether this object fully contains the file byte range.
    pub fn covers_file_range(&self, offset: u64, len: usize) -> bool {
        match self.file_window() {
            Some((lo, hi)) => offset >= lo && offset + len as u64 <= hi,
            None => false,
        }
    }

    /// Index of the page holding file offset `off`, if inside this object.
    pub fn page_index_for_file_offset(&self, off: u64, page: usize) -> Option<usize> {
        let (lo, hi) = self.file_window()?;
        if off >= lo && off < hi {
            Some(((off - lo) as usize) / page)
        } else {
            None
        }
    }

    /// Whether the object was created giveable (shared-anonymous).
    pub fn giveable(&self) -> bool {
        matches!(self.kind, ObjectKind::Anon { giveable: true })
    }
}
