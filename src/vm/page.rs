//! Page arithmetic and the public flag/state vocabulary.

use bitflags::bitflags;

bitflags! {
    /// Page protection bits, the `PROT_*` vocabulary.
    ///
    /// An empty set is `PROT_NONE`: the mapping is reserved but any access
    /// faults fatally.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        /// Pages may be read.
        const READ = 1 << 0;
        /// Pages may be written.
        const WRITE = 1 << 1;
        /// Pages may be executed.
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// Mapping flags, the `MAP_*` vocabulary.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Writes are carried through to the backing file and are visible to
        /// every other mapper of the same file.
        const SHARED = 1 << 0;
        /// Writes stay local to this process; the file is never modified.
        const PRIVATE = 1 << 1;
        /// No backing file; pages are zero-initialized on first touch.
        const ANON = 1 << 2;
        /// Fixed placement. Recognized but unsupported: always rejected.
        const FIXED = 1 << 3;
    }
}

/// Advice values accepted by [`madvise`](crate::vm::AddressSpace::madvise).
///
/// Only [`Advice::DontNeed`] changes state; the rest validate and succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    /// No special treatment.
    Normal,
    /// Expect random access.
    Random,
    /// Expect sequential access.
    Sequential,
    /// Expect access in the near future.
    WillNeed,
    /// The pages are not needed; committed pages are released back to the
    /// host and re-materialize (zeroed, or re-read from the file) on the
    /// next touch.
    DontNeed,
}

/// Synchronization mode for [`msync`](crate::vm::AddressSpace::msync).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsyncFlags {
    /// Write dirty pages in the range back before returning.
    Sync,
    /// Schedule a debounced background write-back and return immediately.
    Async,
}

/// Access type reported by the host's fault notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// A read (or execute) access faulted.
    Read,
    /// A write access faulted.
    Write,
}

/// Outcome of a fault resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// The fault was resolved; the faulting access must be retried.
    Resolved,
    /// The access is not backed by any permitted mapping; the embedder must
    /// let the fault propagate (the process terminates, as POSIX requires).
    Fatal,
}

/// State of one page inside a memory object's reservation.
///
/// `CommitPending` is the commit-in-progress marker: it stands in for the
/// guard-page trick of hosts that signal guard faults. A resolver observing
/// it holds the store lock, so the committing party has already finished;
/// the observer finalizes the state and retries the access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Reserved address space, not yet committed.
    Reserved,
    /// Mid-commit marker; see above.
    CommitPending,
    /// Committed, currently protected read-only (writes fault and are
    /// observed for dirty tracking).
    CommittedRo,
    /// Committed and writable.
    CommittedRw,
}

impl PageState {
    /// Whether the page has committed backing storage.
    #[inline]
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            PageState::CommitPending | PageState::CommittedRo | PageState::CommittedRw
        )
    }
}

/// Round `n` down to a multiple of `page` (a power of two).
#[inline]
pub fn page_align_down(n: usize, page: usize) -> usize {
    n & !(page - 1)
}

/// Round `n` up to a multiple of `page` (a power of two).
///
/// Returns `None` on overflow.
#[inline]
pub fn page_align_up(n: usize, page: usize) -> Option<usize> {
    n.checked_add(page - 1).map(|v| v & !(page - 1))
}

/// Whether `n` is a multiple of `page`.
#[inline]
pub fn is_page_aligned(n: usize, page: usize) -> bool {
    n & (page - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(page_align_down(4097, 4096), 4096);
        assert_eq!(page_align_down(4096, 4096), 4096);
        assert_eq!(page_align_up(1, 4096), Some(4096));
        assert_eq!(page_align_up(4096, 4096), Some(4096));
        assert_eq!(page_align_up(usize::MAX, 4096), None);
        assert!(is_page_aligned(8192, 4096));
        assert!(!is_page_aligned(8193, 4096));
    }

    #[test]
    fn test_prot_none_is_empty() {
        assert!(Prot::empty().is_empty());
        assert!(!Prot::READ.is_empty());
    }

    #[test]
    fn test_page_state_committed() {
        assert!(!PageState::Reserved.is_committed());
        assert!(PageState::CommitPending.is_committed());
        assert!(PageState::CommittedRo.is_committed());
        assert!(PageState::CommittedRw.is_committed());
    }
}
