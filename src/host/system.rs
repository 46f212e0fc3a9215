//! POSIX implementation of the host memory primitives.
//!
//! Reservation is an anonymous private `PROT_NONE` mapping; commit and
//! protect are `mprotect`; decommit replaces the pages with a fresh
//! `PROT_NONE` anonymous mapping at the same address (`MAP_FIXED`), which
//! both drops the backing storage and restores zero-on-recommit semantics.

use super::HostMem;
use crate::error::{Error, Result};
use crate::vm::Prot;
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};
use std::ptr::NonNull;

/// Host memory primitives backed by `rustix::mm`.
#[derive(Debug, Default)]
pub struct SystemHost {
    page_size: usize,
}

impl SystemHost {
    /// Create a host using the system page size.
    pub fn new() -> Self {
        Self {
            page_size: rustix::param::page_size(),
        }
    }
}

fn to_mprotect(prot: Prot) -> MprotectFlags {
    let mut flags = MprotectFlags::empty();
    if prot.contains(Prot::READ) {
        flags |= MprotectFlags::READ;
    }
    if prot.contains(Prot::WRITE) {
        flags |= MprotectFlags::WRITE;
    }
    if prot.contains(Prot::EXEC) {
        flags |= MprotectFlags::EXEC;
    }
    flags
}

impl HostMem for SystemHost {
    fn page_size(&self) -> usize {
        if self.page_size != 0 {
            self.page_size
        } else {
            crate::defaults::FALLBACK_PAGE_SIZE
        }
    }

    fn reserve(&self, len: usize) -> Result<NonNull<u8>> {
        // SAFETY: requesting a fresh anonymous mapping at a kernel-chosen
        // address; no existing memory is affected.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )?
        };
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::OutOfMemory("reservation returned null".into()))
    }

    fn commit(&self, addr: NonNull<u8>, len: usize, prot: Prot) -> Result<()> {
        // Anonymous pages materialize zero-filled on first access; commit is
        // purely a protection change on this host.
        // SAFETY: addr/len lie inside a reservation this host handed out.
        unsafe {
            rustix::mm::mprotect(addr.as_ptr().cast(), len, to_mprotect(prot))?;
        }
        Ok(())
    }

    fn protect(&self, addr: NonNull<u8>, len: usize, prot: Prot) -> Result<()> {
        // SAFETY: as for commit.
        unsafe {
            rustix::mm::mprotect(addr.as_ptr().cast(), len, to_mprotect(prot))?;
        }
        Ok(())
    }

    fn decommit(&self, addr: NonNull<u8>, len: usize) -> Result<()> {
        // SAFETY: remapping over our own reservation; MAP_FIXED replaces the
        // committed pages with fresh uncommitted ones at the same address.
        unsafe {
            rustix::mm::mmap_anonymous(
                addr.as_ptr().cast(),
                len,
                ProtFlags::empty(),
                MapFlags::PRIVATE | MapFlags::FIXED,
            )?;
        }
        Ok(())
    }

    unsafe fn release(&self, addr: NonNull<u8>, len: usize) -> Result<()> {
        // SAFETY: caller guarantees addr/len denote one prior reserve.
        unsafe {
            rustix::mm::munmap(addr.as_ptr().cast(), len)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let host = SystemHost::new();
        let page = host.page_size();
        let base = host.reserve(4 * page).unwrap();

        host.commit(base, page, Prot::READ | Prot::WRITE).unwrap();
        // Committed pages are zero and writable.
        unsafe {
            let slice = std::slice::from_raw_parts_mut(base.as_ptr(), page);
            assert!(slice.iter().all(|&b| b == 0));
            slice[0] = 7;
            assert_eq!(slice[0], 7);
        }

        unsafe { host.release(base, 4 * page).unwrap() };
    }

    #[test]
    fn test_decommit_rezeroes() {
        let host = SystemHost::new();
        let page = host.page_size();
        let base = host.reserve(page).unwrap();

        host.commit(base, page, Prot::READ | Prot::WRITE).unwrap();
        unsafe { *base.as_ptr() = 42 };

        host.decommit(base, page).unwrap();
        host.commit(base, page, Prot::READ | Prot::WRITE).unwrap();
        unsafe { assert_eq!(*base.as_ptr(), 0) };

        unsafe { host.release(base, page).unwrap() };
    }

    #[test]
    fn test_protect_downgrade_and_restore() {
        let host = SystemHost::new();
        let page = host.page_size();
        let base = host.reserve(page).unwrap();

        host.commit(base, page, Prot::READ | Prot::WRITE).unwrap();
        unsafe { *base.as_ptr() = 1 };
        host.protect(base, page, Prot::READ).unwrap();
        unsafe { assert_eq!(*base.as_ptr(), 1) };
        host.protect(base, page, Prot::READ | Prot::WRITE).unwrap();
        unsafe { *base.as_ptr() = 2 };

        unsafe { host.release(base, page).unwrap() };
    }
}
