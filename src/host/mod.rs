//! Host memory primitives.
//!
//! The mapping layer targets a platform that offers only a flat
//! reserve/commit model: address space is reserved without backing storage,
//! pages are committed (zero-filled) and protected individually, and faults
//! on uncommitted or protection-restricted pages are reported synchronously
//! to the embedder, which forwards them to
//! [`AddressSpace::resolve_fault`](crate::vm::AddressSpace::resolve_fault).
//!
//! [`HostMem`] is the seam; [`SystemHost`] implements it on POSIX hosts.

mod system;

pub use system::SystemHost;

use crate::error::Result;
use crate::vm::Prot;
use std::ptr::NonNull;

/// The reserve/commit primitive set the host platform provides.
///
/// # Safety contract
///
/// Implementations must ensure that `reserve` returns page-aligned regions
/// that stay valid until `release`, that committed pages read as zero on
/// first commit, and that `decommit` returns pages to their zero-filled
/// uncommitted state.
pub trait HostMem: Send + Sync {
    /// Host page size in bytes (a power of two).
    fn page_size(&self) -> usize;

    /// Reserve `len` bytes of address space with no access and no backing
    /// storage.
    fn reserve(&self, len: usize) -> Result<NonNull<u8>>;

    /// Commit pages inside a reservation with the given protection.
    /// Freshly committed pages read as zero.
    fn commit(&self, addr: NonNull<u8>, len: usize, prot: Prot) -> Result<()>;

    /// Change the protection of committed pages.
    fn protect(&self, addr: NonNull<u8>, len: usize, prot: Prot) -> Result<()>;

    /// Return committed pages to the reserved (uncommitted, zero-on-recommit)
    /// state.
    fn decommit(&self, addr: NonNull<u8>, len: usize) -> Result<()>;

    /// Release a whole reservation.
    ///
    /// # Safety
    ///
    /// `addr`/`len` must denote exactly one prior `reserve`, with no live
    /// references into the region.
    unsafe fn release(&self, addr: NonNull<u8>, len: usize) -> Result<()>;
}
