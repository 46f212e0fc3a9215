//! Synchronous page-fault resolution.
//!
//! The embedder's trap glue forwards access violations here. Resolution
//! runs in the faulting thread under the store lock and walks the per-page
//! state machine: first touch commits the page (reading one page from the
//! file for file-backed mappings, zero-filling at and beyond EOF), write
//! faults on shared writable mappings record the dirty bit and schedule a
//! write-back, and anything already satisfied simply retries. Faults with
//! no permitted mapping behind them report [`FaultDisposition::Fatal`] and
//! the embedder lets the process die, as POSIX requires.

use crate::error::{Error, Result};
use crate::registry::Pid;
use crate::vm::flush;
use crate::vm::mapping::Mapping;
use crate::vm::page::{Access, FaultDisposition, PageState, Prot};
use crate::vm::slots::ObjectId;
use crate::vm::space::{Shared, Store};
use rustix::fd::{AsFd, BorrowedFd};
use rustix::io::Errno;
use std::ptr::NonNull;
use std::sync::Arc;

pub(crate) fn resolve(
    shared: &Arc<Shared>,
    pid: Pid,
    addr: usize,
    access: Access,
) -> Result<FaultDisposition> {
    let mut guard = shared.state.lock().map_err(|_| {
        Error::OutOfMemory("store poisoned by an earlier panic".into())
    })?;
    let store = &mut *guard;
    let host = shared.host.as_ref();
    let page = host.page_size();

    let Some(proc_) = store.procs.get(&pid) else {
        return Ok(FaultDisposition::Fatal);
    };
    let Some(node) = proc_.table.find(addr) else {
        tracing::trace!(pid = pid.0, addr, "fault outside any mapping");
        return Ok(FaultDisposition::Fatal);
    };
    // A mapping with no protection never commits; the fault propagates.
    if node.prot.is_empty() {
        return Ok(FaultDisposition::Fatal);
    }
    if access == Access::Write && !node.prot.contains(Prot::WRITE) {
        return Ok(FaultDisposition::Fatal);
    }
    let node = node.clone();

    let oid = node.backing.object;
    let (page_idx, ptr, state) = {
        let obj = store.object(oid);
        let page_idx = (addr - obj.base_addr()) / page;
        (page_idx, obj.page_ptr(page_idx, page), obj.pages[page_idx])
    };
    let tracked = node.needs_writeback();

    match state {
        PageState::CommitPending => {
            // The committing party finished before we took the lock; clear
            // the marker and retry the access.
            let prot = if tracked {
                node.prot & !Prot::WRITE
            } else {
                node.prot
            };
            host.protect(ptr, page, prot)?;
            store.object_mut(oid).pages[page_idx] = if prot.contains(Prot::WRITE) {
                PageState::CommittedRw
            } else {
                PageState::CommittedRo
            };
            Ok(FaultDisposition::Resolved)
        }
        PageState::Reserved => commit_and_fill(store, shared, pid, &node, oid, page_idx, ptr, access),
        PageState::CommittedRo => {
            if access == Access::Write {
                // Committed read-only, writable mapping: upgrade. Shared
                // writable mappings record the write for the flusher.
                if tracked {
                    mark_dirty(store, shared, pid, &node, oid, page_idx, page);
                }
                host.protect(ptr, page, node.prot)?;
                store.object_mut(oid).pages[page_idx] = PageState::CommittedRw;
            }
            // A read here means another thread resolved the page already.
            Ok(FaultDisposition::Resolved)
        }
        PageState::CommittedRw => Ok(FaultDisposition::Resolved),
    }
}

/// First touch: commit the page and, for file-backed mappings, read its
/// bytes from the duplicated handle. The read needs the page writable, so
/// protection is restricted only afterwards.
#[allow(clippy::too_many_arguments)]
fn commit_and_fill(
    store: &mut Store,
    shared: &Arc<Shared>,
    pid: Pid,
    node: &Mapping,
    oid: ObjectId,
    page_idx: usize,
    ptr: NonNull<u8>,
    access: Access,
) -> Result<FaultDisposition> {
    let host = shared.host.as_ref();
    let page = host.page_size();

    host.commit(ptr, page, Prot::READ | Prot::WRITE)
        .map_err(|err| Error::OutOfMemory(format!("page commit failed: {err}")))?;
    store.object_mut(oid).pages[page_idx] = PageState::CommitPending;

    let window = store.object(oid).file_window();
    if let (Some((obj_off, _)), Some(hid)) = (window, node.backing.handle) {
        let file_off = obj_off + (page_idx * page) as u64;
        let file_size = store
            .object(oid)
            .file_map()
            .map(|m| store.file_map(m).file_size)
            .unwrap_or(0);
        // Bytes at and beyond EOF are a hole: the page stays zero there.
        if file_off < file_size {
            let want = file_size.saturating_sub(file_off).min(page as u64) as usize;
            // SAFETY: the page was just committed read-write; the store
            // lock serializes all access to it.
            let buf = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), want) };
            if let Err(err) = pread_into(store.handle(hid).fd.as_fd(), buf, file_off) {
                // Unwind: the page returns to its uncommitted state.
                let _ = host.decommit(ptr, page);
                store.object_mut(oid).pages[page_idx] = PageState::Reserved;
                return Err(err);
            }
        }
    }

    let tracked = node.needs_writeback();
    let (final_prot, final_state) = if tracked && access == Access::Write {
        mark_dirty(store, shared, pid, node, oid, page_idx, page);
        (node.prot, PageState::CommittedRw)
    } else if tracked {
        // Leave the page read-only so the first write faults and is caught
        // for dirty tracking.
        (node.prot & !Prot::WRITE, PageState::CommittedRo)
    } else if node.prot.contains(Prot::WRITE) {
        (node.prot, PageState::CommittedRw)
    } else {
        (node.prot, PageState::CommittedRo)
    };
    host.protect(ptr, page, final_prot)?;
    store.object_mut(oid).pages[page_idx] = final_state;
    tracing::trace!(pid = pid.0, addr = ptr.as_ptr() as usize, ?access, "page committed");
    Ok(FaultDisposition::Resolved)
}

fn mark_dirty(
    store: &mut Store,
    shared: &Arc<Shared>,
    pid: Pid,
    node: &Mapping,
    oid: ObjectId,
    page_idx: usize,
    page: usize,
) {
    let Some(hid) = node.backing.handle else {
        return;
    };
    let Some((obj_off, _)) = store.object(oid).file_window() else {
        return;
    };
    let file_page = ((obj_off + (page_idx * page) as u64) / page as u64) as usize;
    store.handle_mut(hid).dirty.set(file_page);
    flush::schedule(shared, store, pid);
}

/// Read exactly `buf.len()` bytes at `off`, tolerating short reads. A read
/// past a file truncated under us leaves the tail zero, matching hole
/// semantics.
fn pread_into(fd: BorrowedFd<'_>, mut buf: &mut [u8], mut off: u64) -> Result<()> {
    while !buf.is_empty() {
        match rustix::io::pread(fd, &mut *buf, off) {
            Ok(0) => break,
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                off += n as u64;
            }
            Err(Errno::INTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
