//! Dirty-page write-back.
//!
//! Write faults on shared writable mappings mark pages dirty and schedule a
//! debounced background flush; synchronous `msync` and region teardown run
//! the same per-page logic inline. One worker thread per process, started
//! lazily and fed by a bounded channel; a pending request is never re-armed,
//! so bursts collapse into a single pass.
//!
//! Per dirty page the sequence is: write the bytes to the file (clipped to
//! the cached size, so holes past EOF never land on disk), copy them into
//! every sibling object that has the page committed, drop the page back to
//! read-only so the next write faults again, clear the bit. The whole
//! sequence runs under the store lock and is not cancellable mid-page.

use crate::error::{Error, Result};
use crate::host::HostMem;
use crate::registry::Pid;
use crate::vm::mapping::Mapping;
use crate::vm::page::{PageState, Prot};
use crate::vm::slots::{FileMapId, HandleId, ObjectId};
use crate::vm::space::{Shared, Store};
use rustix::fd::{AsFd, BorrowedFd};
use rustix::io::Errno;
use std::sync::Arc;

/// Messages understood by a process's flush worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushMsg {
    /// Debounce, then flush everything dirty for the process.
    Request,
    /// Exit the worker loop.
    Shutdown,
}

/// Arm the debounced flush for `pid`. Coalesced: while a request is
/// pending, further calls are no-ops.
pub(crate) fn schedule(shared: &Arc<Shared>, store: &mut Store, pid: Pid) {
    let Some(proc_) = store.procs.get_mut(&pid) else {
        return;
    };
    if proc_.flush_pending {
        return;
    }
    if proc_.flush_tx.is_none() {
        let (tx, rx) = kanal::bounded(crate::defaults::FLUSH_CHANNEL_DEPTH);
        let worker_shared = Arc::clone(shared);
        let builder = std::thread::Builder::new().name(format!("mirage-flush-{}", pid.0));
        match builder.spawn(move || worker_main(worker_shared, pid, rx)) {
            Ok(handle) => {
                proc_.flush_tx = Some(tx);
                proc_.flush_worker = Some(handle);
            }
            Err(err) => {
                tracing::warn!(%err, "could not start flush worker");
                return;
            }
        }
    }
    proc_.flush_pending = true;
    if let Some(tx) = &proc_.flush_tx {
        let _ = tx.try_send(FlushMsg::Request);
    }
}

fn worker_main(shared: Arc<Shared>, pid: Pid, rx: kanal::Receiver<FlushMsg>) {
    loop {
        match rx.recv() {
            Ok(FlushMsg::Request) => {}
            Ok(FlushMsg::Shutdown) | Err(_) => break,
        }
        std::thread::sleep(shared.debounce);

        // Drain requests that piled up during the debounce window.
        let mut shutdown = false;
        while let Ok(Some(msg)) = rx.try_recv() {
            if msg == FlushMsg::Shutdown {
                shutdown = true;
            }
        }

        {
            let Ok(mut guard) = shared.state.lock() else {
                break;
            };
            let store = &mut *guard;
            match store.procs.get_mut(&pid) {
                Some(p) => p.flush_pending = false,
                None => break,
            }
            if let Err(err) = flush_process(store, shared.host.as_ref(), pid) {
                tracing::warn!(%err, pid = pid.0, "background flush failed");
            }
        }
        if shutdown {
            break;
        }
    }
    tracing::trace!(pid = pid.0, "flush worker stopped");
}

/// Flush every dirty page tracked by `pid`'s handles.
pub(crate) fn flush_process(store: &mut Store, host: &dyn HostMem, pid: Pid) -> Result<()> {
    let hids: Vec<HandleId> = match store.procs.get(&pid) {
        Some(p) => p.handle_index.values().copied().collect(),
        None => return Ok(()),
    };
    for hid in hids {
        flush_handle(store, host, hid, None)?;
    }
    Ok(())
}

/// Flush the dirty pages of one handle, optionally restricted to a file
/// page range `[lo, hi)`.
pub(crate) fn flush_handle(
    store: &mut Store,
    host: &dyn HostMem,
    hid: HandleId,
    range: Option<(usize, usize)>,
) -> Result<()> {
    let (key, dirty) = {
        let handle = store.handle(hid);
        if !handle.dirty.any_set() {
            return Ok(());
        }
        let (lo, hi) = range.unwrap_or((0, usize::MAX));
        (handle.key, handle.dirty.collect_dirty(lo, hi))
    };
    if dirty.is_empty() {
        return Ok(());
    }
    let Some(map_id) = store.registry.shared_for_key(key) else {
        return Ok(());
    };
    tracing::debug!(pages = dirty.len(), "writing back dirty pages");
    for page in dirty {
        flush_page(store, host, map_id, hid, page)?;
    }
    Ok(())
}

/// Flush the dirty pages covered by one region, optionally clipped to an
/// address range. Used before a shared writable region is released and by
/// synchronous `msync`.
pub(crate) fn flush_node_range(
    store: &mut Store,
    host: &dyn HostMem,
    node: &Mapping,
    clip: Option<(usize, usize)>,
) -> Result<()> {
    let Some(hid) = node.backing.handle else {
        return Ok(());
    };
    let page = host.page_size();
    let (lo, hi) = {
        let obj = store.object(node.backing.object);
        let Some((obj_off, _)) = obj.file_window() else {
            return Ok(());
        };
        let (mut start, mut end) = (node.start, node.end);
        if let Some((clip_lo, clip_hi)) = clip {
            start = start.max(clip_lo);
            end = end.min(clip_hi);
        }
        if start >= end {
            return Ok(());
        }
        let lo = (obj_off as usize + (start - obj.base_addr())) / page;
        (lo, lo + (end - start) / page)
    };
    flush_handle(store, host, hid, Some((lo, hi)))
}

/// The per-page flush sequence: write back, propagate to sibling objects,
/// re-restrict, clear the bit.
fn flush_page(
    store: &mut Store,
    host: &dyn HostMem,
    map_id: FileMapId,
    hid: HandleId,
    file_page: usize,
) -> Result<()> {
    let page = host.page_size();
    let (object_list, file_size) = {
        let fm = store.file_map(map_id);
        (fm.objects.clone(), fm.file_size)
    };
    let file_off = file_page as u64 * page as u64;

    // The newest object with the page committed writable holds the bytes.
    let mut src: Option<(ObjectId, usize)> = None;
    for &oid in &object_list {
        let obj = store.object(oid);
        if let Some(idx) = obj.page_index_for_file_offset(file_off, page) {
            if obj.pages[idx] == PageState::CommittedRw {
                src = Some((oid, idx));
                break;
            }
        }
    }
    let Some((src_oid, src_idx)) = src else {
        // Already flushed (or the mapping went away); nothing to write.
        store.handle_mut(hid).dirty.clear(file_page);
        return Ok(());
    };
    let src_ptr = store.object(src_oid).page_ptr(src_idx, page);

    // Write back, clipped to the cached size: bytes past EOF are a hole and
    // never reach the disk.
    let write_len = file_size.saturating_sub(file_off).min(page as u64) as usize;
    if write_len > 0 {
        // SAFETY: the page is committed read-write and the store lock keeps
        // every other accessor out.
        let bytes = unsafe { std::slice::from_raw_parts(src_ptr.as_ptr(), write_len) };
        pwrite_all(store.handle(hid).fd.as_fd(), bytes, file_off)?;
    }

    // Propagate into every sibling object that has this page committed, so
    // mappings through other windows observe the new bytes.
    for &oid in &object_list {
        if oid == src_oid {
            continue;
        }
        let (dst_ptr, prev, idx) = {
            let obj = store.object(oid);
            match obj.page_index_for_file_offset(file_off, page) {
                Some(idx) if obj.pages[idx].is_committed() => {
                    (obj.page_ptr(idx, page), obj.pages[idx], idx)
                }
                _ => continue,
            }
        };
        if prev != PageState::CommittedRw {
            host.protect(dst_ptr, page, Prot::READ | Prot::WRITE)?;
        }
        // SAFETY: both pages are committed; the reservations are disjoint.
        unsafe {
            std::ptr::copy_nonoverlapping(src_ptr.as_ptr(), dst_ptr.as_ptr(), page);
        }
        if prev != PageState::CommittedRw {
            host.protect(dst_ptr, page, Prot::READ)?;
            store.object_mut(oid).pages[idx] = PageState::CommittedRo;
        }
    }

    // Back to read-only: the next write must fault to be tracked again.
    host.protect(src_ptr, page, Prot::READ)?;
    store.object_mut(src_oid).pages[src_idx] = PageState::CommittedRo;
    store.handle_mut(hid).dirty.clear(file_page);
    Ok(())
}

fn pwrite_all(fd: BorrowedFd<'_>, mut buf: &[u8], mut off: u64) -> Result<()> {
    while !buf.is_empty() {
        match rustix::io::pwrite(fd, buf, off) {
            Ok(0) => {
                return Err(Error::Io(std::io::ErrorKind::WriteZero.into()));
            }
            Ok(n) => {
                buf = &buf[n..];
                off += n as u64;
            }
            Err(Errno::INTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
