//! The shared store and the per-process mapping facade.
//!
//! All mutable state (object, file-mapping and handle pools, the registry
//! index, and every process's mapping table) lives in one [`Store`] behind
//! one mutex, acquired for every read or mutation. [`MapStore`] owns the
//! store; [`AddressSpace`] is a per-process handle exposing the POSIX-shaped
//! surface. The public entry points are non-reentrant: internal helpers take
//! `&mut Store` and never re-acquire the lock.

use crate::defaults;
use crate::error::{Error, Result};
use crate::host::{HostMem, SystemHost};
use crate::registry::{FileDesc, FileKey, Pid, RegistryIndex};
use crate::vm::fault;
use crate::vm::file_map::FileMapping;
use crate::vm::flush::{self, FlushMsg};
use crate::vm::handle::FileHandle;
use crate::vm::mapping::{CutResult, Mapping, MappingTable, RefDelta};
use crate::vm::object::MemObject;
use crate::vm::page::{
    is_page_aligned, page_align_up, Access, Advice, FaultDisposition, MapFlags, MsyncFlags,
    PageState, Prot,
};
use crate::vm::slots::{FileMapId, HandleId, ObjectId, Slots};
use rustix::fd::AsFd;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-process state: the mapping table, the handle index, and the flush
/// worker plumbing.
pub(crate) struct ProcState {
    pub table: MappingTable,
    pub handle_index: HashMap<FileKey, HandleId>,
    pub flush_pending: bool,
    pub flush_tx: Option<kanal::Sender<FlushMsg>>,
    pub flush_worker: Option<std::thread::JoinHandle<()>>,
}

impl ProcState {
    fn new() -> Self {
        Self {
            table: MappingTable::new(),
            handle_index: HashMap::new(),
            flush_pending: false,
            flush_tx: None,
            flush_worker: None,
        }
    }
}

/// Everything behind the store mutex.
pub(crate) struct Store {
    pub objects: Slots<MemObject>,
    pub file_maps: Slots<FileMapping>,
    pub handles: Slots<FileHandle>,
    pub registry: RegistryIndex,
    pub procs: HashMap<Pid, ProcState>,
}

impl Store {
    fn new() -> Self {
        Self {
            objects: Slots::new(),
            file_maps: Slots::new(),
            handles: Slots::new(),
            registry: RegistryIndex::default(),
            procs: HashMap::new(),
        }
    }

    pub fn object(&self, id: ObjectId) -> &MemObject {
        self.objects.get(id.0)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> &mut MemObject {
        self.objects.get_mut(id.0)
    }

    pub fn file_map(&self, id: FileMapId) -> &FileMapping {
        self.file_maps.get(id.0)
    }

    pub fn file_map_mut(&mut self, id: FileMapId) -> &mut FileMapping {
        self.file_maps.get_mut(id.0)
    }

    pub fn handle(&self, id: HandleId) -> &FileHandle {
        self.handles.get(id.0)
    }

    pub fn handle_mut(&mut self, id: HandleId) -> &mut FileHandle {
        self.handles.get_mut(id.0)
    }

    fn proc_mut(&mut self, pid: Pid) -> &mut ProcState {
        self.procs.get_mut(&pid).expect("no state for attached process")
    }

    /// Apply usage deltas to object and handle user counts; report whatever
    /// reached zero.
    fn apply_deltas(&mut self, deltas: &[RefDelta]) -> (Vec<ObjectId>, Vec<HandleId>) {
        for d in deltas {
            let users = &mut self.object_mut(d.object).users;
            let next = i64::from(*users) + d.amount;
            debug_assert!(next >= 0, "object refcount underflow");
            *users = next.max(0) as u32;
            if let Some(hid) = d.handle {
                let users = &mut self.handle_mut(hid).users;
                let next = i64::from(*users) + d.amount;
                debug_assert!(next >= 0, "handle refcount underflow");
                *users = next.max(0) as u32;
            }
        }
        let mut dead_objects = Vec::new();
        let mut dead_handles = Vec::new();
        for d in deltas {
            if self.object(d.object).users == 0 && !dead_objects.contains(&d.object) {
                dead_objects.push(d.object);
            }
            if let Some(hid) = d.handle {
                if self.handle(hid).users == 0 && !dead_handles.contains(&hid) {
                    dead_handles.push(hid);
                }
            }
        }
        (dead_objects, dead_handles)
    }

    /// Release an object whose user count reached zero. Destroys the parent
    /// file mapping (and clears its registry slot) when no sibling objects
    /// remain.
    fn destroy_object(&mut self, host: &dyn HostMem, oid: ObjectId) {
        let obj = self.objects.remove(oid.0);
        tracing::debug!(base = obj.base_addr(), len = obj.len(), "releasing memory object");
        if let Some(map_id) = obj.file_map() {
            if self.file_map_mut(map_id).remove_object(oid) {
                let fm = self.file_maps.remove(map_id.0);
                self.registry.clear(fm.owner, fm.key, fm.shared);
            }
        }
        // SAFETY: zero users means no mapping references this reservation.
        unsafe {
            let _ = host.release(obj.base(), obj.len());
        }
    }

    /// Close a handle whose user count reached zero.
    fn destroy_handle(&mut self, pid: Pid, hid: HandleId) {
        let handle = self.handles.remove(hid.0);
        if let Some(p) = self.procs.get_mut(&pid) {
            p.handle_index.remove(&handle.key);
        }
        // The duplicated descriptor closes when `handle` drops here.
    }

    /// Flush what an unmap freed, then apply its refcount changes and
    /// destroy whatever died.
    fn release_cut(&mut self, host: &dyn HostMem, pid: Pid, cut: CutResult) -> Result<()> {
        for node in &cut.freed {
            if node.needs_writeback() {
                flush::flush_node_range(self, host, node, None)?;
            }
        }
        let (dead_objects, dead_handles) = self.apply_deltas(&cut.deltas);
        for oid in dead_objects {
            self.destroy_object(host, oid);
        }
        for hid in dead_handles {
            self.destroy_handle(pid, hid);
        }
        Ok(())
    }
}

/// Shared core: host primitives plus the locked store.
pub(crate) struct Shared {
    pub host: Arc<dyn HostMem>,
    pub state: Mutex<Store>,
    pub debounce: Duration,
}

/// Construction options for [`MapStore`].
pub struct StoreOptions {
    /// Debounce delay for background write-back.
    pub flush_debounce: Duration,
    /// Host memory primitives; defaults to [`SystemHost`].
    pub host: Option<Arc<dyn HostMem>>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            flush_debounce: defaults::FLUSH_DEBOUNCE,
            host: None,
        }
    }
}

/// The store shared by every emulated process.
///
/// Create one per host, then [`attach`](MapStore::attach) an
/// [`AddressSpace`] per process. Shared-class file mappings created through
/// one space are visible to every other space attached to the same store.
pub struct MapStore {
    shared: Arc<Shared>,
}

impl Default for MapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MapStore {
    /// Create a store with default options.
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    /// Create a store with explicit options.
    pub fn with_options(options: StoreOptions) -> Self {
        let host = options
            .host
            .unwrap_or_else(|| Arc::new(SystemHost::new()) as Arc<dyn HostMem>);
        Self {
            shared: Arc::new(Shared {
                host,
                state: Mutex::new(Store::new()),
                debounce: options.flush_debounce,
            }),
        }
    }

    /// Attach a process to the store.
    pub fn attach(&self, pid: Pid) -> Result<AddressSpace> {
        let mut guard = self.lock();
        if guard.procs.contains_key(&pid) {
            return Err(Error::InvalidArgument("process already attached"));
        }
        guard.procs.insert(pid, ProcState::new());
        Ok(AddressSpace {
            shared: Arc::clone(&self.shared),
            pid,
        })
    }

    /// Fork hook: expose every shared mapping of `parent` to a new child
    /// process.
    ///
    /// File-backed clones get a process-local handle duplicate with a fresh
    /// dirty bitmap; dirty state is never inherited. Private mappings are
    /// not propagated; the host's own fork semantics cover those.
    pub fn fork(&self, parent: &AddressSpace, child: Pid) -> Result<AddressSpace> {
        let mut guard = self.lock();
        let store = &mut *guard;
        if store.procs.contains_key(&child) {
            return Err(Error::InvalidArgument("process already attached"));
        }
        let parent_nodes: Vec<Mapping> = store
            .procs
            .get(&parent.pid)
            .map(|p| p.table.nodes().to_vec())
            .unwrap_or_default();

        let mut child_state = ProcState::new();
        let mut deltas = Vec::new();
        let mut failure = None;
        for node in parent_nodes
            .iter()
            .filter(|n| n.flags.contains(MapFlags::SHARED))
        {
            // Anonymous regions come over only when created giveable.
            if node.backing.handle.is_none() && !store.object(node.backing.object).giveable() {
                continue;
            }
            let mut clone = node.clone();
            if let Some(parent_hid) = node.backing.handle {
                let key = store.handle(parent_hid).key;
                let hid = match child_state.handle_index.get(&key).copied() {
                    Some(h) => h,
                    None => {
                        let dup = {
                            let src = store.handle(parent_hid);
                            FileHandle::duplicate(src.fd.as_fd(), key, true)
                        };
                        match dup {
                            Ok(h) => {
                                let hid = HandleId(store.handles.insert(h));
                                child_state.handle_index.insert(key, hid);
                                hid
                            }
                            Err(err) => {
                                failure = Some(err);
                                break;
                            }
                        }
                    }
                };
                clone.backing.handle = Some(hid);
            }
            deltas.push(RefDelta {
                object: clone.backing.object,
                handle: clone.backing.handle,
                amount: i64::from(clone.backing.usage),
            });
            child_state.table.push_back(clone);
        }
        if let Some(err) = failure {
            for (_, hid) in child_state.handle_index.drain() {
                let _ = store.handles.remove(hid.0);
            }
            return Err(err);
        }

        store.apply_deltas(&deltas);
        let regions = child_state.table.nodes().len();
        store.procs.insert(child, child_state);
        tracing::debug!(
            parent = parent.pid.0,
            child = child.0,
            regions,
            "propagated shared mappings to child"
        );
        Ok(AddressSpace {
            shared: Arc::clone(&self.shared),
            pid: child,
        })
    }

    /// Truncation hook: record `new_size` on every mapping state of the
    /// file so later faults treat bytes beyond it as a hole. The caller
    /// performs the actual `ftruncate`.
    pub fn ftruncate_hook(&self, desc: &FileDesc, new_size: u64) {
        let mut guard = self.lock();
        for map_id in guard.registry.all_for_key(desc.key()) {
            guard.file_map_mut(map_id).file_size = new_size;
        }
    }

    /// Store-wide pool counters.
    pub fn stats(&self) -> StoreStats {
        let guard = self.lock();
        StoreStats {
            objects: guard.objects.len(),
            file_mappings: guard.file_maps.len(),
            handles: guard.handles.len(),
            processes: guard.procs.len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Pool counters reported by [`MapStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Live memory objects.
    pub objects: usize,
    /// Live per-(file, class) mapping states.
    pub file_mappings: usize,
    /// Open duplicated handles.
    pub handles: usize,
    /// Attached processes.
    pub processes: usize,
}

/// Introspection view of one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Start address.
    pub start: usize,
    /// End address (exclusive).
    pub end: usize,
    /// Logical protection.
    pub prot: Prot,
    /// Mapping flags.
    pub flags: MapFlags,
    /// Logical mappings resolving to this region.
    pub usage: u32,
}

/// Counters reported by [`AddressSpace::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceStats {
    /// Regions in the mapping table.
    pub regions: usize,
    /// Committed pages across the objects this process references.
    pub committed_pages: usize,
    /// Pages with unflushed writes.
    pub dirty_pages: usize,
}

/// One emulated process's view of the store.
///
/// Dropping the space unmaps everything it still holds (flushing dirty
/// shared pages first) and stops its flush worker.
pub struct AddressSpace {
    shared: Arc<Shared>,
    pid: Pid,
}

impl AddressSpace {
    /// The process identity this space was attached with.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Create a mapping.
    ///
    /// `addr_hint` is accepted for signature compatibility and ignored;
    /// fixed placement (`MapFlags::FIXED`) is unsupported and rejected.
    /// Exactly one of `SHARED`/`PRIVATE` is required. `offset` must be
    /// page-aligned. Anonymous mappings ignore `fd` and get zero-filled
    /// pages; file-backed mappings demand-page from `fd`.
    pub fn mmap(
        &self,
        addr_hint: usize,
        len: usize,
        prot: Prot,
        flags: MapFlags,
        fd: Option<&FileDesc>,
        offset: u64,
    ) -> Result<NonNull<u8>> {
        let _ = addr_hint;
        let page = self.shared.host.page_size();

        if flags.contains(MapFlags::FIXED) {
            return Err(Error::InvalidArgument("fixed placement is not supported"));
        }
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length mapping"));
        }
        let shared_class = flags.contains(MapFlags::SHARED);
        if shared_class == flags.contains(MapFlags::PRIVATE) {
            return Err(Error::InvalidArgument(
                "exactly one of MAP_SHARED and MAP_PRIVATE is required",
            ));
        }
        if offset % page as u64 != 0 {
            return Err(Error::InvalidArgument("offset not page-aligned"));
        }
        let len = page_align_up(len, page).ok_or(Error::Overflow)?;
        let end_off = offset.checked_add(len as u64).ok_or(Error::Overflow)?;
        if end_off > isize::MAX as u64 {
            return Err(Error::Overflow);
        }

        if flags.contains(MapFlags::ANON) {
            return self.map_anon(len, prot, flags);
        }

        let desc = fd.ok_or(Error::BadDescriptor(
            "file-backed mapping requires a descriptor",
        ))?;
        if shared_class && prot.contains(Prot::WRITE) && !desc.is_writable() {
            return Err(Error::AccessDenied(
                "shared writable mapping of a read-only descriptor",
            ));
        }
        self.map_file(desc, len, prot, flags, offset)
    }

    fn map_anon(&self, len: usize, prot: Prot, flags: MapFlags) -> Result<NonNull<u8>> {
        let host = self.shared.host.as_ref();
        let giveable = flags.contains(MapFlags::SHARED);
        let mut guard = self.lock();
        let store = &mut *guard;

        // Anonymous mappings always get their own reservation; overlap
        // resolution never applies to them.
        let obj = MemObject::new_anon(host, len, giveable)?;
        let base = obj.base();
        let oid = ObjectId(store.objects.insert(obj));
        let delta =
            store
                .proc_mut(self.pid)
                .table
                .insert_new(base.as_ptr() as usize, base.as_ptr() as usize + len, prot, flags, oid, None);
        store.apply_deltas(&[delta]);
        tracing::debug!(pid = self.pid.0, addr = base.as_ptr() as usize, len, giveable, "mapped anonymous region");
        Ok(base)
    }

    fn map_file(
        &self,
        desc: &FileDesc,
        len: usize,
        prot: Prot,
        flags: MapFlags,
        offset: u64,
    ) -> Result<NonNull<u8>> {
        let host = self.shared.host.as_ref();
        let page = host.page_size();
        let shared_class = flags.contains(MapFlags::SHARED);
        let key = desc.key();
        let file_size = desc.size()?;

        let mut guard = self.lock();
        let store = &mut *guard;

        // Resolve the (file, class) mapping state, creating it if absent.
        let (map_id, created_map) = match store.registry.find(self.pid, key, shared_class) {
            Some(id) => {
                store.file_map_mut(id).file_size = file_size;
                (id, false)
            }
            None => {
                let id = FileMapId(store.file_maps.insert(FileMapping::new(
                    shared_class,
                    self.pid,
                    key,
                    file_size,
                )));
                store.registry.set(self.pid, key, shared_class, id);
                (id, true)
            }
        };

        // Reuse a reservation that fully contains the window, else reserve
        // a new object at the head of the list.
        let existing = store
            .file_map(map_id)
            .objects
            .iter()
            .copied()
            .find(|&oid| store.object(oid).covers_file_range(offset, len));
        let (obj_id, created_obj) = match existing {
            Some(oid) => (oid, false),
            None => {
                // The first object spans the whole file so that disjoint
                // windows of it share one reservation; later objects are
                // sized to their request.
                let file_span = usize::try_from(file_size)
                    .ok()
                    .and_then(|s| page_align_up(s, page));
                let (obj_off, obj_len) = match (created_map, file_span) {
                    (true, Some(span)) => (0u64, span.max(offset as usize + len)),
                    _ => (offset, len),
                };
                let obj = match MemObject::new_file(host, map_id, obj_off, obj_len) {
                    Ok(obj) => obj,
                    Err(err) => {
                        unwind_map(store, map_id, created_map);
                        return Err(Error::OutOfMemory(format!(
                            "memory object reservation failed: {err}"
                        )));
                    }
                };
                let oid = ObjectId(store.objects.insert(obj));
                store.file_map_mut(map_id).push_newest(oid);
                (oid, true)
            }
        };

        // One duplicated handle per (process, file). Private mappings keep
        // the duplicate out of inherited descriptor tables.
        let handle_id = {
            let found = store
                .procs
                .get(&self.pid)
                .and_then(|p| p.handle_index.get(&key).copied());
            match found {
                Some(hid) => hid,
                None => match FileHandle::duplicate(desc.as_fd(), key, shared_class) {
                    Ok(handle) => {
                        let hid = HandleId(store.handles.insert(handle));
                        store.proc_mut(self.pid).handle_index.insert(key, hid);
                        hid
                    }
                    Err(err) => {
                        unwind_object(store, host, map_id, obj_id, created_obj, created_map);
                        return Err(err);
                    }
                },
            }
        };

        // Size the dirty map up front for shared writable windows.
        if shared_class && prot.contains(Prot::WRITE) {
            let pages_needed = (offset as usize + len) / page;
            store.handle_mut(handle_id).dirty.grow(pages_needed);
        }

        let cand = {
            let obj = store.object(obj_id);
            let (obj_off, _) = obj
                .file_window()
                .expect("file object without a file window");
            obj.base_addr() + (offset - obj_off) as usize
        };

        let proc_ = store.proc_mut(self.pid);
        let deltas = if created_obj {
            vec![proc_
                .table
                .insert_new(cand, cand + len, prot, flags, obj_id, Some(handle_id))]
        } else {
            proc_
                .table
                .place(cand, cand + len, prot, flags, obj_id, Some(handle_id))
        };
        store.apply_deltas(&deltas);

        tracing::debug!(
            pid = self.pid.0,
            addr = cand,
            len,
            offset,
            shared = shared_class,
            "mapped file window"
        );
        NonNull::new(cand as *mut u8)
            .ok_or_else(|| Error::OutOfMemory("mapping resolved to null".into()))
    }

    /// Remove mappings in `[addr, addr + len)`.
    ///
    /// A range with no matching mapping is a defined no-op success. Dirty
    /// pages of released shared writable regions are written back first.
    pub fn munmap(&self, addr: NonNull<u8>, len: usize) -> Result<()> {
        let host = self.shared.host.as_ref();
        let page = host.page_size();
        let start = addr.as_ptr() as usize;
        if !is_page_aligned(start, page) {
            return Err(Error::InvalidArgument("address not page-aligned"));
        }
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length unmap"));
        }
        let len = page_align_up(len, page).ok_or(Error::Overflow)?;
        let end = start.checked_add(len).ok_or(Error::Overflow)?;

        let mut guard = self.lock();
        let store = &mut *guard;
        let cut = store.proc_mut(self.pid).table.cut(start, end);
        if !cut.freed.is_empty() || !cut.deltas.is_empty() {
            tracing::debug!(pid = self.pid.0, start, len, freed = cut.freed.len(), "unmapped range");
        }
        store.release_cut(host, self.pid, cut)
    }

    /// Change the protection of whole anonymous mappings in the range.
    ///
    /// File-backed mappings are rejected: their protection bits carry the
    /// demand-paging and dirty-tracking bookkeeping. Partial-mapping
    /// changes are rejected as well.
    pub fn mprotect(&self, addr: NonNull<u8>, len: usize, prot: Prot) -> Result<()> {
        let host = self.shared.host.as_ref();
        let page = host.page_size();
        let start = addr.as_ptr() as usize;
        if !is_page_aligned(start, page) {
            return Err(Error::InvalidArgument("address not page-aligned"));
        }
        if len == 0 {
            return Ok(());
        }
        let len = page_align_up(len, page).ok_or(Error::Overflow)?;
        let end = start.checked_add(len).ok_or(Error::Overflow)?;

        let mut guard = self.lock();
        let store = &mut *guard;

        // Validate before touching anything.
        let targets = {
            let table = &store.proc_mut(self.pid).table;
            let (i0, i1) = table.overlap_range(start, end);
            let nodes = table.nodes();
            let mut cursor = start;
            let mut targets = Vec::new();
            for node in &nodes[i0..i1] {
                if !node.flags.contains(MapFlags::ANON) {
                    return Err(Error::AccessDenied(
                        "protection changes are limited to anonymous mappings",
                    ));
                }
                if node.start < start || node.end > end {
                    return Err(Error::AccessDenied(
                        "protection changes must cover whole mappings",
                    ));
                }
                if node.start > cursor {
                    return Err(Error::InvalidArgument("unmapped pages in range"));
                }
                cursor = node.end;
                targets.push((node.backing.object, node.start, node.end));
            }
            if cursor < end {
                return Err(Error::InvalidArgument("unmapped pages in range"));
            }
            (i0, i1, targets)
        };
        let (i0, i1, targets) = targets;

        // Host change first, then record the new logical protection.
        for &(oid, nstart, nend) in &targets {
            store.reprotect_committed(host, oid, nstart, nend, prot)?;
        }
        let table = &mut store.proc_mut(self.pid).table;
        for idx in i0..i1 {
            table.node_mut(idx).prot = prot;
        }
        Ok(())
    }

    /// Advise the layer about expected access patterns.
    ///
    /// Only [`Advice::DontNeed`] changes state: committed pages of private
    /// and anonymous mappings are decommitted. Shared pages cannot be
    /// decommitted on this host and yield `InvalidArgument`.
    pub fn madvise(&self, addr: NonNull<u8>, len: usize, advice: Advice) -> Result<()> {
        let host = self.shared.host.as_ref();
        let page = host.page_size();
        let start = addr.as_ptr() as usize;
        if !is_page_aligned(start, page) {
            return Err(Error::InvalidArgument("address not page-aligned"));
        }
        if len == 0 || advice != Advice::DontNeed {
            return Ok(());
        }
        let len = page_align_up(len, page).ok_or(Error::Overflow)?;
        let end = start.checked_add(len).ok_or(Error::Overflow)?;

        let mut guard = self.lock();
        let store = &mut *guard;

        let targets = {
            let table = &store.proc_mut(self.pid).table;
            let (i0, i1) = table.overlap_range(start, end);
            let nodes = &table.nodes()[i0..i1];
            for node in nodes {
                if node.flags.contains(MapFlags::SHARED) {
                    return Err(Error::InvalidArgument(
                        "shared pages cannot be decommitted",
                    ));
                }
            }
            nodes
                .iter()
                .map(|n| (n.backing.object, n.start.max(start), n.end.min(end)))
                .collect::<Vec<_>>()
        };
        for (oid, lo, hi) in targets {
            store.decommit_committed(host, oid, lo, hi)?;
        }
        Ok(())
    }

    /// POSIX advisory variant: validates its arguments and changes nothing.
    /// Its semantics must not alter access behavior.
    pub fn posix_madvise(&self, addr: NonNull<u8>, _len: usize, _advice: Advice) -> Result<()> {
        let page = self.shared.host.page_size();
        if !is_page_aligned(addr.as_ptr() as usize, page) {
            return Err(Error::InvalidArgument("address not page-aligned"));
        }
        Ok(())
    }

    /// Write dirty pages of shared writable file mappings in the range back
    /// to their files.
    ///
    /// [`MsyncFlags::Sync`] flushes inline before returning;
    /// [`MsyncFlags::Async`] schedules the debounced background pass.
    pub fn msync(&self, addr: NonNull<u8>, len: usize, flags: MsyncFlags) -> Result<()> {
        let host = self.shared.host.as_ref();
        let page = host.page_size();
        let start = addr.as_ptr() as usize;
        if !is_page_aligned(start, page) {
            return Err(Error::InvalidArgument("address not page-aligned"));
        }
        if len == 0 {
            return Ok(());
        }
        let len = page_align_up(len, page).ok_or(Error::Overflow)?;
        let end = start.checked_add(len).ok_or(Error::Overflow)?;

        let mut guard = self.lock();
        let store = &mut *guard;
        let nodes: Vec<Mapping> = {
            let table = &store.proc_mut(self.pid).table;
            let (i0, i1) = table.overlap_range(start, end);
            table.nodes()[i0..i1]
                .iter()
                .filter(|n| n.needs_writeback())
                .cloned()
                .collect()
        };
        if nodes.is_empty() {
            return Ok(());
        }
        match flags {
            MsyncFlags::Sync => {
                for node in &nodes {
                    flush::flush_node_range(store, host, node, Some((start, end)))?;
                }
            }
            MsyncFlags::Async => {
                flush::schedule(&self.shared, store, self.pid);
            }
        }
        Ok(())
    }

    /// Resolve a page fault reported by the host for `addr`.
    ///
    /// Called synchronously from the embedder's trap glue, in the faulting
    /// thread. `Ok(Resolved)` means retry the faulting instruction;
    /// `Ok(Fatal)` means no permitted mapping backs the address and the
    /// fault must propagate. `Err` reports an allocation failure during
    /// resolution.
    pub fn resolve_fault(&self, addr: usize, access: Access) -> Result<FaultDisposition> {
        fault::resolve(&self.shared, self.pid, addr, access)
    }

    /// Snapshot of this process's regions, sorted by address.
    pub fn regions(&self) -> Vec<RegionInfo> {
        let guard = self.lock();
        let Some(proc_) = guard.procs.get(&self.pid) else {
            return Vec::new();
        };
        proc_
            .table
            .nodes()
            .iter()
            .map(|n| RegionInfo {
                start: n.start,
                end: n.end,
                prot: n.prot,
                flags: n.flags,
                usage: n.backing.usage,
            })
            .collect()
    }

    /// Usage counters for this process.
    pub fn stats(&self) -> SpaceStats {
        let guard = self.lock();
        let Some(proc_) = guard.procs.get(&self.pid) else {
            return SpaceStats::default();
        };
        let mut seen = Vec::new();
        let mut committed = 0usize;
        for node in proc_.table.nodes() {
            let oid = node.backing.object;
            if !seen.contains(&oid) {
                seen.push(oid);
                committed += guard
                    .object(oid)
                    .pages
                    .iter()
                    .filter(|s| s.is_committed())
                    .count();
            }
        }
        let dirty = proc_
            .handle_index
            .values()
            .map(|&hid| guard.handle(hid).dirty.count())
            .sum();
        SpaceStats {
            regions: proc_.table.nodes().len(),
            committed_pages: committed,
            dirty_pages: dirty,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let host = self.shared.host.as_ref();
        let worker = {
            let Ok(mut guard) = self.shared.state.lock() else {
                return;
            };
            let store = &mut *guard;
            let Some(mut proc_) = store.procs.remove(&self.pid) else {
                return;
            };
            let cut = proc_.table.drain_all();
            for node in &cut.freed {
                if node.needs_writeback() {
                    let _ = flush::flush_node_range(store, host, node, None);
                }
            }
            let (dead_objects, dead_handles) = store.apply_deltas(&cut.deltas);
            for oid in dead_objects {
                store.destroy_object(host, oid);
            }
            for hid in dead_handles {
                let _ = store.handles.remove(hid.0);
            }
            (proc_.flush_tx.take(), proc_.flush_worker.take())
        };
        if let (Some(tx), worker) = worker {
            let _ = tx.send(FlushMsg::Shutdown);
            if let Some(worker) = worker {
                let _ = worker.join();
            }
        }
    }
}

impl Store {
    /// Re-protect the committed pages of `[lo, hi)` inside `oid`, recording
    /// the matching page states. Uncommitted pages are untouched; they
    /// commit later with the mapping's protection.
    fn reprotect_committed(
        &mut self,
        host: &dyn HostMem,
        oid: ObjectId,
        lo: usize,
        hi: usize,
        prot: Prot,
    ) -> Result<()> {
        let page = host.page_size();
        let base = self.object(oid).base_addr();
        let pg_lo = (lo - base) / page;
        let pg_hi = (hi - base) / page;
        let committed_state = if prot.contains(Prot::WRITE) {
            PageState::CommittedRw
        } else {
            PageState::CommittedRo
        };
        let mut run_start: Option<usize> = None;
        for idx in pg_lo..=pg_hi {
            let committed = idx < pg_hi && self.object(oid).pages[idx].is_committed();
            match (committed, run_start) {
                (true, None) => run_start = Some(idx),
                (false, Some(run)) => {
                    let ptr = self.object(oid).page_ptr(run, page);
                    host.protect(ptr, (idx - run) * page, prot)?;
                    for state in &mut self.object_mut(oid).pages[run..idx] {
                        *state = committed_state;
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Decommit the committed pages of `[lo, hi)` inside `oid`.
    fn decommit_committed(
        &mut self,
        host: &dyn HostMem,
        oid: ObjectId,
        lo: usize,
        hi: usize,
    ) -> Result<()> {
        let page = host.page_size();
        let (base, mut run_start): (usize, Option<usize>) = (self.object(oid).base_addr(), None);
        let pg_lo = (lo - base) / page;
        let pg_hi = (hi - base) / page;
        for idx in pg_lo..=pg_hi {
            let committed =
                idx < pg_hi && self.object(oid).pages[idx].is_committed();
            match (committed, run_start) {
                (true, None) => run_start = Some(idx),
                (false, Some(run)) => {
                    let ptr = self.object(oid).page_ptr(run, page);
                    host.decommit(ptr, (idx - run) * page)?;
                    for state in &mut self.object_mut(oid).pages[run..idx] {
                        *state = PageState::Reserved;
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn unwind_map(store: &mut Store, map_id: FileMapId, created_map: bool) {
    if created_map {
        let fm = store.file_maps.remove(map_id.0);
        store.registry.clear(fm.owner, fm.key, fm.shared);
    }
}

fn unwind_object(
    store: &mut Store,
    host: &dyn HostMem,
    map_id: FileMapId,
    obj_id: ObjectId,
    created_obj: bool,
    created_map: bool,
) {
    if created_obj {
        store.file_map_mut(map_id).remove_object(obj_id);
        let obj = store.objects.remove(obj_id.0);
        // SAFETY: freshly reserved; nothing references it yet.
        unsafe {
            let _ = host.release(obj.base(), obj.len());
        }
    }
    unwind_map(store, map_id, created_map);
}
