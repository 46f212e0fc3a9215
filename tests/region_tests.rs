//! Region-table behavior through the public surface: splitting, merging,
//! usage counting, and argument validation.

use mirage::prelude::*;
use mirage::vm::{RegionInfo, StoreOptions};
use std::path::PathBuf;
use std::ptr::NonNull;
use std::time::Duration;

fn page_size() -> usize {
    SystemHost::new().page_size()
}

fn test_store() -> MapStore {
    MapStore::with_options(StoreOptions {
        flush_debounce: Duration::from_millis(25),
        host: None,
    })
}

fn temp_file(name: &str, pages: usize) -> PathBuf {
    let path = std::env::temp_dir().join(format!("mirage-region-{}-{}", name, std::process::id()));
    let page = page_size();
    let mut content = vec![0u8; pages * page];
    for (i, chunk) in content.chunks_mut(page).enumerate() {
        chunk.fill(i as u8 + 1);
    }
    std::fs::write(&path, &content).unwrap();
    path
}

/// Sortedness and disjointness must hold at every quiescent point.
fn assert_well_formed(regions: &[RegionInfo]) {
    for r in regions {
        assert!(r.start < r.end);
    }
    for pair in regions.windows(2) {
        assert!(
            pair[0].end <= pair[1].start,
            "regions out of order or overlapping: {pair:?}"
        );
    }
}

fn nn(addr: usize) -> NonNull<u8> {
    NonNull::new(addr as *mut u8).unwrap()
}

// ============================================================================
// Region algebra on one shared object
// ============================================================================

#[test]
fn test_three_disjoint_windows_and_full_unmap() {
    let page = page_size();
    let path = temp_file("disjoint", 10);
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();
    let file = FileDesc::open(&path).unwrap();

    let prot = Prot::READ | Prot::WRITE;
    let a1 = space
        .mmap(0, page, prot, MapFlags::SHARED, Some(&file), page as u64)
        .unwrap();
    let a9 = space
        .mmap(0, page, prot, MapFlags::SHARED, Some(&file), 9 * page as u64)
        .unwrap();
    let a5 = space
        .mmap(0, 2 * page, prot, MapFlags::SHARED, Some(&file), 5 * page as u64)
        .unwrap();

    // All three windows share the whole-file object, so their addresses
    // keep the file-offset geometry.
    let base = a1.as_ptr() as usize - page;
    assert_eq!(a9.as_ptr() as usize, base + 9 * page);
    assert_eq!(a5.as_ptr() as usize, base + 5 * page);

    let regions = space.regions();
    assert_well_formed(&regions);
    assert_eq!(regions.len(), 3);
    assert!(regions.iter().all(|r| r.usage == 1));

    // One unmap over the whole ten-page span removes all three.
    space.munmap(nn(base), 10 * page).unwrap();
    assert!(space.regions().is_empty());

    drop(space);
    drop(file);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_double_map_resolves_to_one_region() {
    let page = page_size();
    let path = temp_file("double", 10);
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();
    let file = FileDesc::open(&path).unwrap();

    let prot = Prot::READ | Prot::WRITE;
    let first = space
        .mmap(0, 6 * page, prot, MapFlags::SHARED, Some(&file), 0)
        .unwrap();
    let second = space
        .mmap(0, 6 * page, prot, MapFlags::SHARED, Some(&file), 0)
        .unwrap();
    assert_eq!(first, second);

    let regions = space.regions();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].usage, 2);

    space.munmap(first, 6 * page).unwrap();
    let regions = space.regions();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].usage, 1);

    space.munmap(first, 6 * page).unwrap();
    assert!(space.regions().is_empty());

    drop(space);
    drop(file);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_spanning_map_alternates_usage_and_unmap_restores() {
    let page = page_size();
    let path = temp_file("spanning", 6);
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();
    let file = FileDesc::open(&path).unwrap();

    let prot = Prot::READ | Prot::WRITE;
    let a12 = space
        .mmap(0, 2 * page, prot, MapFlags::SHARED, Some(&file), page as u64)
        .unwrap();
    let a45 = space
        .mmap(0, 2 * page, prot, MapFlags::SHARED, Some(&file), 4 * page as u64)
        .unwrap();
    let base = a12.as_ptr() as usize - page;
    assert_eq!(a45.as_ptr() as usize, base + 4 * page);

    // Span pages [0-4]: both ends partially overlap, the gap at page 3 is
    // filled with a clone.
    let a04 = space
        .mmap(0, 5 * page, prot, MapFlags::SHARED, Some(&file), 0)
        .unwrap();
    assert_eq!(a04.as_ptr() as usize, base);

    let regions = space.regions();
    assert_well_formed(&regions);
    let usages: Vec<u32> = regions.iter().map(|r| r.usage).collect();
    assert_eq!(usages, vec![1, 2, 1, 2, 1]);
    let starts: Vec<usize> = regions.iter().map(|r| (r.start - base) / page).collect();
    assert_eq!(starts, vec![0, 1, 3, 4, 5]);

    // Unmapping the big region restores the original two small ones.
    space.munmap(a04, 5 * page).unwrap();
    let regions = space.regions();
    assert_well_formed(&regions);
    assert_eq!(regions.len(), 2);
    assert!(regions.iter().all(|r| r.usage == 1));
    assert_eq!(regions[0].start, a12.as_ptr() as usize);
    assert_eq!(regions[0].end, a12.as_ptr() as usize + 2 * page);
    assert_eq!(regions[1].start, a45.as_ptr() as usize);
    assert_eq!(regions[1].end, a45.as_ptr() as usize + 2 * page);

    drop(space);
    drop(file);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_interior_unmap_splits_into_remainders() {
    let page = page_size();
    let path = temp_file("interior", 10);
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();
    let file = FileDesc::open(&path).unwrap();

    let addr = space
        .mmap(
            0,
            10 * page,
            Prot::READ,
            MapFlags::SHARED,
            Some(&file),
            0,
        )
        .unwrap();
    let base = addr.as_ptr() as usize;

    space.munmap(nn(base + 3 * page), 2 * page).unwrap();
    let regions = space.regions();
    assert_well_formed(&regions);
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[0].start, base);
    assert_eq!(regions[0].end, base + 3 * page);
    assert_eq!(regions[1].start, base + 5 * page);
    assert_eq!(regions[1].end, base + 10 * page);

    drop(space);
    drop(file);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_munmap_of_unmapped_range_is_success() {
    let page = page_size();
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();

    // Nothing mapped at all.
    space.munmap(nn(64 * page), 4 * page).unwrap();

    // Disjoint from an existing mapping.
    let addr = space
        .mmap(
            0,
            2 * page,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANON,
            None,
            0,
        )
        .unwrap();
    let far = addr.as_ptr() as usize + 64 * page;
    space.munmap(nn(far), page).unwrap();
    assert_eq!(space.regions().len(), 1);
}

// ============================================================================
// Anonymous mappings
// ============================================================================

#[test]
fn test_anonymous_map_write_and_partial_unmap() {
    let page = page_size();
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();

    let addr = space
        .mmap(
            0,
            4 * page,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANON,
            None,
            0,
        )
        .unwrap();

    // First touch commits a zero page.
    assert_eq!(
        space
            .resolve_fault(addr.as_ptr() as usize, Access::Write)
            .unwrap(),
        FaultDisposition::Resolved
    );
    unsafe {
        assert_eq!(*addr.as_ptr(), 0);
        *addr.as_ptr() = 0x5a;
        assert_eq!(*addr.as_ptr(), 0x5a);
    }

    // Splitting the anonymous region keeps both halves usable; the shared
    // reservation is only released when the last piece goes.
    space
        .munmap(nn(addr.as_ptr() as usize + page), page)
        .unwrap();
    let regions = space.regions();
    assert_well_formed(&regions);
    assert_eq!(regions.len(), 2);
    unsafe {
        assert_eq!(*addr.as_ptr(), 0x5a);
    }

    space.munmap(addr, page).unwrap();
    space
        .munmap(nn(addr.as_ptr() as usize + 2 * page), 2 * page)
        .unwrap();
    assert!(space.regions().is_empty());
}

// ============================================================================
// Argument validation
// ============================================================================

#[test]
fn test_mmap_argument_validation() {
    let page = page_size();
    let path = temp_file("validation", 2);
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();
    let file = FileDesc::open(&path).unwrap();
    let prot = Prot::READ;

    // Zero length.
    assert!(matches!(
        space.mmap(0, 0, prot, MapFlags::SHARED, Some(&file), 0),
        Err(Error::InvalidArgument(_))
    ));
    // Fixed placement is unsupported.
    assert!(matches!(
        space.mmap(
            0,
            page,
            prot,
            MapFlags::SHARED | MapFlags::FIXED,
            Some(&file),
            0
        ),
        Err(Error::InvalidArgument(_))
    ));
    // Class flags: exactly one required.
    assert!(matches!(
        space.mmap(
            0,
            page,
            prot,
            MapFlags::SHARED | MapFlags::PRIVATE,
            Some(&file),
            0
        ),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        space.mmap(0, page, prot, MapFlags::empty(), Some(&file), 0),
        Err(Error::InvalidArgument(_))
    ));
    // Misaligned offset.
    assert!(matches!(
        space.mmap(0, page, prot, MapFlags::SHARED, Some(&file), 1),
        Err(Error::InvalidArgument(_))
    ));
    // Offset arithmetic overflow.
    assert!(matches!(
        space.mmap(0, page, prot, MapFlags::SHARED, Some(&file), u64::MAX - (page as u64 - 1)),
        Err(Error::Overflow)
    ));
    // File-backed mapping without a descriptor.
    assert!(matches!(
        space.mmap(0, page, prot, MapFlags::SHARED, None, 0),
        Err(Error::BadDescriptor(_))
    ));

    // Shared writable mapping of a read-only descriptor.
    let ro = FileDesc::open_readonly(&path).unwrap();
    assert!(matches!(
        space.mmap(
            0,
            page,
            Prot::READ | Prot::WRITE,
            MapFlags::SHARED,
            Some(&ro),
            0
        ),
        Err(Error::AccessDenied(_))
    ));
    // A private writable mapping of the same descriptor is fine.
    space
        .mmap(
            0,
            page,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE,
            Some(&ro),
            0
        )
        .unwrap();

    // Failed calls left no state behind (besides the one private map).
    assert_eq!(space.regions().len(), 1);

    drop(space);
    drop(file);
    drop(ro);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_munmap_argument_validation() {
    let page = page_size();
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();

    assert!(matches!(
        space.munmap(nn(page + 1), page),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        space.munmap(nn(page), 0),
        Err(Error::InvalidArgument(_))
    ));
}

// ============================================================================
// mprotect
// ============================================================================

#[test]
fn test_mprotect_whole_anonymous_mapping() {
    let page = page_size();
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();

    let addr = space
        .mmap(
            0,
            2 * page,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANON,
            None,
            0,
        )
        .unwrap();
    space
        .resolve_fault(addr.as_ptr() as usize, Access::Write)
        .unwrap();
    unsafe { *addr.as_ptr() = 9 };

    // Drop write access: a write fault is now fatal.
    space.mprotect(addr, 2 * page, Prot::READ).unwrap();
    assert_eq!(
        space
            .resolve_fault(addr.as_ptr() as usize, Access::Write)
            .unwrap(),
        FaultDisposition::Fatal
    );
    unsafe { assert_eq!(*addr.as_ptr(), 9) };

    // Restore write access.
    space
        .mprotect(addr, 2 * page, Prot::READ | Prot::WRITE)
        .unwrap();
    assert_eq!(
        space
            .resolve_fault(addr.as_ptr() as usize, Access::Write)
            .unwrap(),
        FaultDisposition::Resolved
    );
    unsafe { *addr.as_ptr() = 10 };
}

#[test]
fn test_mprotect_rejects_file_backed_and_partial() {
    let page = page_size();
    let path = temp_file("mprotect", 4);
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();
    let file = FileDesc::open(&path).unwrap();

    let mapped = space
        .mmap(
            0,
            2 * page,
            Prot::READ,
            MapFlags::SHARED,
            Some(&file),
            0,
        )
        .unwrap();
    assert!(matches!(
        space.mprotect(mapped, 2 * page, Prot::READ | Prot::WRITE),
        Err(Error::AccessDenied(_))
    ));

    let anon = space
        .mmap(
            0,
            4 * page,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANON,
            None,
            0,
        )
        .unwrap();
    // Covering only part of the mapping is rejected.
    assert!(matches!(
        space.mprotect(anon, page, Prot::READ),
        Err(Error::AccessDenied(_))
    ));
    // An unmapped range is rejected too.
    let hole = anon.as_ptr() as usize + 64 * page;
    assert!(matches!(
        space.mprotect(nn(hole), page, Prot::READ),
        Err(Error::InvalidArgument(_))
    ));

    drop(space);
    drop(file);
    std::fs::remove_file(&path).unwrap();
}

// ============================================================================
// madvise
// ============================================================================

#[test]
fn test_madvise_dontneed_decommits_private_pages() {
    let page = page_size();
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();

    let addr = space
        .mmap(
            0,
            2 * page,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANON,
            None,
            0,
        )
        .unwrap();
    space
        .resolve_fault(addr.as_ptr() as usize, Access::Write)
        .unwrap();
    unsafe { *addr.as_ptr() = 77 };

    space.madvise(addr, page, Advice::DontNeed).unwrap();

    // The page rematerializes zero-filled on the next touch.
    assert_eq!(
        space
            .resolve_fault(addr.as_ptr() as usize, Access::Read)
            .unwrap(),
        FaultDisposition::Resolved
    );
    unsafe { assert_eq!(*addr.as_ptr(), 0) };
}

#[test]
fn test_madvise_dontneed_rejects_shared() {
    let page = page_size();
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();

    let addr = space
        .mmap(
            0,
            page,
            Prot::READ | Prot::WRITE,
            MapFlags::SHARED | MapFlags::ANON,
            None,
            0,
        )
        .unwrap();
    assert!(matches!(
        space.madvise(addr, page, Advice::DontNeed),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_posix_madvise_is_a_noop() {
    let page = page_size();
    let store = test_store();
    let space = store.attach(Pid(1)).unwrap();

    let addr = space
        .mmap(
            0,
            page,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANON,
            None,
            0,
        )
        .unwrap();
    space
        .resolve_fault(addr.as_ptr() as usize, Access::Write)
        .unwrap();
    unsafe { *addr.as_ptr() = 42 };

    // The advisory variant validates but never changes access behavior.
    space
        .posix_madvise(addr, page, Advice::DontNeed)
        .unwrap();
    unsafe { assert_eq!(*addr.as_ptr(), 42) };

    assert!(matches!(
        space.posix_madvise(nn(page + 3), page, Advice::Normal),
        Err(Error::InvalidArgument(_))
    ));
}
