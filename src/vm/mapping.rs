//! The per-process mapping table: a sorted, disjoint list of regions.
//!
//! This is where region algebra happens. Creating a mapping over storage
//! that existing regions already use splits and clones those regions so the
//! requested range aligns exactly with list entries; unmapping trims or
//! removes them and re-merges compatible neighbours. Sortedness and
//! disjointness are hard invariants, checked in debug builds after every
//! mutation.
//!
//! Reference counting uses one rule: an object's (and handle's) user count
//! equals the sum of the usage counters of every region referencing it.
//! Every operation here therefore reports its usage changes as signed
//! [`RefDelta`]s; the caller applies them to the object and handle pools and
//! destroys whatever reaches zero. All fallible work (reservations, handle
//! duplication, file I/O) happens before the table is touched, so the
//! splices themselves never need to roll back.

use crate::vm::page::{MapFlags, Prot};
use crate::vm::slots::{HandleId, ObjectId};

/// Storage reference of one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Backing {
    pub object: ObjectId,
    /// Duplicated file handle; `None` for anonymous regions.
    pub handle: Option<HandleId>,
    /// How many logical `mmap` calls currently resolve to this region.
    pub usage: u32,
}

/// One contiguous mapped range in one process.
#[derive(Debug, Clone)]
pub(crate) struct Mapping {
    pub start: usize,
    pub end: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    pub backing: Backing,
}

impl Mapping {
    fn new(start: usize, end: usize, prot: Prot, flags: MapFlags, backing: Backing) -> Self {
        Self {
            start,
            end,
            prot,
            flags,
            backing,
        }
    }

    /// Clone a sub-range, keeping backing references and usage.
    fn piece(&self, start: usize, end: usize) -> Self {
        debug_assert!(self.start <= start && end <= self.end && start < end);
        Self {
            start,
            end,
            prot: self.prot,
            flags: self.flags,
            backing: self.backing,
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Shared, writable and file-backed: the class whose pages are dirty
    /// tracked and written back.
    pub fn needs_writeback(&self) -> bool {
        self.flags.contains(MapFlags::SHARED)
            && !self.flags.contains(MapFlags::ANON)
            && self.prot.contains(Prot::WRITE)
    }
}

/// A usage change to apply to an object (and optionally handle) user count.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RefDelta {
    pub object: ObjectId,
    pub handle: Option<HandleId>,
    pub amount: i64,
}

/// Result of an unmap walk.
#[derive(Debug, Default)]
pub(crate) struct CutResult {
    pub deltas: Vec<RefDelta>,
    /// Regions whose usage reached zero, removed from the table. The caller
    /// flushes and releases their backing references.
    pub freed: Vec<Mapping>,
}

/// Sorted, disjoint region list of one process.
#[derive(Default)]
pub(crate) struct MappingTable {
    nodes: Vec<Mapping>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Mapping] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The region containing `addr`, if any.
    pub fn find(&self, addr: usize) -> Option<&Mapping> {
        let idx = self.nodes.partition_point(|n| n.end <= addr);
        self.nodes.get(idx).filter(|n| n.contains(addr))
    }

    /// Index window `[i0, i1)` of regions overlapping `[start, end)`.
    pub fn overlap_range(&self, start: usize, end: usize) -> (usize, usize) {
        let i0 = self.nodes.partition_point(|n| n.end <= start);
        let i1 = self.nodes.partition_point(|n| n.start < end);
        (i0, i1)
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut Mapping {
        &mut self.nodes[idx]
    }

    /// Append a region known to sort after everything present. Used when
    /// rebuilding a child table from a parent's already-sorted list.
    pub fn push_back(&mut self, node: Mapping) {
        debug_assert!(self
            .nodes
            .last()
            .map(|last| last.end <= node.start)
            .unwrap_or(true));
        self.nodes.push(node);
    }

    /// Insert a region known not to overlap anything (fresh reservation).
    pub fn insert_new(
        &mut self,
        start: usize,
        end: usize,
        prot: Prot,
        flags: MapFlags,
        object: ObjectId,
        handle: Option<HandleId>,
    ) -> RefDelta {
        let (i0, i1) = self.overlap_range(start, end);
        debug_assert_eq!(i0, i1, "fresh reservation overlaps an existing region");
        self.nodes.insert(
            i0,
            Mapping::new(
                start,
                end,
                prot,
                flags,
                Backing {
                    object,
                    handle,
                    usage: 1,
                },
            ),
        );
        self.check();
        RefDelta {
            object,
            handle,
            amount: 1,
        }
    }

    /// Resolve a mapping request onto existing regions.
    ///
    /// Only reachable when the request reuses an existing memory object, so
    /// every overlapped region is backed by `object`. Handles the fast path
    /// (exact match), the strictly-interior three-way split, and the general
    /// clone-and-fill walk over partial overlaps and gaps.
    pub fn place(
        &mut self,
        start: usize,
        end: usize,
        prot: Prot,
        flags: MapFlags,
        object: ObjectId,
        handle: Option<HandleId>,
    ) -> Vec<RefDelta> {
        debug_assert!(start < end);
        let (i0, i1) = self.overlap_range(start, end);

        if i0 == i1 {
            return vec![self.insert_new(start, end, prot, flags, object, handle)];
        }

        if i1 - i0 == 1 {
            let node = &self.nodes[i0];
            debug_assert_eq!(node.backing.object, object);

            // Fast path: an identical region already exists; it absorbs the
            // new logical mapping.
            if node.start == start && node.end == end {
                let node = &mut self.nodes[i0];
                node.backing.usage += 1;
                node.prot |= prot;
                return vec![RefDelta {
                    object,
                    handle: node.backing.handle,
                    amount: 1,
                }];
            }

            // Strictly interior: split into left remainder, the new region,
            // and a right remainder cloned from the original.
            if node.start < start && end < node.end {
                let n = node.backing.usage;
                let right = node.piece(end, node.end);
                let mut mid = node.piece(start, end);
                mid.backing.usage = n + 1;
                mid.prot |= prot;
                self.nodes[i0].end = start;
                self.nodes.insert(i0 + 1, mid);
                self.nodes.insert(i0 + 2, right);
                self.check();
                return vec![RefDelta {
                    object,
                    handle,
                    amount: 2 * i64::from(n) + 1,
                }];
            }
        }

        // General case: walk the span, bumping covered regions, splitting
        // boundary regions, and filling gaps with fresh clones.
        let mut amount = 0i64;
        let mut cursor = start;
        let mut idx = i0;
        while idx < self.nodes.len() && self.nodes[idx].start < end {
            if self.nodes[idx].start > cursor {
                // Gap inside the span: fill with a fresh region on the same
                // object.
                let gap_end = self.nodes[idx].start;
                self.nodes.insert(
                    idx,
                    Mapping::new(
                        cursor,
                        gap_end,
                        prot,
                        flags,
                        Backing {
                            object,
                            handle,
                            usage: 1,
                        },
                    ),
                );
                amount += 1;
                cursor = gap_end;
                idx += 1;
                continue;
            }
            if self.nodes[idx].start < cursor {
                // First region starts before the span: split at the boundary
                // and continue with the tail.
                debug_assert_eq!(cursor, start);
                let n = self.nodes[idx].backing.usage;
                let tail = self.nodes[idx].piece(cursor, self.nodes[idx].end);
                self.nodes[idx].end = cursor;
                self.nodes.insert(idx + 1, tail);
                amount += i64::from(n);
                idx += 1;
                continue;
            }
            if self.nodes[idx].end > end {
                // Last region runs past the span: split at the boundary, the
                // tail survives untouched.
                let n = self.nodes[idx].backing.usage;
                let tail = self.nodes[idx].piece(end, self.nodes[idx].end);
                self.nodes[idx].end = end;
                self.nodes.insert(idx + 1, tail);
                amount += i64::from(n);
            }
            let node = &mut self.nodes[idx];
            debug_assert_eq!(node.backing.object, object);
            node.backing.usage += 1;
            node.prot |= prot;
            amount += 1;
            cursor = node.end;
            idx += 1;
        }
        if cursor < end {
            self.nodes.insert(
                idx,
                Mapping::new(
                    cursor,
                    end,
                    prot,
                    flags,
                    Backing {
                        object,
                        handle,
                        usage: 1,
                    },
                ),
            );
            amount += 1;
        }
        self.check();
        vec![RefDelta {
            object,
            handle,
            amount,
        }]
    }

    /// Unmap `[start, end)`.
    ///
    /// A range touching no region is a defined no-op. Boundary regions are
    /// trimmed, fully covered regions give back one use each; regions
    /// reaching zero are removed and returned for release. Compatible
    /// neighbours along the cut are re-merged afterwards.
    pub fn cut(&mut self, start: usize, end: usize) -> CutResult {
        let mut result = CutResult::default();
        let (i0, i1) = self.overlap_range(start, end);
        if i0 == i1 {
            return result;
        }

        // Strictly inside one region: split into up to two remainders.
        if i1 - i0 == 1 && self.nodes[i0].start < start && end < self.nodes[i0].end {
            let node = &self.nodes[i0];
            let n = node.backing.usage;
            let backing = node.backing;
            let right = node.piece(end, node.end);
            let mut mid = node.piece(start, end);
            self.nodes[i0].end = start;
            self.nodes.insert(i0 + 1, right);
            result.deltas.push(RefDelta {
                object: backing.object,
                handle: backing.handle,
                amount: 2 * i64::from(n) - 1,
            });
            if n == 1 {
                mid.backing.usage = 0;
                result.freed.push(mid);
            } else {
                mid.backing.usage = n - 1;
                self.nodes.insert(i0 + 1, mid);
            }
            self.coalesce(start, end, &mut result.deltas);
            self.check();
            return result;
        }

        let mut idx = i0;
        while idx < self.nodes.len() && self.nodes[idx].start < end {
            if self.nodes[idx].end <= start {
                idx += 1;
                continue;
            }
            if self.nodes[idx].start < start {
                // Trim the first boundary region; its tail continues below.
                let n = self.nodes[idx].backing.usage;
                let tail = self.nodes[idx].piece(start, self.nodes[idx].end);
                result.deltas.push(RefDelta {
                    object: tail.backing.object,
                    handle: tail.backing.handle,
                    amount: i64::from(n),
                });
                self.nodes[idx].end = start;
                self.nodes.insert(idx + 1, tail);
                idx += 1;
                continue;
            }
            if self.nodes[idx].end > end {
                // The last boundary region starts anew past the cut.
                let n = self.nodes[idx].backing.usage;
                let tail = self.nodes[idx].piece(end, self.nodes[idx].end);
                self.nodes[idx].end = end;
                result.deltas.push(RefDelta {
                    object: tail.backing.object,
                    handle: tail.backing.handle,
                    amount: i64::from(n),
                });
                self.nodes.insert(idx + 1, tail);
            }
            // Fully covered: one logical mapping goes away.
            let node = &mut self.nodes[idx];
            node.backing.usage -= 1;
            result.deltas.push(RefDelta {
                object: node.backing.object,
                handle: node.backing.handle,
                amount: -1,
            });
            if node.backing.usage == 0 {
                result.freed.push(self.nodes.remove(idx));
            } else {
                idx += 1;
            }
        }
        self.coalesce(start, end, &mut result.deltas);
        self.check();
        result
    }

    /// Remove every region, driving all usage to zero. Used at process
    /// teardown.
    pub fn drain_all(&mut self) -> CutResult {
        let mut result = CutResult::default();
        for mut node in self.nodes.drain(..) {
            result.deltas.push(RefDelta {
                object: node.backing.object,
                handle: node.backing.handle,
                amount: -i64::from(node.backing.usage),
            });
            node.backing.usage = 0;
            result.freed.push(node);
        }
        result
    }

    /// Merge neighbours whose junction lies in `[start, end]` and whose
    /// backing, protection, flags and usage are identical. The merged pair
    /// hands back one region's worth of usage.
    fn coalesce(&mut self, start: usize, end: usize, deltas: &mut Vec<RefDelta>) {
        let mut i = 1;
        while i < self.nodes.len() {
            let junction = self.nodes[i].start;
            if junction > end {
                break;
            }
            let a = &self.nodes[i - 1];
            let b = &self.nodes[i];
            let compatible = junction >= start
                && a.end == b.start
                && a.prot == b.prot
                && a.flags == b.flags
                && a.backing == b.backing;
            if compatible {
                deltas.push(RefDelta {
                    object: b.backing.object,
                    handle: b.backing.handle,
                    amount: -i64::from(b.backing.usage),
                });
                self.nodes[i - 1].end = self.nodes[i].end;
                self.nodes.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Debug check of the sortedness/disjointness invariant.
    fn check(&self) {
        if cfg!(debug_assertions) {
            for pair in self.nodes.windows(2) {
                assert!(pair[0].start < pair[0].end);
                assert!(pair[0].end <= pair[1].start, "mapping table out of order");
            }
        }
    }
}
