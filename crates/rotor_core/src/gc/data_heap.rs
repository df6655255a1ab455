//! The data heap: one owned segment holding all three generations,
//! plus the card/deck tables that cover it.
//!
//! Segment layout, low to high:
//!
//! ```text
//! [ tenured | aging A | aging B | nursery ]
//! ```
//!
//! Keeping every generation inside one segment lets a single card table
//! index by `(addr - segment_start) >> CARD_BITS` regardless of which
//! generation the address belongs to.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use crate::gc::bump::BumpAllocator;
use crate::gc::cards::{CardTable, CARD_SIZE};
use crate::gc::free_list::FreeListAllocator;
use crate::gc::object_start_map::ObjectStartMap;
use crate::objects::cell::DATA_ALIGNMENT;
use crate::objects::header::Object;
use crate::objects::kinds::object_size;

/// An owned, fixed-size raw allocation.
pub struct MemoryRegion {
    base: *mut u8,
    capacity: usize,
}

impl MemoryRegion {
    /// Allocate `capacity` zeroed bytes.
    ///
    /// # Panics
    /// Panics if the system allocator fails; the VM cannot start
    /// without its heap.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "region capacity must be non-zero");
        let layout =
            Layout::from_size_align(capacity, DATA_ALIGNMENT).expect("valid region layout");
        // SAFETY: layout has non-zero size and power-of-two alignment.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "heap region allocation failed");
        MemoryRegion { base, capacity }
    }

    #[inline]
    pub fn base_addr(&self) -> usize {
        self.base as usize
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if !self.base.is_null() {
            let layout = Layout::from_size_align(self.capacity, DATA_ALIGNMENT)
                .expect("valid region layout");
            // SAFETY: base was allocated with this layout in `new`.
            unsafe { dealloc(self.base, layout) };
        }
    }
}

/// An aging semispace: a bump region plus its object-start map.
pub struct AgingSpace {
    pub allocator: BumpAllocator,
    pub starts: ObjectStartMap,
}

impl AgingSpace {
    pub fn new(start: usize, size: usize) -> Self {
        AgingSpace {
            allocator: BumpAllocator::new(start, size),
            starts: ObjectStartMap::new(start, size),
        }
    }

    /// Bump-allocate, recording the object start for card scans.
    pub fn allot(&mut self, size: usize) -> Option<*mut Object> {
        let obj = self.allocator.allot(size)?;
        self.starts.record_object_start(obj as usize);
        Some(obj)
    }

    #[inline]
    pub fn contains(&self, obj: *const Object) -> bool {
        self.allocator.contains(obj)
    }

    /// Address of the next object after the one at `scan`, or 0 at the
    /// allocation frontier.
    ///
    /// # Safety
    /// `scan` must be the address of a live object in this space.
    pub unsafe fn next_object_after(&self, scan: usize) -> usize {
        let next = scan + object_size(scan as *const Object);
        if next < self.allocator.here {
            next
        } else {
            0
        }
    }

    pub fn flush(&mut self) {
        self.allocator.flush();
        self.starts.clear();
    }
}

/// The tenured generation: a free-list allocator plus its object-start
/// map.
pub struct TenuredSpace {
    pub allocator: FreeListAllocator,
    pub starts: ObjectStartMap,
}

impl TenuredSpace {
    pub fn new(start: usize, size: usize) -> Self {
        TenuredSpace {
            allocator: FreeListAllocator::new(start, size),
            starts: ObjectStartMap::new(start, size),
        }
    }

    /// Allocate from the free lists, recording the object start.
    pub fn allot(&mut self, size: usize) -> Option<*mut Object> {
        let obj = self.allocator.allot(size)?;
        self.starts.record_object_start(obj as usize);
        Some(obj)
    }

    #[inline]
    pub fn contains(&self, obj: *const Object) -> bool {
        self.allocator.contains(obj)
    }

    /// First allocated (non-free) address at or after `scan`, or 0 at
    /// the end of the space.
    ///
    /// # Safety
    /// Every byte of the space must be covered by valid object or
    /// free-block headers.
    pub unsafe fn next_allocated_object_after(&self, mut scan: usize) -> usize {
        while scan != self.allocator.end && (*(scan as *const Object)).header.is_free() {
            scan += (*(scan as *const Object)).header.free_size();
        }
        if scan == self.allocator.end {
            0
        } else {
            scan
        }
    }

    /// First object in the space, or 0 when empty.
    ///
    /// # Safety
    /// As [`next_allocated_object_after`][Self::next_allocated_object_after].
    pub unsafe fn first_object(&self) -> usize {
        self.next_allocated_object_after(self.allocator.start)
    }

    /// Next object after the one at `scan`, skipping free blocks.
    ///
    /// # Safety
    /// `scan` must be the address of a live object in this space.
    pub unsafe fn next_object_after(&self, scan: usize) -> usize {
        self.next_allocated_object_after(scan + object_size(scan as *const Object))
    }

    /// Rebuild the object-start map by walking the whole space.  Called
    /// after sweep and compaction invalidate recorded starts.
    ///
    /// # Safety
    /// As [`next_allocated_object_after`][Self::next_allocated_object_after].
    pub unsafe fn rebuild_starts(&mut self) {
        self.starts.clear();
        let mut scan = self.first_object();
        while scan != 0 {
            self.starts.record_object_start(scan);
            scan = self.next_object_after(scan);
        }
    }
}

/// Occupancy snapshot of the whole data heap.
#[derive(Debug, Clone, Copy)]
pub struct DataHeapRoom {
    pub nursery_occupied: usize,
    pub nursery_size: usize,
    pub aging_occupied: usize,
    pub aging_size: usize,
    pub tenured_occupied: usize,
    pub tenured_size: usize,
    pub tenured_contiguous_free: usize,
}

pub struct DataHeap {
    /// Backing allocation; freed when the heap drops.
    pub seg: MemoryRegion,
    pub start: usize,
    pub size: usize,
    pub cards: CardTable,
    pub nursery: BumpAllocator,
    pub aging: AgingSpace,
    pub aging_semispace: AgingSpace,
    pub tenured: TenuredSpace,
}

impl DataHeap {
    /// Create a heap with the given generation sizes (each rounded up
    /// to a whole number of cards).
    pub fn new(young_size: usize, aging_size: usize, tenured_size: usize) -> Self {
        let young_size = round_to_cards(young_size);
        let aging_size = round_to_cards(aging_size);
        let tenured_size = round_to_cards(tenured_size);
        let total = tenured_size + 2 * aging_size + young_size;

        let seg = MemoryRegion::new(total);
        let start = seg.base_addr();

        let tenured = TenuredSpace::new(start, tenured_size);
        let aging_a = AgingSpace::new(start + tenured_size, aging_size);
        let aging_b = AgingSpace::new(start + tenured_size + aging_size, aging_size);
        let nursery = BumpAllocator::new(start + tenured_size + 2 * aging_size, young_size);

        DataHeap {
            cards: CardTable::new(start, total),
            seg,
            start,
            size: total,
            nursery,
            aging: aging_a,
            aging_semispace: aging_b,
            tenured,
        }
    }

    /// The amount of young-generation data tenured space must be able
    /// to absorb contiguously (invariant: collections terminate at or
    /// before grow).
    #[inline]
    pub fn high_water_mark(&self) -> usize {
        self.nursery.size + self.aging.allocator.size
    }

    /// Free tenured space exists but not contiguously: a compaction is
    /// needed before the next young promotion can be guaranteed.
    pub fn high_fragmentation_p(&self) -> bool {
        self.tenured.allocator.largest_free_block() < self.high_water_mark()
    }

    /// Even a full collection cannot restore headroom: the heap must
    /// grow.
    pub fn low_memory_p(&self) -> bool {
        self.tenured.allocator.free_space() < 2 * self.high_water_mark()
    }

    pub fn reset_nursery(&mut self) {
        self.nursery.flush();
    }

    pub fn reset_aging(&mut self) {
        self.aging.flush();
    }

    /// Swap the live and scratch aging semispaces.
    pub fn swap_aging_semispaces(&mut self) {
        std::mem::swap(&mut self.aging, &mut self.aging_semispace);
    }

    /// True when `obj` lies inside the allocated portion of some
    /// generation.  Dirty-card walks visit the slots of dead objects
    /// too, and a dead slot can hold a pointer into space that a
    /// previous collection flushed; without guard pages this range test
    /// is what rejects such stale pointers before they are chased.
    pub fn contains_allocated(&self, obj: *const Object) -> bool {
        self.nursery.contains_allocated(obj)
            || self.aging.allocator.contains_allocated(obj)
            || self.aging_semispace.allocator.contains_allocated(obj)
            || self.tenured.contains(obj)
    }

    /// Clear every remembered-set bit; valid once the young generations
    /// are empty (no old-to-young edge can exist).
    pub fn clear_all_cards(&mut self) {
        self.cards.clear_all();
    }

    /// Clear card bits over the young region (both aging semispaces and
    /// the nursery).  Valid after those spaces have been evacuated.
    pub fn clear_young_cards(&mut self) {
        let young_start = self.start + self.tenured.allocator.size;
        self.cards.clear_range(young_start, self.start + self.size);
    }

    pub fn room(&self) -> DataHeapRoom {
        DataHeapRoom {
            nursery_occupied: self.nursery.occupied_space(),
            nursery_size: self.nursery.size,
            aging_occupied: self.aging.allocator.occupied_space(),
            aging_size: self.aging.allocator.size,
            tenured_occupied: self.tenured.allocator.occupied_space(),
            tenured_size: self.tenured.allocator.size,
            tenured_contiguous_free: self.tenured.allocator.largest_free_block(),
        }
    }

    /// Human-readable layout summary for fatal diagnostics.
    pub fn describe(&self) -> String {
        let r = self.room();
        format!(
            "nursery {}/{} aging {}/{} tenured {}/{} (contiguous free {})",
            r.nursery_occupied,
            r.nursery_size,
            r.aging_occupied,
            r.aging_size,
            r.tenured_occupied,
            r.tenured_size,
            r.tenured_contiguous_free
        )
    }
}

fn round_to_cards(size: usize) -> usize {
    size.div_ceil(CARD_SIZE) * CARD_SIZE
}
