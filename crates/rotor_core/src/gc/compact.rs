//! Tenured compaction and data-heap growth.
//!
//! Compaction runs on a freshly swept heap: every non-free block is
//! live.  A plan pass records each object's destination (packing them
//! toward the base in address order) together with its size and slot
//! count; the relocate pass rewrites every root and every live slot
//! through the plan; the move pass slides the objects down.  Sizes and
//! slot counts are captured before any slot is rewritten, so the move
//! never reads through a pointer that has already been forwarded.
//!
//! Growth allocates a fresh, larger heap and evacuates every live
//! object into its tenured space, Cheney-style, leaving forwarding
//! pointers in the old segment until it is released.

use crate::gc::data_heap::{DataHeap, TenuredSpace};
use crate::gc::slot_visitor::{Fixup, SlotVisitor};
use crate::objects::cell::align_cell;
use crate::objects::header::{resolve_forwarding, Header, Object};
use crate::objects::kinds::{object_size, slot_count};
use crate::vm::Vm;

/// One planned relocation: `[old, old + size)` moves to `new`.
struct ForwardingEntry {
    old: usize,
    new: usize,
    size: usize,
    slots: usize,
}

/// Rewrites pointers through a forwarding table sorted by old address.
struct RelocateFixup<'plan> {
    plan: &'plan [ForwardingEntry],
}

impl Fixup for RelocateFixup<'_> {
    unsafe fn fixup_object(&mut self, obj: *mut Object) -> *mut Object {
        let addr = obj as usize;
        let index = self.plan.partition_point(|entry| entry.old < addr);
        match self.plan.get(index) {
            Some(entry) if entry.old == addr => entry.new as *mut Object,
            // Not a planned object: an immediate-free slot value that
            // does not point into tenured space (nothing else is live
            // at compaction time).
            _ => obj,
        }
    }
}

/// Full collection followed by compaction.
pub fn collect_compact(vm: &mut Vm) -> (u64, u64) {
    crate::gc::full::collect_mark(vm);
    crate::gc::full::collect_sweep(vm);
    compact_impl(vm);
    (0, 0)
}

/// Slide all live tenured objects to the low end of the space, rewrite
/// every pointer, and reset the free list to the single tail block.
///
/// Precondition: the heap has just been marked and swept, so every
/// non-free tenured block is a live object and no mark bits are set.
pub fn compact_impl(vm: &mut Vm) {
    let start = vm.data.tenured.allocator.start;
    let end = vm.data.tenured.allocator.end;

    // ── Plan ──────────────────────────────────────────────────────────
    let mut plan: Vec<ForwardingEntry> = Vec::new();
    let mut dest = start;
    // SAFETY: a swept heap is fully covered by live-object and
    // free-block headers.
    unsafe {
        let mut scan = start;
        while scan < end {
            let obj = scan as *const Object;
            let size = object_size(obj);
            if !(*obj).header.is_free() {
                plan.push(ForwardingEntry {
                    old: scan,
                    new: dest,
                    size,
                    slots: slot_count(obj),
                });
                dest += size;
            }
            scan += size;
        }
    }

    // ── Relocate ──────────────────────────────────────────────────────
    {
        let fixup = RelocateFixup { plan: &plan };
        let mut visitor = SlotVisitor::new(vm, fixup);
        // SAFETY: the collection owns the VM; slot ranges come from the
        // plan captured above.
        unsafe {
            visitor.visit_all_roots();
            for entry in &plan {
                let slots_base = (entry.old + crate::objects::cell::CELL_BYTES) as *mut _;
                visitor.visit_object_array(
                    slots_base,
                    (entry.old + (1 + entry.slots) * crate::objects::cell::CELL_BYTES) as *mut _,
                );
            }
        }
    }

    // ── Move ──────────────────────────────────────────────────────────
    // Address order guarantees destination ≤ source, so a forward copy
    // never clobbers an unmoved object.
    // SAFETY: each planned range is live and its destination lies
    // within the tenured space.
    unsafe {
        for entry in &plan {
            if entry.old != entry.new {
                std::ptr::copy(
                    entry.old as *const u8,
                    entry.new as *mut u8,
                    entry.size,
                );
            }
        }
    }

    // ── Finalize ──────────────────────────────────────────────────────
    let live = dest - start;
    vm.data.tenured.allocator.initial_free_list(live);
    // SAFETY: the compacted prefix is a contiguous run of live objects.
    unsafe { vm.data.tenured.rebuild_starts() };
}

/// Re-home the data heap into a larger segment: allocate a new heap
/// with twice the tenured space (plus any immediate request), evacuate
/// every live object into it, and release the old segment.
pub fn collect_growing_data_heap(vm: &mut Vm, requested_size: usize) -> (u64, u64) {
    let young_size = vm.config().young_size;
    let aging_size = vm.config().aging_size;
    let grown = vm.data.tenured.allocator.size * 2 + align_cell(requested_size);

    let mut new_data = DataHeap::new(young_size, aging_size, grown);
    {
        let vm_ptr: *const Vm = vm;
        let fixup = GrowCopier {
            new_tenured: &raw mut new_data.tenured,
            mark_stack: &raw mut vm.mark_stack,
            vm: vm_ptr,
        };
        let mut visitor = SlotVisitor::new(vm, fixup);
        // SAFETY: the collection owns the VM; the new heap outlives the
        // visitor.
        unsafe {
            visitor.visit_all_roots();
            visitor.visit_mark_stack();
        }
    }
    // Swap in the grown heap; the old segment (holding only forwarding
    // pointers and garbage by now) is freed here.
    vm.data = new_data;
    vm.code.clear_remembered_set();
    (0, 0)
}

struct GrowCopier {
    new_tenured: *mut TenuredSpace,
    mark_stack: *mut Vec<usize>,
    vm: *const Vm,
}

impl Fixup for GrowCopier {
    unsafe fn fixup_object(&mut self, obj: *mut Object) -> *mut Object {
        if (*self.new_tenured).contains(obj) {
            return obj;
        }
        let obj = resolve_forwarding(obj);
        if (*self.new_tenured).contains(obj) {
            return obj;
        }
        let size = object_size(obj);
        let dest = match (*self.new_tenured).allot(size) {
            Some(dest) => dest,
            None => (*self.vm).fatal_error("grown data heap is still too small", size),
        };
        std::ptr::copy_nonoverlapping(obj as *const u8, dest as *mut u8, size);
        (*obj).header = Header::forwarding(dest as usize);
        (*self.mark_stack).push(dest as usize);
        dest
    }
}
