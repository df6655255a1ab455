//! Full collection: mark everything live into tenured space, then
//! sweep the tenured free lists.
//!
//! Marking promotes any young survivor into tenured (so the young
//! generations are empty afterwards) and sets the header mark bit on
//! every live tenured object, driving reachability through the mark
//! stack.  Sweeping walks the space linearly, coalescing every
//! unmarked range into free blocks, clearing survivor marks, and
//! rebuilding the object-start map.

use crate::gc::cards::CardTable;
use crate::gc::data_heap::TenuredSpace;
use crate::gc::free_list::FreeHeapBlock;
use crate::gc::slot_visitor::{Fixup, SlotVisitor};
use crate::gc::GcOp;
use crate::objects::header::{resolve_forwarding, Object};
use crate::objects::kinds::object_size;
use crate::vm::Vm;

struct FullCopier {
    tenured: *mut TenuredSpace,
    cards: *mut CardTable,
    mark_stack: *mut Vec<usize>,
    vm: *const Vm,
}

impl FullCopier {
    /// Mark a tenured object once, scheduling its slots for scanning.
    unsafe fn mark_once(&mut self, obj: *mut Object) {
        if !(*obj).header.is_marked() {
            (*obj).header.set_mark();
            (*self.mark_stack).push(obj as usize);
        }
    }
}

impl Fixup for FullCopier {
    unsafe fn fixup_object(&mut self, obj: *mut Object) -> *mut Object {
        if (*self.tenured).contains(obj) {
            self.mark_once(obj);
            return obj;
        }
        let obj = resolve_forwarding(obj);
        if (*self.tenured).contains(obj) {
            self.mark_once(obj);
            return obj;
        }
        // Young survivor: promote into tenured space.  The driver
        // pre-escalates to a heap grow when tenured could not absorb
        // the young live set, so exhaustion here is unrecoverable.
        let size = object_size(obj);
        let dest = match (*self.tenured).allot(size) {
            Some(dest) => dest,
            None => (*self.vm).fatal_error("out of tenured space in full collection", size),
        };
        std::ptr::copy_nonoverlapping(obj as *const u8, dest as *mut u8, size);
        (*obj).header = crate::objects::header::Header::forwarding(dest as usize);
        (*dest).header.set_mark();
        (*self.cards).mark_range(dest as usize, size);
        (*self.mark_stack).push(dest as usize);
        dest
    }
}

/// Mark phase: trace everything reachable, promoting young survivors.
/// Leaves the young generations empty and the card table clear.
pub fn collect_mark(vm: &mut Vm) {
    vm.mark_stack.clear();
    let vm_ptr: *const Vm = vm;
    let fixup = FullCopier {
        tenured: &raw mut vm.data.tenured,
        cards: &raw mut vm.data.cards,
        mark_stack: &raw mut vm.mark_stack,
        vm: vm_ptr,
    };
    let mut visitor = SlotVisitor::new(vm, fixup);
    // SAFETY: the collection owns the VM.
    unsafe {
        visitor.visit_all_roots();
        visitor.visit_mark_stack();
    }
    drop(visitor);

    vm.data.reset_nursery();
    vm.data.reset_aging();
    // Everything live is now tenured: no old-to-young edge can exist.
    vm.data.clear_all_cards();
    vm.code.clear_remembered_set();
}

/// Sweep phase: rebuild the tenured free lists from unmarked ranges,
/// clear survivor marks, rebuild the object-start map, and sweep the
/// code heap (invalidating unmarked code roots).
pub fn collect_sweep(vm: &mut Vm) {
    let tenured = &mut vm.data.tenured;
    tenured.allocator.clear_free_list();

    let start = tenured.allocator.start;
    let end = tenured.allocator.end;
    let mut scan = start;
    let mut free_run: Option<usize> = None;

    // SAFETY: every byte of tenured space is covered by a valid object
    // or free-block header, maintained by allot/sweep/compact.
    unsafe {
        while scan < end {
            let obj = scan as *mut Object;
            let header = (*obj).header;
            let size = object_size(obj);
            let live = !header.is_free() && header.is_marked();
            if live {
                if let Some(run_start) = free_run.take() {
                    let block = run_start as *mut FreeHeapBlock;
                    FreeHeapBlock::make_free(block, scan - run_start);
                    tenured.allocator.add_to_free_list(block);
                }
                (*obj).header.clear_mark();
            } else if free_run.is_none() {
                free_run = Some(scan);
            }
            scan += size;
        }
        if let Some(run_start) = free_run {
            let block = run_start as *mut FreeHeapBlock;
            FreeHeapBlock::make_free(block, end - run_start);
            tenured.allocator.add_to_free_list(block);
        }
        tenured.rebuild_starts();
    }

    vm.code.sweep();
}

/// Full collection, escalating to a grow or a compaction when the
/// swept heap is still short on memory or on contiguous space.
pub fn collect_full(vm: &mut Vm) {
    collect_mark(vm);
    collect_sweep(vm);

    if vm.data.low_memory_p() {
        // The full collection did not free enough memory; grow.
        vm.set_current_gc_op(GcOp::GrowingDataHeap);
        crate::gc::compact::collect_growing_data_heap(vm, 0);
    } else if vm.data.high_fragmentation_p() {
        // Enough free memory, but not contiguous; compact.
        vm.set_current_gc_op(GcOp::Compact);
        crate::gc::compact::compact_impl(vm);
    }
}
