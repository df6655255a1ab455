//! Copying collections: nursery → aging, aging → aging (semispace
//! flip), and wholesale promotion into tenured space.
//!
//! Each collection is a [`SlotVisitor`] traversal with a copier fixup.
//! The copiers keep raw pointers into the VM's spaces for the duration
//! of one cycle; no mutator runs while a collection owns the VM.
//!
//! When a copy target is full the copiers promote the object directly
//! to tenured space instead of unwinding and retrying: there is no
//! cheap non-local exit on the platforms this runtime targets, so the
//! driver pre-escalates (see `gc::Vm::gc`) and the copiers degrade
//! gracefully.  Objects promoted this way are pushed on the mark stack
//! so their slots still get scanned, and their cards are dirtied
//! because their slots may still point at young objects.

use crate::gc::bump::BumpAllocator;
use crate::gc::cards::{CardFlags, CardTable, CARD_MARK_MASK};
use crate::gc::data_heap::{AgingSpace, TenuredSpace};
use crate::gc::slot_visitor::{Fixup, ScanGen, SlotVisitor};
use crate::objects::header::{resolve_forwarding, Header, Object};
use crate::objects::kinds::object_size;
use crate::vm::Vm;

/// Copy `obj` (of `size` bytes) to `dest` and leave a forwarding
/// pointer behind.
///
/// # Safety
/// `dest` must be a fresh allocation of at least `size` bytes; `obj`
/// must be a live object of exactly `size` bytes.
unsafe fn copy_and_forward(obj: *mut Object, dest: *mut Object, size: usize) -> *mut Object {
    std::ptr::copy_nonoverlapping(obj as *const u8, dest as *mut u8, size);
    (*obj).header = Header::forwarding(dest as usize);
    dest
}

// ── Nursery collection ────────────────────────────────────────────────

struct NurseryCopier {
    nursery: *mut BumpAllocator,
    aging: *mut AgingSpace,
    tenured: *mut TenuredSpace,
    cards: *mut CardTable,
    mark_stack: *mut Vec<usize>,
    vm: *const Vm,
}

impl Fixup for NurseryCopier {
    unsafe fn fixup_object(&mut self, obj: *mut Object) -> *mut Object {
        if !(*self.nursery).contains(obj) {
            return obj;
        }
        let obj = resolve_forwarding(obj);
        if !(*self.nursery).contains(obj) {
            return obj;
        }
        let size = object_size(obj);
        match (*self.aging).allot(size) {
            Some(dest) => copy_and_forward(obj, dest, size),
            None => {
                // Aging full mid-copy: promote straight to tenured.
                match (*self.tenured).allot(size) {
                    Some(dest) => {
                        (*self.cards).mark_range(dest as usize, size);
                        (*self.mark_stack).push(dest as usize);
                        copy_and_forward(obj, dest, size)
                    }
                    None => (*self.vm)
                        .fatal_error("out of aging and tenured space in nursery collection", size),
                }
            }
        }
    }
}

/// Copy nursery-live objects into aging space.
///
/// Roots: the full root scan, dirty "points to nursery" cards in
/// tenured and aging space, and the code-heap nursery remembered set.
pub fn collect_nursery(vm: &mut Vm) -> (u64, u64) {
    let scan = vm.data.aging.allocator.here;
    let vm_ptr: *const Vm = vm;
    let fixup = NurseryCopier {
        nursery: &raw mut vm.data.nursery,
        aging: &raw mut vm.data.aging,
        tenured: &raw mut vm.data.tenured,
        cards: &raw mut vm.data.cards,
        mark_stack: &raw mut vm.mark_stack,
        vm: vm_ptr,
    };
    let mut visitor = SlotVisitor::new(vm, fixup);
    // SAFETY: the collection owns the VM; the copier's space pointers
    // stay valid for the whole cycle.
    unsafe {
        visitor.visit_all_roots();
        visitor.visit_cards(
            ScanGen::Tenured,
            CardFlags::POINTS_TO_NURSERY.bits(),
            CardFlags::POINTS_TO_NURSERY.bits(),
        );
        visitor.visit_cards(ScanGen::Aging, CardFlags::POINTS_TO_NURSERY.bits(), 0xff);
        visitor.cheneys_algorithm(scan);
    }
    let scanned = (visitor.cards_scanned, visitor.decks_scanned);
    drop(visitor);

    vm.data.reset_nursery();
    vm.code.points_to_nursery.clear();
    scanned
}

// ── Promotion copier (aging phase 1, to-tenured) ──────────────────────

/// Promotes every non-tenured object it sees into tenured space.
struct TenuredPromoter {
    tenured: *mut TenuredSpace,
    cards: *mut CardTable,
    mark_stack: *mut Vec<usize>,
    vm: *const Vm,
}

impl Fixup for TenuredPromoter {
    unsafe fn fixup_object(&mut self, obj: *mut Object) -> *mut Object {
        if (*self.tenured).contains(obj) {
            return obj;
        }
        let obj = resolve_forwarding(obj);
        if (*self.tenured).contains(obj) {
            return obj;
        }
        let size = object_size(obj);
        match (*self.tenured).allot(size) {
            Some(dest) => {
                (*self.cards).mark_range(dest as usize, size);
                (*self.mark_stack).push(dest as usize);
                copy_and_forward(obj, dest, size)
            }
            None => (*self.vm).fatal_error("out of tenured space during promotion", size),
        }
    }
}

fn tenured_promoter(vm: &mut Vm) -> TenuredPromoter {
    let vm_ptr: *const Vm = vm;
    TenuredPromoter {
        tenured: &raw mut vm.data.tenured,
        cards: &raw mut vm.data.cards,
        mark_stack: &raw mut vm.mark_stack,
        vm: vm_ptr,
    }
}

// ── Aging collection ──────────────────────────────────────────────────

struct ToAgingCopier {
    aging: *mut AgingSpace,
    tenured: *mut TenuredSpace,
    cards: *mut CardTable,
    mark_stack: *mut Vec<usize>,
    vm: *const Vm,
}

impl Fixup for ToAgingCopier {
    unsafe fn fixup_object(&mut self, obj: *mut Object) -> *mut Object {
        if (*self.aging).contains(obj) || (*self.tenured).contains(obj) {
            return obj;
        }
        let obj = resolve_forwarding(obj);
        if (*self.aging).contains(obj) || (*self.tenured).contains(obj) {
            return obj;
        }
        let size = object_size(obj);
        match (*self.aging).allot(size) {
            Some(dest) => copy_and_forward(obj, dest, size),
            None => {
                // The fresh semispace cannot fit everything: promote the
                // overflow directly to tenured.
                match (*self.tenured).allot(size) {
                    Some(dest) => {
                        (*self.cards).mark_range(dest as usize, size);
                        (*self.mark_stack).push(dest as usize);
                        copy_and_forward(obj, dest, size)
                    }
                    None => (*self.vm)
                        .fatal_error("out of aging and tenured space in aging collection", size),
                }
            }
        }
    }
}

/// Flip the aging semispaces and evacuate the old semispace plus the
/// nursery into the fresh one.
///
/// Phase 1 promotes everything reachable from tenured space ("points
/// to aging" cards) into tenured, transitively, so those objects are
/// not copied back and forth between semispaces.  Phase 2 flips and
/// evacuates what the roots still reach.
pub fn collect_aging(vm: &mut Vm) -> (u64, u64) {
    let mut scanned = (0u64, 0u64);
    {
        let fixup = tenured_promoter(vm);
        let mut visitor = SlotVisitor::new(vm, fixup);
        // SAFETY: the collection owns the VM.
        unsafe {
            visitor.visit_cards(ScanGen::Tenured, CardFlags::POINTS_TO_AGING.bits(), 0xff);
            visitor.visit_mark_stack();
        }
        scanned.0 += visitor.cards_scanned;
        scanned.1 += visitor.decks_scanned;
    }
    {
        vm.data.swap_aging_semispaces();
        vm.data.reset_aging();

        let scan = vm.data.aging.allocator.here;
        let vm_ptr: *const Vm = vm;
        let fixup = ToAgingCopier {
            aging: &raw mut vm.data.aging,
            tenured: &raw mut vm.data.tenured,
            cards: &raw mut vm.data.cards,
            mark_stack: &raw mut vm.mark_stack,
            vm: vm_ptr,
        };
        let mut visitor = SlotVisitor::new(vm, fixup);
        // SAFETY: the collection owns the VM.
        unsafe {
            visitor.visit_all_roots();
            visitor.cheneys_algorithm(scan);
        }
        scanned.0 += visitor.cards_scanned;
        scanned.1 += visitor.decks_scanned;
    }
    vm.data.reset_nursery();
    vm.data.clear_young_cards();
    vm.code.clear_remembered_set();
    scanned
}

// ── Wholesale promotion ───────────────────────────────────────────────

/// Promote the entire aging and nursery live sets into tenured space.
/// Used when an aging collection could not fit its survivors.
pub fn collect_to_tenured(vm: &mut Vm) -> (u64, u64) {
    let fixup = tenured_promoter(vm);
    let mut visitor = SlotVisitor::new(vm, fixup);
    // SAFETY: the collection owns the VM.
    unsafe {
        visitor.visit_cards(ScanGen::Tenured, CARD_MARK_MASK, 0xff);
        visitor.visit_all_roots();
        visitor.visit_mark_stack();
    }
    let scanned = (visitor.cards_scanned, visitor.decks_scanned);
    drop(visitor);

    vm.data.reset_nursery();
    vm.data.reset_aging();
    vm.data.clear_young_cards();
    vm.code.clear_remembered_set();
    scanned
}
