//! Generic slot traversal, parameterized by a fixup policy.
//!
//! A [`SlotVisitor`] walks cells — root handles, stack regions, object
//! slot arrays, dirty cards — and applies its [`Fixup`] to every
//! non-immediate cell: the fixup returns the object's current (possibly
//! new) untagged address, which is retagged and stored back.  The
//! copying collectors, the full-GC marker, and the compactor are all
//! instances of the same traversal with different fixups.
//!
//! One root scan covers: data-root anchors, the special-object table,
//! every context's data/retain stack and context-object array, the
//! trampoline's work stack, and the code-heap root cells.  Callstack
//! frame walking would consult per-code-block GC maps; with no compiled
//! code in this build, callstacks carry no managed slots and the walk
//! is a no-op.

use crate::ctx::Context;
use crate::gc::cards::{CARDS_PER_DECK, CARD_SIZE, DECK_SIZE};
use crate::interp::WorkItem;
use crate::objects::cell::{Cell, CELL_BYTES};
use crate::objects::header::Object;
use crate::objects::kinds::{object_size, slot_count};
use crate::vm::{Vm, SPECIAL_OBJECT_COUNT};

/// A pointer-rewriting policy applied to every visited slot.
pub trait Fixup {
    /// Map an untagged object pointer to the object's current location,
    /// copying or marking it as the policy dictates.
    ///
    /// # Safety
    /// `obj` must be an untagged pointer read from a managed slot: a
    /// live object, or a forwarding chain left by the current
    /// collection cycle.
    unsafe fn fixup_object(&mut self, obj: *mut Object) -> *mut Object;
}

/// Identity fixup, for traversals that only need to look.
pub struct NoFixup;

impl Fixup for NoFixup {
    unsafe fn fixup_object(&mut self, obj: *mut Object) -> *mut Object {
        obj
    }
}

/// Which generation a card scan walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanGen {
    Aging,
    Tenured,
}

pub struct SlotVisitor<F: Fixup> {
    vm: *mut Vm,
    pub fixup: F,
    pub cards_scanned: u64,
    pub decks_scanned: u64,
}

impl<F: Fixup> SlotVisitor<F> {
    /// The visitor holds the VM raw so that the fixup (which owns raw
    /// pointers into the same VM's spaces) can run while roots are
    /// being iterated.  There is exactly one mutator and collections
    /// are not re-entrant, so no aliasing access happens while a
    /// visitor is live.
    pub fn new(vm: &mut Vm, fixup: F) -> Self {
        SlotVisitor {
            vm,
            fixup,
            cards_scanned: 0,
            decks_scanned: 0,
        }
    }

    /// Rewrite one handle (a pointer to a managed cell).
    ///
    /// Pointers outside the allocated portion of every generation are
    /// left untouched: card walks also traverse dead objects, whose
    /// slots may still name space flushed by an earlier collection.
    ///
    /// # Safety
    /// `handle` must point to a live cell owned by the VM.
    pub unsafe fn visit_handle(&mut self, handle: *mut Cell) {
        let value = *handle;
        if value.is_immediate() {
            return;
        }
        if !(*self.vm).data.contains_allocated(value.untagged()) {
            return;
        }
        let moved = self.fixup.fixup_object(value.untagged());
        *handle = value.retag(moved);
    }

    /// Visit the half-open cell range `[start, end)`.
    ///
    /// # Safety
    /// The range must consist of live, VM-owned cells.
    pub unsafe fn visit_object_array(&mut self, start: *mut Cell, end: *mut Cell) {
        let mut handle = start;
        while handle < end {
            self.visit_handle(handle);
            handle = handle.add(1);
        }
    }

    /// Visit every managed slot of the object at `obj`.
    ///
    /// # Safety
    /// `obj` must point to a live heap object.
    pub unsafe fn visit_slots(&mut self, obj: *mut Object) {
        let slots = slot_count(obj);
        if slots == 0 {
            return;
        }
        let start = (obj as *mut Cell).add(1);
        self.visit_object_array(start, start.add(slots));
    }

    /// Visit a stack region from its base through `top` (inclusive).
    ///
    /// # Safety
    /// `[base, top]` must be the live portion of a VM-owned stack
    /// segment; an empty stack has `top` one cell below `base`.
    unsafe fn visit_stack_elements(&mut self, base: usize, top: usize) {
        if top < base {
            return;
        }
        self.visit_object_array(base as *mut Cell, (top + CELL_BYTES) as *mut Cell);
    }

    /// Visit one context: both value stacks and the context objects.
    ///
    /// # Safety
    /// `ctx` must point to a live context owned by the VM.
    unsafe fn visit_context(&mut self, ctx: *mut Context) {
        let ds_base = (*ctx).datastack_seg.start;
        let ds_top = (*ctx).datastack;
        self.visit_stack_elements(ds_base, ds_top);
        let rs_base = (*ctx).retainstack_seg.start;
        let rs_top = (*ctx).retainstack;
        self.visit_stack_elements(rs_base, rs_top);
        let objs = (*ctx).context_objects.as_mut_ptr();
        self.visit_object_array(objs, objs.add(crate::ctx::CONTEXT_OBJECT_COUNT));
        // Overwrite the space above the tops so stale copies of moved
        // objects cannot be resurrected by a later stack bug.
        (*ctx).fill_unused();
    }

    /// Visit every root in one traversal.
    ///
    /// # Safety
    /// Must only run while a collection owns the VM (no mutator
    /// activity, no other visitor).
    pub unsafe fn visit_all_roots(&mut self) {
        let vm = self.vm;

        // Data-root anchors.
        let anchors: Vec<*mut Cell> = (*vm).data_roots.iter().collect();
        for handle in anchors {
            self.visit_handle(handle);
        }

        // Special objects.
        let specials = (*vm).special_objects.as_mut_ptr();
        self.visit_object_array(specials, specials.add(SPECIAL_OBJECT_COUNT));

        // Every context: stacks and context objects.
        let contexts = (*vm).contexts.len();
        for i in 0..contexts {
            let ctx: *mut Context = &mut *(&mut (*vm).contexts)[i];
            self.visit_context(ctx);
        }

        // The trampoline's pending work items.
        let work = &raw mut (*vm).work_stack;
        for item in (*work).iter_mut() {
            match item {
                WorkItem::CallCallable(cell)
                | WorkItem::PushValue(cell)
                | WorkItem::LoopContinue(cell) => self.visit_handle(cell as *mut Cell),
                WorkItem::QuotationContinue { array, .. } => {
                    self.visit_handle(array as *mut Cell)
                }
                WorkItem::RestoreValues { values, .. } => {
                    for value in values.iter_mut() {
                        self.visit_handle(value as *mut Cell);
                    }
                }
            }
        }

        // Code-heap root cells (empty without a compiler, but part of
        // the root contract).
        let code_roots = &raw mut (*vm).code.code_roots;
        for root in (*code_roots).iter_mut() {
            if root.valid {
                self.visit_handle(&mut root.value as *mut Cell);
            }
        }
    }

    // ── Cheney scan ───────────────────────────────────────────────────

    /// Breadth-first copy completion: walk the aging space from `scan`
    /// to the (moving) allocation frontier, visiting each copied
    /// object's slots, and drain overflow promotions pushed on the
    /// mark stack.  Terminates when both are exhausted.
    ///
    /// # Safety
    /// Must run as part of a copying collection whose fixup copies into
    /// the active aging semispace and/or pushes promoted objects onto
    /// the VM mark stack.
    pub unsafe fn cheneys_algorithm(&mut self, mut scan: usize) {
        loop {
            let here = (*self.vm).data.aging.allocator.here;
            if scan < here {
                let obj = scan as *mut Object;
                self.visit_slots(obj);
                scan += object_size(obj);
                continue;
            }
            match (*self.vm).mark_stack.pop() {
                Some(addr) => self.visit_slots(addr as *mut Object),
                None => break,
            }
        }
    }

    /// Drain the mark stack, visiting each popped object's slots.
    ///
    /// # Safety
    /// Every address on the mark stack must be a live heap object.
    pub unsafe fn visit_mark_stack(&mut self) {
        while let Some(addr) = (*self.vm).mark_stack.pop() {
            self.visit_slots(addr as *mut Object);
        }
    }

    // ── Card iteration ────────────────────────────────────────────────

    /// Visit the slots of the object at `obj_addr` clipped to the card
    /// range `[card_start, card_end)`.
    ///
    /// # Safety
    /// `obj_addr` must be a live object in the scanned generation.
    unsafe fn visit_partial_objects(
        &mut self,
        obj_addr: usize,
        card_start: usize,
        card_end: usize,
    ) {
        let slots = slot_count(obj_addr as *const Object);
        let start = obj_addr + CELL_BYTES;
        let end = start + slots * CELL_BYTES;
        let clipped_start = start.max(card_start);
        let clipped_end = end.min(card_end);
        if clipped_start < clipped_end {
            self.visit_object_array(clipped_start as *mut Cell, clipped_end as *mut Cell);
        }
    }

    /// Scan one dirty card.  `start` is the address of the last object
    /// traced by the previous card (0 to force a map lookup); returns
    /// the address to seed the next card with, or 0 when the walk has
    /// reached the end of the generation.
    ///
    /// # Safety
    /// As [`visit_cards`][Self::visit_cards].
    unsafe fn visit_card(&mut self, gen: ScanGen, index: usize, mut start: usize) -> usize {
        let vm = self.vm;
        let heap_base = (*vm).data.start;
        let card_start = heap_base + index * CARD_SIZE;
        let card_end = card_start + CARD_SIZE;

        // Forward to the first object whose extent reaches this card.
        if start == 0 || start + object_size(start as *const Object) <= card_start {
            start = self.find_object_containing_card(gen, index);
            if start == 0 {
                return 0;
            }
        }

        while start < card_end {
            self.visit_partial_objects(start, card_start, card_end);
            if start + object_size(start as *const Object) >= card_end {
                // The object spans the card boundary; the remainder is
                // handled when (and if) the next card is scanned.
                break;
            }
            start = self.next_object_after(gen, start);
            if start == 0 {
                return 0;
            }
        }
        start
    }

    /// Scan every card with `mask` bits set under decks with `mask`
    /// bits set, over the given generation, clearing `unmask` bits on
    /// the scanned cards and refreshing deck summaries.
    ///
    /// # Safety
    /// Must run as part of a collection; the generation's object-start
    /// map and headers must be consistent.
    pub unsafe fn visit_cards(&mut self, gen: ScanGen, mask: u8, unmask: u8) {
        let vm = self.vm;
        let heap_base = (*vm).data.start;
        let (gen_start, gen_end) = self.gen_bounds(gen);
        let first_deck = (gen_start - heap_base) / DECK_SIZE;
        let last_deck = (gen_end - heap_base).div_ceil(DECK_SIZE);

        // Address of the last traced object, carried between cards.
        let mut start = 0usize;
        for deck in first_deck..last_deck {
            if (*vm).data.cards.deck_flags(deck) & mask == 0 {
                continue;
            }
            self.decks_scanned += 1;

            let first_card = deck * CARDS_PER_DECK;
            let last_card = first_card + CARDS_PER_DECK;
            for card in first_card..last_card {
                let card_addr = heap_base + card * CARD_SIZE;
                if card_addr + CARD_SIZE <= gen_start {
                    continue;
                }
                if card_addr >= gen_end {
                    break;
                }
                if (*vm).data.cards.card_flags(card) & mask == 0 {
                    continue;
                }
                (*vm).data.cards.clear_card_bits(card, unmask);
                self.cards_scanned += 1;

                start = self.visit_card(gen, card, start);
                if start == 0 {
                    // End of generation: later cards hold no objects.
                    (*vm).data.cards.recompute_deck(deck);
                    return;
                }
            }
            (*vm).data.cards.recompute_deck(deck);
        }
    }

    unsafe fn gen_bounds(&self, gen: ScanGen) -> (usize, usize) {
        let data = &(*self.vm).data;
        match gen {
            ScanGen::Aging => (data.aging.allocator.start, data.aging.allocator.here),
            ScanGen::Tenured => (data.tenured.allocator.start, data.tenured.allocator.end),
        }
    }

    unsafe fn find_object_containing_card(&self, gen: ScanGen, card: usize) -> usize {
        let data = &(*self.vm).data;
        let heap_base = data.start;
        match gen {
            ScanGen::Aging => {
                let space = &data.aging;
                if space.allocator.occupied_space() == 0 {
                    return 0;
                }
                let gen_first_card = (space.allocator.start - heap_base) / CARD_SIZE;
                space
                    .starts
                    .find_object_containing_card(card - gen_first_card)
            }
            ScanGen::Tenured => {
                let space = &data.tenured;
                let gen_first_card = (space.allocator.start - heap_base) / CARD_SIZE;
                let candidate = space
                    .starts
                    .find_object_containing_card(card - gen_first_card);
                if candidate == 0 {
                    space.first_object()
                } else {
                    candidate
                }
            }
        }
    }

    unsafe fn next_object_after(&self, gen: ScanGen, scan: usize) -> usize {
        let data = &(*self.vm).data;
        match gen {
            ScanGen::Aging => data.aging.next_object_after(scan),
            ScanGen::Tenured => data.tenured.next_object_after(scan),
        }
    }
}
