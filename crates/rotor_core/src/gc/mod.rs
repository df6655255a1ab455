//! Garbage collection: generations, traversal, and the collection
//! driver.

/// Pointer-bump allocation for the nursery and aging semispaces.
pub mod bump;
/// Card/deck remembered-set tables.
pub mod cards;
/// Tenured compaction and heap growth.
pub mod compact;
/// Nursery, aging, and to-tenured copying collections.
pub mod copying;
/// The data heap: segment, generations, occupancy predicates.
pub mod data_heap;
/// Anchored roots held across allocation points.
pub mod data_roots;
/// Size-classed free lists for tenured and code space.
pub mod free_list;
/// Full mark/sweep collection.
pub mod full;
/// Per-card object-start offsets.
pub mod object_start_map;
/// The generic slot visitor and root scan.
pub mod slot_visitor;

use std::time::{Duration, Instant};

use crate::gc::data_heap::DataHeapRoom;
use crate::vm::Vm;

/// The collection operations, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcOp {
    Nursery,
    Aging,
    ToTenured,
    Full,
    Compact,
    GrowingDataHeap,
}

/// One recorded collection, when event recording is enabled.
#[derive(Debug, Clone)]
pub struct GcEvent {
    /// The op the collection finished as (escalations included).
    pub op: GcOp,
    pub cards_scanned: u64,
    pub decks_scanned: u64,
    pub duration: Duration,
    pub room_before: DataHeapRoom,
    pub room_after: DataHeapRoom,
}

impl Vm {
    /// Run a collection.
    ///
    /// There is no cheap non-local exit on the platforms this runtime
    /// targets, so instead of starting a phase and unwinding when the
    /// target generation fills, the driver *pre-escalates*: it inspects
    /// occupancies up front and picks the higher op directly.  The
    /// copiers handle any residual overflow by promoting straight to
    /// tenured space.  Collections always terminate at or before
    /// [`GcOp::GrowingDataHeap`].
    pub fn gc(&mut self, op: GcOp, requested_size: usize) {
        if self.gc_off {
            log::debug!("gc suppressed (gc_off) op={op:?}");
            return;
        }
        assert!(self.current_gc.is_none(), "collection re-entered");

        let started = Instant::now();
        let room_before = self.data.room();

        let mut op = op;
        if op == GcOp::Nursery
            && self.data.aging.allocator.free_space() < self.data.nursery.occupied_space()
        {
            // Aging cannot absorb the nursery: flip the semispaces too.
            log::debug!("gc escalating nursery -> aging");
            op = GcOp::Aging;
        }
        if op == GcOp::Aging && self.data.high_fragmentation_p() {
            log::debug!("gc escalating aging -> full (high fragmentation)");
            op = GcOp::Full;
        }
        if op == GcOp::Full {
            let young_live = self.data.nursery.occupied_space()
                + self.data.aging.allocator.occupied_space();
            if self.data.tenured.allocator.largest_free_block() < young_live {
                // A full mark must promote the young live set before
                // sweeping frees anything; without room it cannot start.
                log::debug!("gc escalating full -> grow (no headroom for promotion)");
                op = GcOp::GrowingDataHeap;
            }
        }

        self.current_gc = Some(op);
        log::debug!(
            "gc start op={op:?} requested={requested_size} {}",
            self.data.describe()
        );

        let (cards_scanned, decks_scanned) = match op {
            GcOp::Nursery => copying::collect_nursery(self),
            GcOp::Aging => {
                let scanned = copying::collect_aging(self);
                if self.data.high_fragmentation_p() {
                    self.set_current_gc_op(GcOp::Full);
                    full::collect_full(self);
                }
                scanned
            }
            GcOp::ToTenured => {
                let scanned = copying::collect_to_tenured(self);
                if self.data.high_fragmentation_p() {
                    self.set_current_gc_op(GcOp::Full);
                    full::collect_full(self);
                }
                scanned
            }
            GcOp::Full => {
                full::collect_full(self);
                (0, 0)
            }
            GcOp::Compact => compact::collect_compact(self),
            GcOp::GrowingDataHeap => compact::collect_growing_data_heap(self, requested_size),
        };

        let final_op = self.current_gc.take().expect("gc op cleared mid-collection");
        if self.gc_events.is_some() {
            let event = GcEvent {
                op: final_op,
                cards_scanned,
                decks_scanned,
                duration: started.elapsed(),
                room_before,
                room_after: self.data.room(),
            };
            if let Some(events) = &mut self.gc_events {
                events.push(event);
            }
        }

        // Any raw pointer cached outside the managed roots is invalid
        // now that objects may have moved.
        self.clear_layout_caches();

        if final_op >= GcOp::Full {
            debug_assert!(
                !self.data.high_fragmentation_p(),
                "major collection left the heap fragmented"
            );
        }
        log::debug!("gc done op={final_op:?} {}", self.data.describe());
    }

    pub(crate) fn set_current_gc_op(&mut self, op: GcOp) {
        self.current_gc = Some(op);
    }

    /// Begin recording one [`GcEvent`] per collection.
    pub fn enable_gc_events(&mut self) {
        self.gc_events = Some(Vec::new());
    }

    /// Stop recording and return the events collected so far.
    pub fn disable_gc_events(&mut self) -> Option<Vec<GcEvent>> {
        self.gc_events.take()
    }
}
