//! Collector-level invariants exercised through the public VM surface.

use rotor_core::gc::GcOp;
use rotor_core::objects::cell::{Cell, TypeCode};
use rotor_core::objects::kinds::{array_capacity, array_nth, object_size, string_bytes, Array, VmString};
use rotor_core::vm::{SpecialObject, Vm, VmConfig};

fn small_vm() -> Vm {
    Vm::new(VmConfig {
        young_size: 32 << 10,
        aging_size: 32 << 10,
        tenured_size: 2 << 20,
        code_size: 64 << 10,
        datastack_size: 32 << 10,
        retainstack_size: 32 << 10,
        callstack_size: 32 << 10,
    })
}

/// Anchor a batch of keeper slots, run `f`, and release the anchors.
fn with_keepers<R>(vm: &mut Vm, kept: &mut [Cell], f: impl FnOnce(&mut Vm, &mut [Cell]) -> R) -> R {
    // SAFETY: `kept` outlives both anchors and `f`; anchors are popped
    // in reverse order.
    unsafe {
        for slot in kept.iter_mut() {
            vm.data_roots.push(slot as *mut Cell);
        }
    }
    let result = f(vm, kept);
    for slot in kept.iter_mut().rev() {
        vm.data_roots.pop(slot as *mut Cell);
    }
    result
}

#[test]
fn minor_collection_empties_the_nursery_and_keeps_roots() {
    let mut vm = small_vm();
    let mut kept = [Cell::FALSE; 1];
    with_keepers(&mut vm, &mut kept, |vm, kept| {
        kept[0] = vm.allot_string_from("survivor");
        vm.gc(GcOp::Nursery, 0);
    });
    assert_eq!(vm.data.nursery.occupied_space(), 0);
    let survivor = kept[0];
    assert!(!vm.data.nursery.contains(survivor.untagged()));
    // SAFETY: survivor is live.
    unsafe {
        assert_eq!(
            string_bytes(survivor.untagged() as *mut VmString),
            b"survivor"
        );
    }
}

#[test]
fn shared_objects_are_copied_once_and_roots_converge() {
    let mut vm = small_vm();
    let mut kept = [Cell::FALSE; 2];
    with_keepers(&mut vm, &mut kept, |vm, kept| {
        let shared = vm.allot_array(8, Cell::from_fixnum(3));
        kept[0] = shared;
        kept[1] = shared;
        let aging_before = vm.data.aging.allocator.occupied_space();
        vm.gc(GcOp::Nursery, 0);
        // Both anchors resolved through the same forwarding pointer, so
        // the object was evacuated exactly once.
        assert_eq!(kept[0], kept[1], "shared roots must converge on one copy");
        // SAFETY: the copy is a live array.
        let copied = unsafe { object_size(kept[0].untagged()) };
        assert_eq!(
            vm.data.aging.allocator.occupied_space() - aging_before,
            copied,
            "exactly one copy of the shared object"
        );
    });
}

#[test]
fn survivors_land_in_exactly_one_generation_after_each_op() {
    let mut vm = small_vm();
    let mut kept = [Cell::FALSE; 4];
    with_keepers(&mut vm, &mut kept, |vm, kept| {
        for (i, slot) in kept.iter_mut().enumerate() {
            *slot = vm.allot_array(8, Cell::from_fixnum(i as isize));
        }
        for op in [GcOp::Nursery, GcOp::Aging, GcOp::ToTenured, GcOp::Full, GcOp::Compact] {
            vm.gc(op, 0);
            for (i, survivor) in kept.iter().enumerate() {
                let ptr = survivor.untagged();
                let homes = [
                    vm.data.nursery.contains(ptr),
                    vm.data.aging.contains(ptr),
                    vm.data.tenured.contains(ptr),
                ]
                .iter()
                .filter(|&&h| h)
                .count();
                assert_eq!(homes, 1, "{op:?}: survivor {i} in exactly one generation");
                // SAFETY: survivor is live.
                unsafe {
                    assert_eq!(
                        array_nth(ptr as *mut Array, 0).to_fixnum(),
                        i as isize,
                        "{op:?}: survivor {i} contents intact"
                    );
                }
            }
        }
    });
}

#[test]
fn full_collection_reclaims_unreachable_tenured_objects() {
    let mut vm = small_vm();
    // Two large (tenured) arrays; only one stays reachable.
    let mut kept = [Cell::FALSE; 1];
    with_keepers(&mut vm, &mut kept, |vm, kept| {
        let dead = vm.allot_array(8 << 10, Cell::FALSE);
        assert!(vm.data.tenured.contains(dead.untagged()));
        kept[0] = vm.allot_array(8 << 10, Cell::from_fixnum(5));
        let occupied_before = vm.data.tenured.allocator.occupied_space();
        vm.gc(GcOp::Full, 0);
        assert!(
            vm.data.tenured.allocator.occupied_space() < occupied_before,
            "the unreachable array must be swept"
        );
    });
    // SAFETY: the keeper survived the full collection.
    unsafe {
        assert_eq!(
            array_nth(kept[0].untagged() as *mut Array, 0).to_fixnum(),
            5
        );
    }
}

#[test]
fn compaction_leaves_a_single_free_block() {
    let mut vm = small_vm();
    let mut kept = [Cell::FALSE; 8];
    with_keepers(&mut vm, &mut kept, |vm, kept| {
        // Interleave keepers with garbage so the sweep fragments the
        // space.
        for slot in kept.iter_mut() {
            let _dead = vm.allot_array(8 << 10, Cell::FALSE);
            *slot = vm.allot_array(8 << 10, Cell::from_fixnum(1));
        }
        vm.gc(GcOp::Compact, 0);

        let room = vm.data.tenured.allocator.as_room();
        assert_eq!(
            room.free_block_count, 1,
            "compaction must leave exactly the tail block free"
        );
        assert_eq!(room.total_free, room.contiguous_free);

        // Live bytes equal the sum of the survivors' sizes.
        // SAFETY: all keepers are live tenured objects.
        let live: usize = kept
            .iter()
            .map(|c| unsafe { object_size(c.untagged()) })
            .sum();
        assert_eq!(room.occupied_space, live);
    });
}

#[test]
fn object_start_map_finds_enclosing_tenured_objects() {
    let mut vm = small_vm();
    let mut kept = [Cell::FALSE; 3];
    with_keepers(&mut vm, &mut kept, |vm, kept| {
        for slot in kept.iter_mut() {
            *slot = vm.allot_array(8 << 10, Cell::FALSE);
        }
        vm.gc(GcOp::Compact, 0);

        // SAFETY: the tenured space is fully parsable after compaction.
        unsafe {
            let mut scan = vm.data.tenured.first_object();
            let mut seen = 0;
            while scan != 0 {
                let size = object_size(scan as *const _);
                // Ask the map for the object containing an interior
                // address.
                let interior = scan + size / 2;
                let card = vm.data.cards.addr_to_card(interior)
                    - vm.data.cards.addr_to_card(vm.data.tenured.allocator.start);
                let found = vm.data.tenured.starts.find_object_containing_card(card);
                assert!(
                    found <= scan && found != 0,
                    "start map must find a start at or before the object"
                );
                seen += 1;
                scan = vm.data.tenured.next_object_after(scan);
            }
            assert!(seen >= kept.len(), "all keepers are walkable");
        }
    });
}

#[test]
fn growing_the_heap_preserves_live_objects() {
    let mut vm = Vm::new(VmConfig {
        young_size: 16 << 10,
        aging_size: 16 << 10,
        tenured_size: 256 << 10,
        code_size: 64 << 10,
        datastack_size: 16 << 10,
        retainstack_size: 16 << 10,
        callstack_size: 16 << 10,
    });
    let tenured_before = vm.data.tenured.allocator.size;
    let mut kept = [Cell::FALSE; 2];
    with_keepers(&mut vm, &mut kept, |vm, kept| {
        kept[0] = vm.allot_string_from("grown");
        kept[1] = vm.allot_array(16, Cell::from_fixnum(9));
        vm.gc(GcOp::GrowingDataHeap, 0);
    });
    assert!(vm.data.tenured.allocator.size > tenured_before);
    assert!(vm.data.tenured.contains(kept[0].untagged()));
    // SAFETY: both keepers are live in the grown heap.
    unsafe {
        assert_eq!(string_bytes(kept[0].untagged() as *mut VmString), b"grown");
        let arr = kept[1].untagged() as *mut Array;
        assert_eq!(array_capacity(arr), 16);
        assert_eq!(array_nth(arr, 3).to_fixnum(), 9);
    }
}

#[test]
fn gc_events_record_each_collection() {
    let mut vm = small_vm();
    vm.enable_gc_events();
    vm.gc(GcOp::Nursery, 0);
    vm.gc(GcOp::Full, 0);
    let events = vm.disable_gc_events().expect("events were recorded");
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].op, GcOp::Full);
    assert!(events[1].room_after.nursery_occupied == 0);
}

#[test]
fn stacks_are_roots_and_get_rewritten() {
    let mut vm = small_vm();
    let value = vm.allot_string_from("stacked");
    vm.dpush(value).unwrap();
    vm.rpush(value).unwrap();
    vm.gc(GcOp::Nursery, 0);
    let from_retain = vm.rpop().unwrap();
    let from_data = vm.dpop().unwrap();
    assert_eq!(from_data, from_retain, "both stacks see the same copy");
    // SAFETY: the value survived via the stack roots.
    unsafe {
        assert_eq!(
            string_bytes(from_data.untagged() as *mut VmString),
            b"stacked"
        );
    }
}

#[test]
fn special_objects_are_roots() {
    let mut vm = small_vm();
    let value = vm.allot_string_from("special");
    vm.set_special(SpecialObject::Stage2, value);
    vm.gc(GcOp::Full, 0);
    let survived = vm.special(SpecialObject::Stage2);
    assert_eq!(survived.tag(), TypeCode::String as usize);
    assert!(vm.data.tenured.contains(survived.untagged()));
    // SAFETY: the special object survived the full collection.
    unsafe {
        assert_eq!(
            string_bytes(survived.untagged() as *mut VmString),
            b"special"
        );
    }
}
