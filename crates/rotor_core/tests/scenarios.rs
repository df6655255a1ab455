//! End-to-end interpreter and collector scenarios.
//!
//! These tests build a minimal in-memory image by hand: the canonical
//! `t` word, the sentinel words for the primitive-call and declare
//! encodings, the `curried`/`composed` layouts, and an empty
//! error-handler quotation.  Construction happens against a fresh
//! multi-megabyte nursery, so no collection runs while unanchored
//! fixture cells sit on the Rust stack.

use rotor_core::error::KERNEL_ERROR_MARKER;
use rotor_core::gc::cards::CardFlags;
use rotor_core::gc::GcOp;
use rotor_core::interp::primitives::dispatch_primitive;
use rotor_core::objects::cell::{Cell, TypeCode, FIXNUM_MAX, TYPE_COUNT};
use rotor_core::objects::kinds::{
    array_capacity, array_data, array_nth, cells_equal, string_bytes, Array, Tuple, VmString,
    Word,
};
use rotor_core::vm::{SpecialObject, Vm, VmConfig};

// ── Fixture ───────────────────────────────────────────────────────────

fn make_word(vm: &mut Vm, name: &str) -> Cell {
    let name = vm.allot_string_from(name);
    vm.allot_word(name)
}

fn make_quotation(vm: &mut Vm, elements: &[Cell]) -> Cell {
    let array = vm.allot_array_from(elements);
    vm.allot_quotation(array)
}

fn make_word_with_def(vm: &mut Vm, name: &str, elements: &[Cell]) -> Cell {
    let mut def = make_quotation(vm, elements);
    // SAFETY: `def` lives on this frame until the pop below.
    unsafe {
        vm.data_roots.push(&raw mut def);
        let word = make_word(vm, name);
        vm.data_roots.pop(&raw mut def);
        (*(word.untagged() as *mut Word)).def = def;
        word
    }
}

/// Install the singletons and sentinels the interpreter depends on.
fn boot(vm: &mut Vm) {
    let t = make_word(vm, "t");
    vm.set_special(SpecialObject::CanonicalTrue, t);

    let primitive_word = make_word(vm, "(primitive-call)");
    vm.set_special(SpecialObject::PrimitiveWord, primitive_word);
    let declare_word = make_word(vm, "declare");
    vm.set_special(SpecialObject::DeclareWord, declare_word);

    let tuple_word = make_word(vm, "tuple");
    let curried_word = make_word(vm, "curried");
    let curried_layout =
        vm.allot_tuple_layout(curried_word, 2, 1, &[(tuple_word, 0), (curried_word, 3)]);
    vm.set_special(SpecialObject::CurriedLayout, curried_layout);
    let composed_word = make_word(vm, "composed");
    let composed_layout =
        vm.allot_tuple_layout(composed_word, 2, 1, &[(tuple_word, 0), (composed_word, 5)]);
    vm.set_special(SpecialObject::ComposedLayout, composed_layout);

    let handler = make_quotation(vm, &[]);
    vm.set_special(SpecialObject::ErrorHandlerQuot, handler);
}

fn booted_vm() -> Vm {
    let mut vm = Vm::new(VmConfig::default());
    boot(&mut vm);
    vm
}

fn pop(vm: &mut Vm) -> Cell {
    vm.dpop().expect("value on data stack")
}

// ── Scenario 1: arithmetic with promotion ─────────────────────────────

#[test]
fn fixnum_addition_overflows_into_a_bignum() {
    let mut vm = booted_vm();
    let plus = make_word(&mut vm, "+");

    vm.dpush(Cell::from_fixnum(FIXNUM_MAX)).unwrap();
    vm.dpush(Cell::from_fixnum(1)).unwrap();
    vm.call_callable(plus);

    let sum = pop(&mut vm);
    assert_eq!(sum.tag(), TypeCode::Bignum as usize, "sum must be a bignum");
    let expected = vm.allot_bignum(FIXNUM_MAX as i128 + 1);
    // SAFETY: both cells are live heap objects.
    assert!(unsafe { cells_equal(sum, expected) });
    assert_eq!(vm.context_ref().datastack_depth(), 0);
}

#[test]
fn fixnum_multiplication_promotes_and_division_traps() {
    let mut vm = booted_vm();
    let times = make_word(&mut vm, "*");
    vm.dpush(Cell::from_fixnum(FIXNUM_MAX)).unwrap();
    vm.dpush(Cell::from_fixnum(FIXNUM_MAX)).unwrap();
    vm.call_callable(times);
    let product = pop(&mut vm);
    assert_eq!(product.tag(), TypeCode::Bignum as usize);
    let expected = vm.allot_bignum(FIXNUM_MAX as i128 * FIXNUM_MAX as i128);
    assert!(unsafe { cells_equal(product, expected) });

    // Division by zero raises the kernel error and runs the handler.
    let divi = make_word(&mut vm, "/i");
    vm.dpush(Cell::from_fixnum(10)).unwrap();
    vm.dpush(Cell::from_fixnum(0)).unwrap();
    vm.call_callable(divi);
    let error = pop(&mut vm);
    // SAFETY: the error object is a live array.
    unsafe {
        let arr = error.untagged() as *mut Array;
        assert_eq!(
            array_nth(arr, 1).to_fixnum(),
            rotor_core::error::KernelError::DivideByZero as isize
        );
    }
}

// ── Scenario 2: combinator fidelity ───────────────────────────────────

#[test]
fn bi_applies_both_quotations_in_order() {
    let mut vm = booted_vm();
    let plus = make_word(&mut vm, "+");
    let times = make_word(&mut vm, "*");
    let keep = make_word(&mut vm, "keep");
    let dip = make_word(&mut vm, "dip");
    let call = make_word(&mut vm, "call");

    // : bi ( x p q -- ) [ keep ] dip call ;
    let keep_quot = make_quotation(&mut vm, &[keep]);
    let bi = make_word_with_def(&mut vm, "bi", &[keep_quot, dip, call]);

    let add_one = make_quotation(&mut vm, &[Cell::from_fixnum(1), plus]);
    let double = make_quotation(&mut vm, &[Cell::from_fixnum(2), times]);

    vm.dpush(Cell::from_fixnum(3)).unwrap();
    vm.dpush(add_one).unwrap();
    vm.dpush(double).unwrap();
    vm.call_callable(bi);

    // Top-to-bottom: 6, 4.
    assert_eq!(pop(&mut vm).to_fixnum(), 6);
    assert_eq!(pop(&mut vm).to_fixnum(), 4);
    assert_eq!(vm.context_ref().datastack_depth(), 0);
}

#[test]
fn dip_runs_the_quotation_under_the_top_value() {
    let mut vm = booted_vm();
    let plus = make_word(&mut vm, "+");
    let dip = make_word(&mut vm, "dip");
    let add = make_quotation(&mut vm, &[plus]);

    vm.dpush(Cell::from_fixnum(10)).unwrap();
    vm.dpush(Cell::from_fixnum(20)).unwrap();
    vm.dpush(Cell::FALSE).unwrap();
    vm.dpush(add).unwrap();
    vm.call_callable(dip);

    // `+` ran beneath the preserved top value.
    assert!(pop(&mut vm).is_false());
    assert_eq!(pop(&mut vm).to_fixnum(), 30);
}

#[test]
fn loop_repeats_while_the_body_leaves_true() {
    let mut vm = booted_vm();
    // Count down from 5 via context object 0; the body decrements and
    // leaves counter > 0.
    let ctx_get = make_word(&mut vm, "context-object");
    let ctx_set = make_word(&mut vm, "set-context-object");
    let minus = make_word(&mut vm, "-");
    let dup = make_word(&mut vm, "dup");
    let gt = make_word(&mut vm, ">");
    let loop_word = make_word(&mut vm, "loop");

    vm.context().context_objects[0] = Cell::from_fixnum(5);
    // [ 0 context-object 1 - dup 0 set-context-object 0 > ]
    let body = make_quotation(
        &mut vm,
        &[
            Cell::from_fixnum(0),
            ctx_get,
            Cell::from_fixnum(1),
            minus,
            dup,
            Cell::from_fixnum(0),
            ctx_set,
            Cell::from_fixnum(0),
            gt,
        ],
    );
    vm.dpush(body).unwrap();
    vm.call_callable(loop_word);

    assert_eq!(vm.context().context_objects[0].to_fixnum(), 0);
    assert_eq!(vm.context_ref().datastack_depth(), 0);
}

#[test]
fn curry_captures_a_value_and_compose_chains() {
    let mut vm = booted_vm();
    let plus = make_word(&mut vm, "+");
    let times = make_word(&mut vm, "*");
    let curry = make_word(&mut vm, "curry");
    let compose = make_word(&mut vm, "compose");

    // call(curry(5, [ + ])) with 10 on the stack == push 5 then [ + ].
    let add = make_quotation(&mut vm, &[plus]);
    vm.dpush(Cell::from_fixnum(10)).unwrap();
    vm.dpush(Cell::from_fixnum(5)).unwrap();
    vm.dpush(add).unwrap();
    vm.call_callable(curry);
    let curried = pop(&mut vm);
    assert_eq!(curried.tag(), TypeCode::Tuple as usize);
    vm.call_callable(curried);
    assert_eq!(pop(&mut vm).to_fixnum(), 15);

    // compose([ 1 + ], [ 2 * ]) applies left-to-right.
    let add_one = make_quotation(&mut vm, &[Cell::from_fixnum(1), plus]);
    let double = make_quotation(&mut vm, &[Cell::from_fixnum(2), times]);
    vm.dpush(add_one).unwrap();
    vm.dpush(double).unwrap();
    vm.call_callable(compose);
    let composed = pop(&mut vm);
    vm.dpush(Cell::from_fixnum(4)).unwrap();
    vm.call_callable(composed);
    assert_eq!(pop(&mut vm).to_fixnum(), 10, "(4 + 1) * 2");
}

#[test]
fn quotation_primitive_call_pattern_dispatches_by_name() {
    let mut vm = booted_vm();
    let primitive_word = vm.special(SpecialObject::PrimitiveWord);
    let name = vm.allot_byte_array_from(b"primitive_datastack\0");
    let quot = make_quotation(&mut vm, &[Cell::from_fixnum(7), name, primitive_word]);

    vm.call_callable(quot);

    let snapshot = pop(&mut vm);
    assert_eq!(snapshot.tag(), TypeCode::Array as usize);
    // SAFETY: snapshot is a live array.
    unsafe {
        let arr = snapshot.untagged() as *mut Array;
        assert_eq!(array_capacity(arr), 1);
        assert_eq!(array_nth(arr, 0).to_fixnum(), 7);
    }
}

#[test]
fn declare_pattern_is_skipped() {
    let mut vm = booted_vm();
    let declare_word = vm.special(SpecialObject::DeclareWord);
    let hint = vm.allot_array(2, Cell::FALSE);
    let quot = make_quotation(
        &mut vm,
        &[Cell::from_fixnum(1), hint, declare_word, Cell::from_fixnum(2)],
    );
    vm.call_callable(quot);
    assert_eq!(pop(&mut vm).to_fixnum(), 2);
    assert_eq!(pop(&mut vm).to_fixnum(), 1);
    assert_eq!(vm.context_ref().datastack_depth(), 0);
}

// ── Scenario 3: generic dispatch through the megamorphic cache ────────

#[test]
fn tuple_method_dispatch_fills_the_cache() {
    let mut vm = booted_vm();
    let drop = make_word(&mut vm, "drop");
    let t_word = make_word(&mut vm, "T");
    let tuple_word = make_word(&mut vm, "tuple");
    let no_method = make_word(&mut vm, "no-method");

    // Class T at echelon 1 with hashcode 13.
    let layout = vm.allot_tuple_layout(t_word, 2, 1, &[(tuple_word, 0), (t_word, 13)]);

    // M's definition drops the receiver and pushes 42.
    let method = make_word_with_def(&mut vm, "M", &[drop, Cell::from_fixnum(42)]);

    // Echelon 1 bucket table: 4 buckets, 13 & 3 == 1.
    let mut buckets = vec![Cell::FALSE; 4];
    buckets[1] = method;
    let bucket_table = vm.allot_array_from(&buckets);
    let echelons = vm.allot_array_from(&[Cell::FALSE, bucket_table]);

    let mut methods = vec![Cell::FALSE; TYPE_COUNT];
    methods[0] = no_method;
    methods[TypeCode::Tuple as usize] = echelons;
    let methods = vm.allot_array_from(&methods);

    let cache = vm.allot_array(8, Cell::FALSE);
    let mega = make_word(&mut vm, "mega-cache-lookup");
    let generic = make_word_with_def(
        &mut vm,
        "G",
        &[methods, Cell::from_fixnum(0), cache, mega],
    );

    let instance = vm.allot_tuple(layout);
    vm.dpush(instance).unwrap();
    vm.call_callable(generic);

    assert_eq!(pop(&mut vm).to_fixnum(), 42, "T's method must run");
    assert_eq!(vm.context_ref().datastack_depth(), 0);

    // The call site cache now carries (layout of T, M).
    // SAFETY: cache is a live array.
    unsafe {
        let arr = cache.untagged() as *mut Array;
        let mut found = false;
        let mut i = 0;
        while i + 1 < array_capacity(arr) {
            if array_nth(arr, i) == layout {
                assert_eq!(array_nth(arr, i + 1), method);
                found = true;
            }
            i += 2;
        }
        assert!(found, "megamorphic cache must contain (layout, method)");
    }
}

#[test]
fn predicate_dispatch_falls_back_to_no_method() {
    let mut vm = booted_vm();
    let no_method = make_word_with_def(&mut vm, "no-method", &[Cell::from_fixnum(-1)]);

    // A predicate alist on the string tag that the interpreter cannot
    // evaluate.
    let alist = vm.allot_array(2, Cell::FALSE);
    let mut methods = vec![Cell::FALSE; TYPE_COUNT];
    methods[0] = no_method;
    methods[TypeCode::String as usize] = alist;
    let methods = vm.allot_array_from(&methods);

    let cache = vm.allot_array(8, Cell::FALSE);
    let mega = make_word(&mut vm, "mega-cache-lookup");
    let generic = make_word_with_def(
        &mut vm,
        "G",
        &[methods, Cell::from_fixnum(0), cache, mega],
    );

    let receiver = vm.allot_string_from("receiver");
    vm.dpush(receiver).unwrap();
    vm.call_callable(generic);
    assert_eq!(pop(&mut vm).to_fixnum(), -1, "no-method word must run");
    assert_eq!(pop(&mut vm).tag(), TypeCode::String as usize);
}

// ── Scenario 4: survivors of heavy nursery churn ──────────────────────

#[test]
fn anchored_arrays_survive_nursery_churn() {
    let mut vm = Vm::new(VmConfig {
        young_size: 64 << 10,
        aging_size: 64 << 10,
        tenured_size: 4 << 20,
        code_size: 64 << 10,
        datastack_size: 64 << 10,
        retainstack_size: 64 << 10,
        callstack_size: 64 << 10,
    });
    boot(&mut vm);

    const ELEMENTS: usize = 64;
    let bytes_per_array = 16 + ELEMENTS * 8;
    let total = 10 * vm.data.nursery.size / bytes_per_array;
    let mut kept = vec![Cell::FALSE; total / 2];

    // Anchor every keeper slot up front; the vector never reallocates.
    // SAFETY: `kept` outlives the anchors, popped in reverse below.
    unsafe {
        for slot in kept.iter_mut() {
            vm.data_roots.push(slot as *mut Cell);
        }
    }
    for i in 0..total {
        let array = vm.allot_array(ELEMENTS, Cell::from_fixnum(i as isize));
        if i % 2 == 0 {
            kept[i / 2] = array;
        }
    }
    for slot in kept.iter_mut().rev() {
        vm.data_roots.pop(slot as *mut Cell);
    }

    assert_eq!(kept.len(), total / 2);
    for (j, survivor) in kept.iter().enumerate() {
        // Invariant: each survivor lives in exactly one generation.
        let ptr = survivor.untagged();
        let generations = [
            vm.data.nursery.contains(ptr),
            vm.data.aging.contains(ptr),
            vm.data.tenured.contains(ptr),
        ];
        assert_eq!(
            generations.iter().filter(|&&g| g).count(),
            1,
            "survivor in exactly one generation"
        );
        // Contents round-trip.
        // SAFETY: survivor is a live array.
        unsafe {
            let arr = survivor.untagged() as *mut Array;
            assert_eq!(array_capacity(arr), ELEMENTS);
            for k in 0..ELEMENTS {
                assert_eq!(array_nth(arr, k).to_fixnum(), (j * 2) as isize);
            }
        }
    }
}

// ── Scenario 5: write barrier keeps a tenured→nursery edge alive ──────

#[test]
fn barriered_store_survives_a_minor_collection() {
    let mut vm = Vm::new(VmConfig {
        young_size: 16 << 10,
        aging_size: 16 << 10,
        tenured_size: 4 << 20,
        code_size: 64 << 10,
        datastack_size: 16 << 10,
        retainstack_size: 16 << 10,
        callstack_size: 16 << 10,
    });
    boot(&mut vm);

    // Large enough to bypass the nursery.
    let mut tenured_array = vm.allot_array(4096, Cell::FALSE);
    assert!(vm.data.tenured.contains(tenured_array.untagged()));

    let payload = vm.allot_string_from("payload");
    assert!(vm.data.nursery.contains(payload.untagged()));

    // SAFETY: both objects are live; the store goes through the write
    // barrier.
    let slot_addr = unsafe {
        let slot = array_data(tenured_array.untagged() as *mut Array);
        vm.store_slot(slot, payload);
        slot as usize
    };
    let card = vm.data.cards.addr_to_card(slot_addr);
    assert_ne!(
        vm.data.cards.card_flags(card) & CardFlags::POINTS_TO_NURSERY.bits(),
        0,
        "store must dirty the card"
    );

    // SAFETY: `tenured_array` lives on this frame until the pop below.
    unsafe { vm.data_roots.push(&raw mut tenured_array) };
    vm.gc(GcOp::Nursery, 0);
    vm.data_roots.pop(&raw mut tenured_array);

    // The string was evacuated and the slot rewritten.
    // SAFETY: tenured_array is live; slot 0 holds the moved string.
    unsafe {
        let moved = array_nth(tenured_array.untagged() as *mut Array, 0);
        assert_eq!(moved.tag(), TypeCode::String as usize);
        assert!(
            !vm.data.nursery.contains(moved.untagged()),
            "string must have left the nursery"
        );
        assert_eq!(string_bytes(moved.untagged() as *mut VmString), b"payload");
    }
    // The nursery bit is clear after the scan.
    let card = vm.data.cards.addr_to_card(slot_addr);
    assert_eq!(
        vm.data.cards.card_flags(card) & CardFlags::POINTS_TO_NURSERY.bits(),
        0,
        "points-to-nursery bit must be clear after the minor collection"
    );
}

// ── Scenario 6: error recovery ────────────────────────────────────────

#[test]
fn datastack_underflow_reaches_the_handler_and_vm_stays_usable() {
    let mut vm = booted_vm();
    let drop = make_word(&mut vm, "drop");

    vm.call_callable(drop);

    let error = pop(&mut vm);
    assert_eq!(error.tag(), TypeCode::Array as usize);
    // SAFETY: the error object is a live 4-element array.
    unsafe {
        let arr = error.untagged() as *mut Array;
        assert_eq!(array_capacity(arr), 4);
        assert_eq!(array_nth(arr, 0).to_fixnum(), KERNEL_ERROR_MARKER);
        assert_eq!(
            array_nth(arr, 1).to_fixnum(),
            rotor_core::error::KernelError::DatastackUnderflow as isize
        );
        assert!(array_nth(arr, 2).is_false());
        assert!(array_nth(arr, 3).is_false());
    }

    // The VM keeps working.
    let plus = make_word(&mut vm, "+");
    vm.dpush(Cell::from_fixnum(1)).unwrap();
    vm.dpush(Cell::from_fixnum(2)).unwrap();
    vm.call_callable(plus);
    assert_eq!(pop(&mut vm).to_fixnum(), 3);
}

// ── Round-trip laws ───────────────────────────────────────────────────

#[test]
fn clone_produces_structurally_equal_objects() {
    let mut vm = booted_vm();

    let elements = [Cell::from_fixnum(1), Cell::from_fixnum(2), Cell::FALSE];
    let array = vm.allot_array_from(&elements);
    vm.dpush(array).unwrap();
    dispatch_primitive(&mut vm, b"primitive_clone").unwrap();
    let cloned = pop(&mut vm);
    assert_ne!(cloned.raw(), array.raw(), "clone must be a fresh object");
    assert!(unsafe { cells_equal(cloned, array) });

    let string = vm.allot_string_from("carrier");
    vm.dpush(string).unwrap();
    dispatch_primitive(&mut vm, b"primitive_clone").unwrap();
    let cloned = pop(&mut vm);
    assert!(unsafe { cells_equal(cloned, string) });

    let bytes = vm.allot_byte_array_from(&[1, 2, 3, 4]);
    vm.dpush(bytes).unwrap();
    dispatch_primitive(&mut vm, b"primitive_clone").unwrap();
    let cloned = pop(&mut vm);
    assert!(unsafe { cells_equal(cloned, bytes) });

    // A tuple of the curried class, cloned shallowly.
    let layout = vm.special(SpecialObject::CurriedLayout);
    let tuple = vm.allot_tuple(layout);
    // SAFETY: tuple is live with two slots.
    unsafe {
        let data = rotor_core::objects::kinds::tuple_data(tuple.untagged() as *mut Tuple);
        *data = Cell::from_fixnum(11);
        *data.add(1) = Cell::from_fixnum(22);
    }
    vm.dpush(tuple).unwrap();
    dispatch_primitive(&mut vm, b"primitive_clone").unwrap();
    let cloned = pop(&mut vm);
    assert!(unsafe { cells_equal(cloned, tuple) });
}

#[test]
fn resize_preserves_a_prefix_and_fills_with_false() {
    let mut vm = booted_vm();
    let array = vm.allot_array(3, Cell::from_fixnum(7));

    // Grow.
    vm.dpush(Cell::from_fixnum(5)).unwrap();
    vm.dpush(array).unwrap();
    dispatch_primitive(&mut vm, b"primitive_resize_array").unwrap();
    let grown = pop(&mut vm);
    // SAFETY: grown is a live array.
    unsafe {
        let arr = grown.untagged() as *mut Array;
        assert_eq!(array_capacity(arr), 5);
        for i in 0..3 {
            assert_eq!(array_nth(arr, i).to_fixnum(), 7);
        }
        assert!(array_nth(arr, 3).is_false());
        assert!(array_nth(arr, 4).is_false());
    }

    // Shrink.
    vm.dpush(Cell::from_fixnum(1)).unwrap();
    vm.dpush(grown).unwrap();
    dispatch_primitive(&mut vm, b"primitive_resize_array").unwrap();
    let shrunk = pop(&mut vm);
    // SAFETY: shrunk is a live array.
    unsafe {
        assert_eq!(array_capacity(shrunk.untagged() as *mut Array), 1);
    }
}
