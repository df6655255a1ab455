//! Primitive dispatch by byte-exact name.
//!
//! Compiled quotations invoke primitives through the two-element
//! pattern `[byte-array("primitive_<name>"), primitive-call-word]`.
//! Names are not interned: dispatch compares the literal bytes, which
//! the `match` below compiles to the branch-and-jump form a build-time
//! perfect hash would give.  The byte-array payload may be
//! NUL-terminated by the image; the name is cut at the first NUL.

use crate::error::TrapResult;
use crate::gc::GcOp;
use crate::interp::dispatch;
use crate::objects::cell::{Cell, TypeCode};
use crate::objects::header::Object;
use crate::objects::kinds::{
    array_capacity, array_data, array_nth, object_size, set_array_nth, tuple_data, Array,
    Tuple, TupleLayout,
};
use crate::vm::Vm;

/// Dispatch a primitive by name.  Returns `Ok(false)` for an unknown
/// name — fatal or not is the caller's decision (a subprimitive word
/// with an unknown name falls back to its definition; the quotation
/// call pattern treats it as fatal).
pub fn dispatch_primitive(vm: &mut Vm, name: &[u8]) -> TrapResult<bool> {
    let name = match name.iter().position(|&b| b == 0) {
        Some(nul) => &name[..nul],
        None => name,
    };
    match name {
        // ── Collector control ────────────────────────────────────────
        b"primitive_minor_gc" => vm.gc(GcOp::Nursery, 0),
        b"primitive_full_gc" => vm.gc(GcOp::Full, 0),
        b"primitive_compact_gc" => vm.gc(GcOp::Compact, 0),
        b"primitive_enable_gc_events" => vm.enable_gc_events(),
        b"primitive_disable_gc_events" => primitive_disable_gc_events(vm)?,

        // ── Sequences ────────────────────────────────────────────────
        b"primitive_array" => primitive_array(vm)?,
        b"primitive_resize_array" => primitive_resize_array(vm)?,
        b"primitive_byte_array" => {
            let n = vm.dpop_fixnum()?;
            let ba = vm.allot_byte_array(n.max(0) as usize);
            vm.dpush(ba)?;
        }
        b"primitive_string" => {
            let fill = vm.dpop_fixnum()?;
            let n = vm.dpop_fixnum()?;
            let s = vm.allot_string(n.max(0) as usize, fill as u8);
            vm.dpush(s)?;
        }
        b"primitive_tuple_boa" => primitive_tuple_boa(vm)?,
        b"primitive_clone" => primitive_clone(vm)?,
        b"primitive_datastack" => primitive_datastack(vm)?,

        // ── Dispatch ─────────────────────────────────────────────────
        b"primitive_lookup_method" => {
            let methods = vm.dpop()?;
            let obj = vm.dpop()?;
            // SAFETY: both operands are live values off the data stack.
            let method = unsafe { dispatch::lookup_method(vm, obj, methods) };
            vm.dpush(method)?;
        }
        b"primitive_mega_cache_miss" => dispatch::mega_cache_miss(vm)?,
        b"primitive_dispatch_stats" => {
            let misses = vm.dispatch_stats.megamorphic_cache_misses;
            vm.dpush(Cell::from_fixnum(misses as isize))?;
        }
        b"primitive_reset_dispatch_stats" => {
            vm.dispatch_stats = Default::default();
        }

        // ── External-collaborator stubs ──────────────────────────────
        // Threads, FFI and callstack replacement do not exist on this
        // platform; the words are accepted and do nothing beyond their
        // stack effect.
        b"primitive_set_callstack" => {
            vm.dpop()?;
        }
        b"primitive_sleep" => {
            vm.dpop()?;
        }
        b"primitive_yield" => {}

        _ => return Ok(false),
    }
    Ok(true)
}

/// `array ( n elt -- array )`
fn primitive_array(vm: &mut Vm) -> TrapResult<()> {
    let fill = vm.dpop()?;
    let n = vm.dpop_fixnum()?;
    let array = vm.allot_array(n.max(0) as usize, fill);
    vm.dpush(array)
}

/// `resize-array ( n array -- newarray )` — new slots are `f`.
fn primitive_resize_array(vm: &mut Vm) -> TrapResult<()> {
    let mut array = vm.dpop_typed(TypeCode::Array)?;
    let n = vm.dpop_fixnum()?.max(0) as usize;
    // SAFETY: `array` lives on this frame until the pop below and is
    // re-read after the allocation, which may move it.
    let resized = unsafe {
        vm.data_roots.push(&raw mut array);
        let resized = vm.allot_array(n, Cell::FALSE);
        vm.data_roots.pop(&raw mut array);
        let source = array.untagged() as *mut Array;
        let dest = resized.untagged() as *mut Array;
        let keep = array_capacity(source).min(n);
        for i in 0..keep {
            set_array_nth(dest, i, array_nth(source, i));
        }
        resized
    };
    vm.dpush(resized)
}

/// `<tuple-boa> ( ... layout -- tuple )` — slots filled from the stack,
/// last slot on top.
fn primitive_tuple_boa(vm: &mut Vm) -> TrapResult<()> {
    let layout = vm.dpop_typed(TypeCode::TupleLayout)?;
    // SAFETY: layout is a live tuple layout; its size field is a
    // fixnum.
    let slots =
        unsafe { (*(layout.untagged() as *mut TupleLayout)).size.to_fixnum().max(0) as usize };
    let tuple = vm.allot_tuple(layout);
    // SAFETY: the tuple was just allocated with `slots` slots; values
    // are popped straight into it with no intervening allocation.
    unsafe {
        let data = tuple_data(tuple.untagged() as *mut Tuple);
        for i in (0..slots).rev() {
            let value = vm.dpop()?;
            vm.store_slot(data.add(i), value);
        }
    }
    vm.dpush(tuple)
}

/// `clone ( obj -- clone )` — shallow copy; immediates are themselves.
fn primitive_clone(vm: &mut Vm) -> TrapResult<()> {
    let mut obj = vm.dpop()?;
    if obj.is_immediate() {
        return vm.dpush(obj);
    }
    let type_code = obj.type_code();
    // SAFETY: obj is live; the size is stable across a move, and obj is
    // re-read after the allocation.
    let cloned = unsafe {
        let size = object_size(obj.untagged());
        vm.data_roots.push(&raw mut obj);
        let dest = vm.allot_object(type_code, size);
        vm.data_roots.pop(&raw mut obj);
        std::ptr::copy_nonoverlapping(obj.untagged() as *const u8, dest as *mut u8, size);
        Cell::from_object(dest as *mut Object, type_code)
    };
    vm.dpush(cloned)
}

/// `datastack ( -- array )` — a snapshot of the data stack, bottom
/// first, not including the pushed result.
fn primitive_datastack(vm: &mut Vm) -> TrapResult<()> {
    let depth = vm.context_ref().datastack_depth();
    let array = vm.allot_array(depth, Cell::FALSE);
    // SAFETY: the stack segment does not move; the array was just
    // allocated with `depth` slots.
    unsafe {
        let dest = array.untagged() as *mut Array;
        let base = vm.context_ref().datastack_seg.start as *const Cell;
        for i in 0..depth {
            set_array_nth(dest, i, *base.add(i));
        }
    }
    vm.dpush(array)
}

/// `disable-gc-events ( -- events/f )` — each event is a 4-element
/// array of (op, cards scanned, decks scanned, nanoseconds).
fn primitive_disable_gc_events(vm: &mut Vm) -> TrapResult<()> {
    match vm.disable_gc_events() {
        None => vm.dpush(Cell::FALSE),
        Some(events) => {
            let mut result = vm.allot_array(events.len(), Cell::FALSE);
            // SAFETY: `result` lives on this frame until the pop below
            // and is re-read after each allocation.
            unsafe {
                vm.data_roots.push(&raw mut result);
                for (i, event) in events.iter().enumerate() {
                    let entry = vm.allot_array_from(&[
                        Cell::from_fixnum(event.op as isize),
                        Cell::from_fixnum(event.cards_scanned as isize),
                        Cell::from_fixnum(event.decks_scanned as isize),
                        Cell::from_fixnum(
                            event
                                .duration
                                .as_nanos()
                                .min(crate::objects::cell::FIXNUM_MAX as u128)
                                as isize,
                        ),
                    ]);
                    let dest = result.untagged() as *mut Array;
                    let slot = array_data(dest).add(i);
                    vm.store_slot(slot, entry);
                }
                vm.data_roots.pop(&raw mut result);
            }
            vm.dpush(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_primitive_is_reported() {
        let mut vm = Vm::new(crate::vm::VmConfig::default());
        let handled = dispatch_primitive(&mut vm, b"primitive_no_such_thing").unwrap();
        assert!(!handled);
    }

    #[test]
    fn names_are_cut_at_the_first_nul() {
        let mut vm = Vm::new(crate::vm::VmConfig::default());
        let handled = dispatch_primitive(&mut vm, b"primitive_yield\0\0\0").unwrap();
        assert!(handled);
    }
}
