//! Generic-word method lookup and the megamorphic cache.
//!
//! A generic word's methods table is an array indexed by the primary
//! tag of the receiver.  The entry is either a concrete method (word or
//! quotation) or a secondary structure: for tuples, an echelon-indexed
//! array walked from the receiver's own echelon down to zero, each
//! level holding a concrete method or a bucketed hash table keyed by
//! (class, hashcode); for other tags, a predicate-dispatch association
//! list.  Predicates cannot be evaluated here, so a predicate alist
//! resolves to the tuple-class entry when the receiver is itself a
//! tuple-class word, and otherwise falls back to the no-method word in
//! slot 0 of the methods table.

use crate::error::TrapResult;
use crate::interp::WorkItem;
use crate::objects::cell::{Cell, TypeCode, TAG_BITS};
use crate::objects::kinds::{
    array_capacity, array_nth, layout_nth_hashcode, layout_nth_superclass, set_array_nth,
    string_bytes, Array, Tuple, TupleLayout, VmString, Word,
};
use crate::vm::Vm;

/// Dispatch counters exposed through the `dispatch_stats` primitive.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    pub megamorphic_cache_misses: u64,
}

/// The dispatch class of a receiver: its tuple layout, or its tag as a
/// fixnum.
///
/// # Safety
/// A non-immediate `obj` must be a live heap object.
pub unsafe fn object_class(obj: Cell) -> Cell {
    if !obj.is_immediate() && obj.type_code() == TypeCode::Tuple {
        (*(obj.untagged() as *mut Tuple)).layout
    } else {
        Cell::from_fixnum(obj.tag() as isize)
    }
}

/// Search a `[class method class method …]` alist backwards.
unsafe fn search_lookup_alist(table: Cell, klass: Cell) -> Cell {
    let elements = table.untagged() as *mut Array;
    let capacity = array_capacity(elements);
    let mut index = capacity as isize - 2;
    while index >= 0 {
        if array_nth(elements, index as usize) == klass {
            return array_nth(elements, index as usize + 1);
        }
        index -= 2;
    }
    Cell::FALSE
}

/// Probe a power-of-two bucket table keyed by (class, hashcode).  A
/// bucket is either a direct method or an alist to search linearly.
unsafe fn search_lookup_hash(table: Cell, klass: Cell, hashcode: usize) -> Cell {
    let buckets = table.untagged() as *mut Array;
    let bucket = array_nth(buckets, hashcode & (array_capacity(buckets) - 1));
    if !bucket.is_immediate() && bucket.type_code() == TypeCode::Array {
        search_lookup_alist(bucket, klass)
    } else {
        bucket
    }
}

/// Walk a tuple receiver's echelons from its own down to zero.
///
/// # Safety
/// `obj` must be a live tuple; `methods` a live echelon array.
pub unsafe fn lookup_tuple_method(vm: &Vm, obj: Cell, methods: Cell) -> Cell {
    let layout = (*(obj.untagged() as *mut Tuple)).layout.untagged() as *mut TupleLayout;
    let echelons = methods.untagged() as *mut Array;
    let mut echelon = (*layout)
        .echelon
        .to_fixnum()
        .min(array_capacity(echelons) as isize - 1);
    while echelon >= 0 {
        let entry = array_nth(echelons, echelon as usize);
        if !entry.is_immediate() && entry.type_code() == TypeCode::Word {
            return entry;
        }
        if entry.to_boolean() {
            let klass = layout_nth_superclass(layout, echelon as usize);
            let hashcode = layout_nth_hashcode(layout, echelon as usize).to_fixnum() as usize;
            let method = search_lookup_hash(entry, klass, hashcode);
            if method.to_boolean() {
                return method;
            }
        }
        echelon -= 1;
    }
    vm.fatal_error("no tuple method found", methods.raw());
}

unsafe fn word_named(word: Cell, name: &[u8]) -> bool {
    if word.is_immediate() || word.type_code() != TypeCode::Word {
        return false;
    }
    let word_name = (*(word.untagged() as *mut Word)).name;
    !word_name.is_immediate()
        && word_name.type_code() == TypeCode::String
        && string_bytes(word_name.untagged() as *mut VmString) == name
}

/// Does this word carry a `superclass` property, marking it as a
/// tuple-class word?  Properties are a `[key value …]` alist array.
unsafe fn is_tuple_class_word(word: Cell) -> bool {
    let props = (*(word.untagged() as *mut Word)).props;
    if props.is_immediate() || props.type_code() != TypeCode::Array {
        return false;
    }
    let elements = props.untagged() as *mut Array;
    let capacity = array_capacity(elements);
    let mut index = 0;
    while index + 1 < capacity {
        if word_named(array_nth(elements, index), b"superclass") {
            return true;
        }
        index += 2;
    }
    false
}

/// Resolve a method for `obj` in `methods`.
///
/// # Safety
/// `obj` must be an immediate or live heap object; `methods` a live
/// methods array.
pub unsafe fn lookup_method(vm: &Vm, obj: Cell, methods: Cell) -> Cell {
    let methods_array = methods.untagged() as *mut Array;
    let tag = obj.tag();
    let method = array_nth(methods_array, tag);

    if tag == TypeCode::Tuple as usize {
        if !method.is_immediate() && method.type_code() == TypeCode::Array {
            return lookup_tuple_method(vm, obj, method);
        }
        return method;
    }

    if !method.is_immediate() && method.type_code() == TypeCode::Array {
        // Predicate dispatch.  When the receiver is itself a
        // tuple-class word, the alist carries an entry keyed by the
        // `tuple-class` word; locate it directly.
        if tag == TypeCode::Word as usize && is_tuple_class_word(obj) {
            let alist = method.untagged() as *mut Array;
            let capacity = array_capacity(alist);
            let mut index = 0;
            while index + 1 < capacity {
                if word_named(array_nth(alist, index), b"tuple-class") {
                    return array_nth(alist, index + 1);
                }
                index += 2;
            }
        }
        // Predicates cannot run here; fall back to the no-method word.
        let no_method = array_nth(methods_array, 0);
        if !no_method.is_immediate() && no_method.type_code() == TypeCode::Word {
            return no_method;
        }
        vm.fatal_error("predicate dispatch with no no-method fallback", methods.raw());
    }

    method
}

fn method_cache_hashcode(klass: Cell, capacity: usize) -> usize {
    let slots = (capacity >> 1) - 1;
    ((klass.raw() >> TAG_BITS) & slots) << 1
}

/// Write a (class, method) pair into a call-site cache.
///
/// # Safety
/// `cache` must be a live array of even, power-of-two-plus-one-free
/// capacity as produced by the image's cache allocator.
pub unsafe fn update_method_cache(vm: &mut Vm, cache: Cell, klass: Cell, method: Cell) {
    let elements = cache.untagged() as *mut Array;
    let capacity = array_capacity(elements);
    if capacity < 2 {
        return;
    }
    let index = method_cache_hashcode(klass, capacity);
    set_array_nth(elements, index, klass);
    set_array_nth(elements, index + 1, method);
    let slot_addr = crate::objects::kinds::array_data(elements) as usize
        + index * crate::objects::cell::CELL_BYTES;
    vm.write_barrier(slot_addr);
}

/// `mega-cache-lookup ( methods index cache -- )`: resolve the method
/// for the receiver `index` cells below the stack top, update the
/// call-site cache, and execute the method.
pub fn mega_cache_lookup(vm: &mut Vm) -> TrapResult<()> {
    let cache = vm.dpop()?;
    let index = vm.dpop_fixnum()?;
    let methods = vm.dpop()?;
    let obj = vm.dpeek_nth(index.max(0) as usize)?;
    // SAFETY: all operands are live values off the data stack; lookup
    // and the cache update do not allocate.
    unsafe {
        let method = lookup_method(vm, obj, methods);
        update_method_cache(vm, cache, object_class(obj), method);
        if !method.is_immediate()
            && matches!(method.type_code(), TypeCode::Word | TypeCode::Quotation)
        {
            vm.work_stack.push(WorkItem::CallCallable(method));
            Ok(())
        } else {
            vm.fatal_error("mega-cache-lookup resolved a non-callable method", method.raw());
        }
    }
}

/// `mega-cache-miss ( methods index cache -- method )`: as the lookup
/// handler, but pushes the method instead of calling it, and counts
/// the miss.
pub fn mega_cache_miss(vm: &mut Vm) -> TrapResult<()> {
    vm.dispatch_stats.megamorphic_cache_misses += 1;
    let cache = vm.dpop()?;
    let index = vm.dpop_fixnum()?;
    let methods = vm.dpop()?;
    let obj = vm.dpeek_nth(index.max(0) as usize)?;
    // SAFETY: as `mega_cache_lookup`.
    unsafe {
        let method = lookup_method(vm, obj, methods);
        update_method_cache(vm, cache, object_class(obj), method);
        vm.dpush(method)
    }
}
