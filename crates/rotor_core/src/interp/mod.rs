//! The trampoline interpreter.
//!
//! The interpreter never calls itself on the host stack.  All pending
//! work lives in an explicit stack of [`WorkItem`]s owned by the VM; a
//! single loop pops items until none remain.  A word call therefore
//! never nests: executing a word pushes the continuation of the current
//! quotation *first*, then the item for the word itself, and returns to
//! the loop.
//!
//! Cells inside work items are visited by the root scan, so a pending
//! continuation survives any collection triggered mid-execution.

/// Built-in handler dispatch (stack ops, arithmetic, combinators).
pub mod handlers;
/// Primitive dispatch by byte-exact name.
pub mod primitives;
/// Generic-word method lookup and the megamorphic cache.
pub mod dispatch;

use smallvec::SmallVec;

use crate::error::TrapResult;
use crate::objects::cell::{Cell, TypeCode};
use crate::objects::kinds::{
    array_capacity, array_nth, byte_array_bytes, string_bytes, Array, ByteArray, Quotation,
    Tuple, TupleLayout, VmString, Word, Wrapper,
};
use crate::vm::{SpecialObject, Vm};

/// One unit of pending interpreter work.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// Call a quotation, word, wrapper, or callable tuple.
    CallCallable(Cell),
    /// Resume a quotation's element array at `index`.
    QuotationContinue {
        array: Cell,
        length: usize,
        index: usize,
    },
    /// Push a literal onto the data stack.
    PushValue(Cell),
    /// Push 1–3 saved cells back (dip/keep plumbing).
    RestoreValues { values: SmallVec<[Cell; 3]> },
    /// Re-invoke the quotation iff the data stack top is true.
    LoopContinue(Cell),
}

impl Vm {
    /// Enqueue a callable and, unless a trampoline is already running,
    /// drain the work stack.  Re-entrant calls from within a running
    /// trampoline just enqueue: the outer loop picks the item up, so
    /// the host stack never grows with interpreter nesting depth.
    pub fn call_callable(&mut self, callable: Cell) {
        self.work_stack.push(WorkItem::CallCallable(callable));
        self.run_trampoline();
    }

    /// The driver loop.
    pub fn run_trampoline(&mut self) {
        if self.in_trampoline {
            return;
        }
        self.in_trampoline = true;
        while let Some(item) = self.work_stack.pop() {
            if let Err(trap) = self.step(item) {
                self.general_error(trap);
            }
        }
        self.in_trampoline = false;
    }

    fn step(&mut self, item: WorkItem) -> TrapResult<()> {
        match item {
            WorkItem::CallCallable(callable) => self.step_callable(callable),
            WorkItem::QuotationContinue {
                array,
                length,
                index,
            } => self.step_quotation(array, length, index),
            WorkItem::PushValue(value) => self.dpush(value),
            WorkItem::RestoreValues { values } => {
                for value in values {
                    self.dpush(value)?;
                }
                Ok(())
            }
            WorkItem::LoopContinue(quot) => {
                let flag = self.dpop()?;
                if flag.to_boolean() {
                    // Check again after the body runs.
                    self.work_stack.push(WorkItem::LoopContinue(quot));
                    self.work_stack.push(WorkItem::CallCallable(quot));
                }
                Ok(())
            }
        }
    }

    /// Push a continuation for `array[index..]` if anything remains.
    pub(crate) fn push_quotation_work(&mut self, array: Cell, length: usize, index: usize) {
        if index < length {
            self.work_stack.push(WorkItem::QuotationContinue {
                array,
                length,
                index,
            });
        }
    }

    fn step_callable(&mut self, mut callable: Cell) -> TrapResult<()> {
        // An error transfer enqueues the handler as the next callable;
        // reaching it means the handler has begun.
        if self.faulting {
            self.faulting = false;
        }
        if callable.is_immediate() {
            return Ok(());
        }
        // The cell was popped off the work stack, so it is no longer a
        // root; anchor it for the duration (handlers may collect).
        // SAFETY: `callable` lives on this frame until the pop below.
        // The pop is unconditional: a trap propagating out of here must
        // not leave an anchor pointing at this frame while the error
        // path allocates.
        unsafe { self.data_roots.push(&raw mut callable) };
        let result = self.step_callable_anchored(&mut callable);
        self.data_roots.pop(&raw mut callable);
        result
    }

    fn step_callable_anchored(&mut self, callable: &mut Cell) -> TrapResult<()> {
        match callable.type_code() {
            TypeCode::Quotation => {
                // SAFETY: callable is a live quotation.
                unsafe {
                    let quot = callable.untagged() as *mut Quotation;
                    let array = (*quot).array;
                    let length = array_capacity(array.untagged() as *mut Array);
                    self.push_quotation_work(array, length, 0);
                }
                Ok(())
            }
            TypeCode::Word => self.step_word(callable),
            TypeCode::Wrapper => {
                // SAFETY: callable is a live wrapper.
                let inner = unsafe { (*(callable.untagged() as *mut Wrapper)).object };
                self.work_stack.push(WorkItem::CallCallable(inner));
                Ok(())
            }
            TypeCode::Tuple => self.step_callable_tuple(callable),
            _ => Ok(()),
        }
    }

    fn step_word(&mut self, word: &mut Cell) -> TrapResult<()> {
        // Dispatch order: cached handler id, then subprimitive name,
        // then the quotation definition.
        // SAFETY: word stays anchored by the caller; pointers are
        // re-derived from it after every call that can allocate.
        unsafe {
            let w = word.untagged() as *mut Word;
            if let Some(id) = handlers::lookup_cached_handler(w) {
                if handlers::dispatch_handler(self, id)? {
                    return Ok(());
                }
            }

            // Subprimitive words carry their primitive name as a byte
            // array; copy it out before dispatching, which may collect.
            let w = word.untagged() as *mut Word;
            let subprimitive = (*w).subprimitive;
            if !subprimitive.is_immediate()
                && subprimitive.type_code() == TypeCode::ByteArray
            {
                let name: SmallVec<[u8; 32]> = SmallVec::from_slice(byte_array_bytes(
                    subprimitive.untagged() as *mut ByteArray,
                ));
                if primitives::dispatch_primitive(self, &name)? {
                    return Ok(());
                }
            }

            // Fall back to the word's quotation definition.
            let w = word.untagged() as *mut Word;
            let def = (*w).def;
            if !def.is_immediate() && def.type_code() == TypeCode::Quotation {
                let array = (*(def.untagged() as *mut Quotation)).array;
                let length = array_capacity(array.untagged() as *mut Array);
                self.push_quotation_work(array, length, 0);
            }
            Ok(())
        }
    }

    /// Callable tuples: instances of the `curried` and `composed`
    /// classes.  Anything else is ignored, like the compiled backend.
    fn step_callable_tuple(&mut self, callable: &mut Cell) -> TrapResult<()> {
        // SAFETY: callable is a live tuple; class checks do not
        // allocate.
        unsafe {
            let tuple = callable.untagged() as *mut Tuple;
            let layout = (*tuple).layout;
            if self.is_tuple_class(layout, SpecialObject::CurriedLayout, b"curried") {
                let data = crate::objects::kinds::tuple_data(tuple);
                let obj = *data;
                let quot = *data.add(1);
                self.dpush(obj)?;
                self.work_stack.push(WorkItem::CallCallable(quot));
            } else if self.is_tuple_class(layout, SpecialObject::ComposedLayout, b"composed") {
                let data = crate::objects::kinds::tuple_data(tuple);
                let first = *data;
                let second = *data.add(1);
                // LIFO: `first` runs before `second`.
                self.work_stack.push(WorkItem::CallCallable(second));
                self.work_stack.push(WorkItem::CallCallable(first));
            }
            Ok(())
        }
    }

    /// Test a tuple layout against a known class, first by the layout
    /// cell cached since the last collection, then by the class word's
    /// name (caching the layout on a hit).
    ///
    /// # Safety
    /// `layout` must reference a live tuple layout.
    pub(crate) unsafe fn is_tuple_class(
        &mut self,
        layout: Cell,
        slot: SpecialObject,
        class_name: &[u8],
    ) -> bool {
        let cached = match slot {
            SpecialObject::CurriedLayout => &mut self.curried_layout,
            SpecialObject::ComposedLayout => &mut self.composed_layout,
            _ => unreachable!("not a layout cache slot"),
        };
        if cached.to_boolean() {
            return *cached == layout;
        }
        // Prefer the loader-installed layout; fall back to matching the
        // class word's name for fixture-built images.
        let installed = self.special(slot);
        let matches = if installed.to_boolean() {
            installed == layout
        } else {
            let klass = (*(layout.untagged() as *mut TupleLayout)).klass;
            if klass.is_immediate() || klass.type_code() != TypeCode::Word {
                return false;
            }
            let name = (*(klass.untagged() as *mut Word)).name;
            !name.is_immediate()
                && name.type_code() == TypeCode::String
                && string_bytes(name.untagged() as *mut VmString) == class_name
        };
        if matches {
            match slot {
                SpecialObject::CurriedLayout => self.curried_layout = layout,
                SpecialObject::ComposedLayout => self.composed_layout = layout,
                _ => unreachable!(),
            }
        }
        matches
    }

    fn step_quotation(&mut self, array: Cell, length: usize, index: usize) -> TrapResult<()> {
        // SAFETY: `array` is a live element array; it was re-rooted via
        // the continuation item pushed before any dispatch below.
        unsafe {
            let arr = array.untagged() as *mut Array;
            let element = array_nth(arr, index);

            // `[byte-array, primitive-call]`: invoke the named
            // primitive and advance past the marker pair.
            let primitive_word = self.special(SpecialObject::PrimitiveWord);
            if primitive_word.to_boolean()
                && !element.is_immediate()
                && element.type_code() == TypeCode::ByteArray
                && index + 1 < length
                && array_nth(arr, index + 1) == primitive_word
            {
                self.push_quotation_work(array, length, index + 2);
                let name: SmallVec<[u8; 32]> = SmallVec::from_slice(byte_array_bytes(
                    element.untagged() as *mut ByteArray,
                ));
                if !primitives::dispatch_primitive(self, &name)? {
                    self.fatal_error("unknown primitive", element.raw());
                }
                return Ok(());
            }

            // `[array, declare]`: a type-declaration hint; skip both.
            let declare_word = self.special(SpecialObject::DeclareWord);
            if declare_word.to_boolean()
                && !element.is_immediate()
                && element.type_code() == TypeCode::Array
                && index + 1 < length
                && array_nth(arr, index + 1) == declare_word
            {
                self.push_quotation_work(array, length, index + 2);
                return Ok(());
            }

            // Re-push the continuation before dispatching the element:
            // this is what preserves the rest of the quotation across a
            // word call without host-stack recursion.
            self.push_quotation_work(array, length, index + 1);

            if element.is_immediate() {
                return self.dpush(element);
            }
            match element.type_code() {
                TypeCode::Word => {
                    self.work_stack.push(WorkItem::CallCallable(element));
                    Ok(())
                }
                TypeCode::Wrapper => {
                    let inner = (*(element.untagged() as *mut Wrapper)).object;
                    self.dpush(inner)
                }
                _ => self.dpush(element),
            }
        }
    }
}
