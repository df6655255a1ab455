//! The VM instance: one owned value holding the heaps, contexts, root
//! tables, and interpreter state.
//!
//! There is no global mutable state; everything threads through
//! `&mut Vm`.  There is exactly one mutator, and collections run
//! synchronously at allocation points, so none of this is `Sync` and no
//! locking exists anywhere.

use smallvec::SmallVec;

use crate::code::CodeHeap;
use crate::ctx::Context;
use crate::error::{KernelError, Trap, TrapResult, KERNEL_ERROR_MARKER};
use crate::gc::data_heap::DataHeap;
use crate::gc::data_roots::DataRoots;
use crate::gc::{GcEvent, GcOp};
use crate::interp::dispatch::DispatchStats;
use crate::interp::WorkItem;
use crate::objects::cell::{align_cell, Cell, TypeCode, CELL_BYTES};
use crate::objects::header::{Header, Object};
use crate::objects::kinds::{
    set_array_nth, string_data, tuple_data, Alien, Array, Bignum, BoxedFloat, ByteArray,
    Quotation, Tuple, TupleLayout, VmString, Word, Wrapper,
};
use crate::objects::bignum::digits_of;

/// Well-known special-object slots the core depends on.  The loader
/// (an external collaborator) populates these from the image; tests
/// install fixtures through [`Vm::set_special`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SpecialObject {
    /// The canonical `t` object.
    CanonicalTrue = 0,
    StartupQuot = 1,
    ShutdownQuot = 2,
    ErrorHandlerQuot = 3,
    /// Optional evaluate-string callable.
    EvalCallback = 4,
    /// `cell-size` as a fixnum.
    CellSize = 5,
    /// Command-line arguments, an array of aliens.
    Args = 6,
    Stdin = 7,
    Stdout = 8,
    Stderr = 9,
    /// Sentinel word marking the `[byte-array, primitive-call]` pattern
    /// in quotation arrays.
    PrimitiveWord = 10,
    /// Sentinel word marking the `[array, declare]` pattern.
    DeclareWord = 11,
    /// Tuple layout of the `curried` class.
    CurriedLayout = 12,
    /// Tuple layout of the `composed` class.
    ComposedLayout = 13,
    /// Set once the image has been through stage-2 bootstrap.
    Stage2 = 14,
}

/// Size of the special-object table.  Larger than the enum so images
/// can claim slots the core does not interpret.
pub const SPECIAL_OBJECT_COUNT: usize = 48;

/// Heap and stack sizes, in bytes.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub young_size: usize,
    pub aging_size: usize,
    pub tenured_size: usize,
    pub code_size: usize,
    pub datastack_size: usize,
    pub retainstack_size: usize,
    pub callstack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            young_size: 1 << 20,
            aging_size: 1 << 20,
            tenured_size: 16 << 20,
            code_size: 1 << 20,
            datastack_size: 128 << 10,
            retainstack_size: 128 << 10,
            callstack_size: 128 << 10,
        }
    }
}

pub struct Vm {
    pub data: DataHeap,
    pub code: CodeHeap,
    pub special_objects: [Cell; SPECIAL_OBJECT_COUNT],
    pub data_roots: DataRoots,
    pub(crate) mark_stack: Vec<usize>,
    pub(crate) work_stack: Vec<WorkItem>,
    pub(crate) contexts: Vec<Box<Context>>,
    pub(crate) ctx: *mut Context,
    pub gc_off: bool,
    pub(crate) current_gc: Option<GcOp>,
    pub(crate) faulting: bool,
    pub(crate) in_trampoline: bool,
    pub(crate) gc_events: Option<Vec<GcEvent>>,
    pub(crate) dispatch_stats: DispatchStats,
    /// Raw layout cells of the recognized `curried`/`composed` classes.
    /// Cleared after every collection: objects move.
    pub(crate) curried_layout: Cell,
    pub(crate) composed_layout: Cell,
    config: VmConfig,
}

impl Vm {
    pub fn new(config: VmConfig) -> Vm {
        let data = DataHeap::new(config.young_size, config.aging_size, config.tenured_size);
        let code = CodeHeap::new(config.code_size);
        let mut contexts = Vec::new();
        contexts.push(Box::new(Context::new(
            config.datastack_size,
            config.retainstack_size,
            config.callstack_size,
        )));
        let ctx: *mut Context = &mut *contexts[0];
        let mut vm = Vm {
            data,
            code,
            special_objects: [Cell::FALSE; SPECIAL_OBJECT_COUNT],
            data_roots: DataRoots::new(),
            mark_stack: Vec::new(),
            work_stack: Vec::new(),
            contexts,
            ctx,
            gc_off: false,
            current_gc: None,
            faulting: false,
            in_trampoline: false,
            gc_events: None,
            dispatch_stats: DispatchStats::default(),
            curried_layout: Cell::FALSE,
            composed_layout: Cell::FALSE,
            config,
        };
        vm.set_special(SpecialObject::CellSize, Cell::from_fixnum(CELL_BYTES as isize));
        vm
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The current context.
    #[inline]
    pub fn context(&mut self) -> &mut Context {
        // SAFETY: ctx always points at a boxed context owned by
        // `self.contexts`; boxes never move.
        unsafe { &mut *self.ctx }
    }

    /// Read-only view of the current context.
    #[inline]
    pub fn context_ref(&self) -> &Context {
        // SAFETY: as `context`.
        unsafe { &*self.ctx }
    }

    // ── Special objects ───────────────────────────────────────────────

    #[inline]
    pub fn special(&self, slot: SpecialObject) -> Cell {
        self.special_objects[slot as usize]
    }

    #[inline]
    pub fn set_special(&mut self, slot: SpecialObject, value: Cell) {
        self.special_objects[slot as usize] = value;
    }

    /// The canonical `t` for true, `f` for false.
    #[inline]
    pub fn from_boolean(&self, b: bool) -> Cell {
        if b {
            self.special(SpecialObject::CanonicalTrue)
        } else {
            Cell::FALSE
        }
    }

    // ── Stack operations ──────────────────────────────────────────────

    #[inline]
    pub fn dpush(&mut self, value: Cell) -> TrapResult<()> {
        if self.context().push(value) {
            Ok(())
        } else {
            Err(Trap::new(KernelError::DatastackOverflow))
        }
    }

    #[inline]
    pub fn dpop(&mut self) -> TrapResult<Cell> {
        self.context()
            .pop()
            .ok_or_else(|| Trap::new(KernelError::DatastackUnderflow))
    }

    #[inline]
    pub fn dpeek(&self) -> TrapResult<Cell> {
        self.context_ref()
            .peek()
            .ok_or_else(|| Trap::new(KernelError::DatastackUnderflow))
    }

    #[inline]
    pub fn dpeek_nth(&self, n: usize) -> TrapResult<Cell> {
        self.context_ref()
            .peek_nth(n)
            .ok_or_else(|| Trap::new(KernelError::DatastackUnderflow))
    }

    #[inline]
    pub fn rpush(&mut self, value: Cell) -> TrapResult<()> {
        if self.context().rpush(value) {
            Ok(())
        } else {
            Err(Trap::new(KernelError::RetainstackOverflow))
        }
    }

    #[inline]
    pub fn rpop(&mut self) -> TrapResult<Cell> {
        self.context()
            .rpop()
            .ok_or_else(|| Trap::new(KernelError::RetainstackUnderflow))
    }

    /// Pop a fixnum operand, raising a type check otherwise.
    pub fn dpop_fixnum(&mut self) -> TrapResult<isize> {
        let value = self.dpop()?;
        if value.is_fixnum() {
            Ok(value.to_fixnum())
        } else {
            Err(Trap::with_args(
                KernelError::TypeCheck,
                Cell::from_fixnum(TypeCode::Fixnum as isize),
                value,
            ))
        }
    }

    /// Pop an operand expected to carry the given heap tag.
    pub fn dpop_typed(&mut self, type_code: TypeCode) -> TrapResult<Cell> {
        let value = self.dpop()?;
        if !value.is_immediate() && value.type_code() == type_code {
            Ok(value)
        } else {
            Err(Trap::with_args(
                KernelError::TypeCheck,
                Cell::from_fixnum(type_code as isize),
                value,
            ))
        }
    }

    // ── Write barrier ─────────────────────────────────────────────────

    /// Record a potential older-to-younger edge created by a store to
    /// `slot_addr`.  Cheap enough to call unconditionally; addresses
    /// outside the data heap (stack and context slots are roots, not
    /// heap slots) are ignored.
    #[inline]
    pub fn write_barrier(&mut self, slot_addr: usize) {
        if slot_addr.wrapping_sub(self.data.start) < self.data.size {
            self.data.cards.write_barrier(slot_addr);
        }
    }

    /// Store `value` into a heap slot, applying the write barrier.
    ///
    /// # Safety
    /// `slot` must point into a live heap object.
    #[inline]
    pub unsafe fn store_slot(&mut self, slot: *mut Cell, value: Cell) {
        *slot = value;
        self.write_barrier(slot as usize);
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocate a raw object of `size` bytes (rounded up to the data
    /// alignment) with a live header.  May run a collection; any cell
    /// held across this call must be anchored in
    /// [`data_roots`](Self::data_roots).
    pub fn allot_object(&mut self, type_code: TypeCode, size: usize) -> *mut Object {
        let size = align_cell(size);
        if size >= self.data.nursery.size / 2 {
            return self.allot_large_object(type_code, size);
        }
        if self.data.nursery.free_space() < size {
            self.gc(GcOp::Nursery, size);
        }
        let obj = match self.data.nursery.allot(size) {
            Some(obj) => obj,
            None => self.fatal_error("nursery exhausted after collection", size),
        };
        // SAFETY: obj is a fresh allocation of `size` bytes.
        unsafe { (*obj).header = Header::live(type_code) };
        obj
    }

    /// Objects too large for the nursery go straight to tenured space.
    /// Their cards are marked dirty because the caller's initializing
    /// stores may install young pointers.
    fn allot_large_object(&mut self, type_code: TypeCode, size: usize) -> *mut Object {
        if !self.data.tenured.allocator.can_allot(size) {
            self.gc(GcOp::Full, size);
            if !self.data.tenured.allocator.can_allot(size) {
                self.gc(GcOp::GrowingDataHeap, size);
            }
        }
        let obj = match self.data.tenured.allot(size) {
            Some(obj) => obj,
            None => self.fatal_error("tenured exhausted after growing", size),
        };
        // SAFETY: obj is a fresh allocation of `size` bytes.
        unsafe { (*obj).header = Header::live(type_code) };
        self.data.cards.mark_range(obj as usize, size);
        obj
    }

    // ── Object factories ──────────────────────────────────────────────

    pub fn allot_array(&mut self, length: usize, mut fill: Cell) -> Cell {
        // SAFETY: `fill` lives on this frame until the pop below.
        unsafe {
            self.data_roots.push(&raw mut fill);
            let obj = self.allot_object(
                TypeCode::Array,
                std::mem::size_of::<Array>() + length * CELL_BYTES,
            );
            self.data_roots.pop(&raw mut fill);
            let arr = obj as *mut Array;
            (*arr).length = Cell::from_fixnum(length as isize);
            for i in 0..length {
                set_array_nth(arr, i, fill);
            }
            Cell::from_object(obj, TypeCode::Array)
        }
    }

    /// Array with the given elements.  The elements are anchored across
    /// the allocation, so callers may pass cells straight off the Rust
    /// stack.
    pub fn allot_array_from(&mut self, elements: &[Cell]) -> Cell {
        let mut elems: SmallVec<[Cell; 8]> = SmallVec::from_slice(elements);
        // SAFETY: `elems` lives on this frame; anchors are popped in
        // reverse order before it goes out of scope.
        unsafe {
            for e in elems.iter_mut() {
                self.data_roots.push(e as *mut Cell);
            }
            let arr = self.allot_array(elems.len(), Cell::FALSE);
            for e in elems.iter_mut().rev() {
                self.data_roots.pop(e as *mut Cell);
            }
            let ptr = arr.untagged() as *mut Array;
            for (i, e) in elems.iter().enumerate() {
                set_array_nth(ptr, i, *e);
            }
            arr
        }
    }

    pub fn allot_byte_array(&mut self, length: usize) -> Cell {
        let obj = self.allot_object(
            TypeCode::ByteArray,
            std::mem::size_of::<ByteArray>() + length,
        );
        // SAFETY: obj is a fresh byte array allocation.
        unsafe {
            let ba = obj as *mut ByteArray;
            (*ba).length = Cell::from_fixnum(length as isize);
            std::ptr::write_bytes(crate::objects::kinds::byte_array_data(ba), 0, length);
            Cell::from_object(obj, TypeCode::ByteArray)
        }
    }

    pub fn allot_byte_array_from(&mut self, bytes: &[u8]) -> Cell {
        let cell = self.allot_byte_array(bytes.len());
        // SAFETY: the byte array was just allocated with `bytes.len()`
        // bytes of payload.
        unsafe {
            let ba = cell.untagged() as *mut ByteArray;
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                crate::objects::kinds::byte_array_data(ba),
                bytes.len(),
            );
        }
        cell
    }

    pub fn allot_string(&mut self, length: usize, fill: u8) -> Cell {
        let obj = self.allot_object(TypeCode::String, std::mem::size_of::<VmString>() + length);
        // SAFETY: obj is a fresh string allocation.
        unsafe {
            let s = obj as *mut VmString;
            (*s).length = Cell::from_fixnum(length as isize);
            (*s).hashcode = Cell::FALSE;
            std::ptr::write_bytes(string_data(s), fill, length);
            Cell::from_object(obj, TypeCode::String)
        }
    }

    pub fn allot_string_from(&mut self, text: &str) -> Cell {
        let cell = self.allot_string(text.len(), 0);
        // SAFETY: the string was just allocated with `text.len()` bytes.
        unsafe {
            let s = cell.untagged() as *mut VmString;
            std::ptr::copy_nonoverlapping(text.as_ptr(), string_data(s), text.len());
        }
        cell
    }

    pub fn allot_quotation(&mut self, mut elements: Cell) -> Cell {
        // SAFETY: `elements` lives on this frame until the pop below.
        unsafe {
            self.data_roots.push(&raw mut elements);
            let obj = self.allot_object(TypeCode::Quotation, std::mem::size_of::<Quotation>());
            self.data_roots.pop(&raw mut elements);
            let q = obj as *mut Quotation;
            (*q).array = elements;
            (*q).cached_effect = Cell::FALSE;
            (*q).cache_counter = Cell::FALSE;
            (*q).entry_point = 0;
            Cell::from_object(obj, TypeCode::Quotation)
        }
    }

    pub fn allot_word(&mut self, mut name: Cell) -> Cell {
        // SAFETY: `name` lives on this frame until the pop below.
        unsafe {
            self.data_roots.push(&raw mut name);
            let obj = self.allot_object(TypeCode::Word, std::mem::size_of::<Word>());
            self.data_roots.pop(&raw mut name);
            let w = obj as *mut Word;
            (*w).hashcode = Cell::from_fixnum(0);
            (*w).name = name;
            (*w).vocabulary = Cell::FALSE;
            (*w).def = Cell::FALSE;
            (*w).props = Cell::FALSE;
            (*w).pic_def = Cell::FALSE;
            (*w).pic_tail_def = Cell::FALSE;
            (*w).subprimitive = Cell::FALSE;
            (*w).entry_point = 0;
            Cell::from_object(obj, TypeCode::Word)
        }
    }

    pub fn allot_wrapper(&mut self, mut inner: Cell) -> Cell {
        // SAFETY: `inner` lives on this frame until the pop below.
        unsafe {
            self.data_roots.push(&raw mut inner);
            let obj = self.allot_object(TypeCode::Wrapper, std::mem::size_of::<Wrapper>());
            self.data_roots.pop(&raw mut inner);
            (*(obj as *mut Wrapper)).object = inner;
            Cell::from_object(obj, TypeCode::Wrapper)
        }
    }

    /// Tuple with all slots `f`.  `layout` must be a tuple-layout cell.
    pub fn allot_tuple(&mut self, mut layout: Cell) -> Cell {
        debug_assert_eq!(layout.type_code(), TypeCode::TupleLayout);
        // SAFETY: `layout` lives on this frame until the pop below; its
        // size field is a fixnum and survives any GC move.
        unsafe {
            let slots = (*(layout.untagged() as *mut TupleLayout)).size.to_fixnum() as usize;
            self.data_roots.push(&raw mut layout);
            let obj = self.allot_object(
                TypeCode::Tuple,
                std::mem::size_of::<Tuple>() + slots * CELL_BYTES,
            );
            self.data_roots.pop(&raw mut layout);
            let t = obj as *mut Tuple;
            // The slot count rides in the header so heap walks never
            // size a tuple through its layout pointer.
            (*t).header = Header::live_with_aux(TypeCode::Tuple, slots);
            (*t).layout = layout;
            let data = tuple_data(t);
            for i in 0..slots {
                *data.add(i) = Cell::FALSE;
            }
            Cell::from_object(obj, TypeCode::Tuple)
        }
    }

    /// Build a tuple layout: class word, instance slot count, echelon,
    /// and the per-echelon (superclass, hashcode) pairs, highest
    /// echelon last.
    pub fn allot_tuple_layout(
        &mut self,
        klass: Cell,
        size: usize,
        echelon: usize,
        pairs: &[(Cell, isize)],
    ) -> Cell {
        debug_assert_eq!(pairs.len(), echelon + 1);
        // Flatten into an anchored scratch vector: the class cells must
        // survive the allocation below.
        let mut scratch: SmallVec<[Cell; 8]> = SmallVec::new();
        scratch.push(klass);
        for (superclass, _) in pairs {
            scratch.push(*superclass);
        }
        let capacity = 3 + 2 * pairs.len();
        // SAFETY: `scratch` lives on this frame; anchors are popped in
        // reverse order before it goes out of scope.
        unsafe {
            for c in scratch.iter_mut() {
                self.data_roots.push(c as *mut Cell);
            }
            let obj = self.allot_object(
                TypeCode::TupleLayout,
                2 * CELL_BYTES + capacity * CELL_BYTES,
            );
            for c in scratch.iter_mut().rev() {
                self.data_roots.pop(c as *mut Cell);
            }
            let layout = obj as *mut TupleLayout;
            (*layout).capacity = Cell::from_fixnum(capacity as isize);
            (*layout).klass = scratch[0];
            (*layout).size = Cell::from_fixnum(size as isize);
            (*layout).echelon = Cell::from_fixnum(echelon as isize);
            let pair_base = (layout as *mut u8).add(std::mem::size_of::<TupleLayout>()) as *mut Cell;
            for (i, (_, hashcode)) in pairs.iter().enumerate() {
                *pair_base.add(i * 2) = scratch[1 + i];
                *pair_base.add(i * 2 + 1) = Cell::from_fixnum(*hashcode);
            }
            Cell::from_object(obj, TypeCode::TupleLayout)
        }
    }

    pub fn allot_float(&mut self, n: f64) -> Cell {
        let obj = self.allot_object(TypeCode::Float, std::mem::size_of::<BoxedFloat>());
        // SAFETY: obj is a fresh float allocation.
        unsafe {
            (*(obj as *mut BoxedFloat)).n = n;
            Cell::from_object(obj, TypeCode::Float)
        }
    }

    /// Box an exact integer that overflowed the fixnum range.
    pub fn allot_bignum(&mut self, n: i128) -> Cell {
        let (negative, digits) = digits_of(n);
        let obj = self.allot_object(
            TypeCode::Bignum,
            std::mem::size_of::<Bignum>() + digits.len() * CELL_BYTES,
        );
        // SAFETY: obj is a fresh bignum allocation with space for
        // `digits.len()` digit words.
        unsafe {
            let b = obj as *mut Bignum;
            (*b).length = Cell::from_fixnum(digits.len() as isize);
            (*b).sign = Cell::from_fixnum(negative as isize);
            let base = (b as *mut u8).add(std::mem::size_of::<Bignum>()) as *mut usize;
            for (i, d) in digits.iter().enumerate() {
                *base.add(i) = *d;
            }
            Cell::from_object(obj, TypeCode::Bignum)
        }
    }

    /// Box the exact integer `n`, as a fixnum when it fits.
    pub fn allot_integer(&mut self, n: i128) -> Cell {
        if n >= crate::objects::cell::FIXNUM_MIN as i128
            && n <= crate::objects::cell::FIXNUM_MAX as i128
        {
            Cell::from_fixnum(n as isize)
        } else {
            self.allot_bignum(n)
        }
    }

    pub fn allot_alien(&mut self, mut base: Cell, address: usize) -> Cell {
        // SAFETY: `base` lives on this frame until the pop below.
        unsafe {
            self.data_roots.push(&raw mut base);
            let obj = self.allot_object(TypeCode::Alien, std::mem::size_of::<Alien>());
            self.data_roots.pop(&raw mut base);
            let a = obj as *mut Alien;
            (*a).base = base;
            (*a).expired = Cell::FALSE;
            (*a).displacement = 0;
            (*a).address = address;
            Cell::from_object(obj, TypeCode::Alien)
        }
    }

    // ── Errors ────────────────────────────────────────────────────────

    /// Raise a kernel error: normalize the stacks, build the 4-element
    /// error array, abandon the pending computation, and transfer
    /// control to the error-handler quotation.
    pub fn general_error(&mut self, trap: Trap) {
        if self.current_gc.is_some() {
            self.fatal_error("error raised inside a collection", trap.kind as usize);
        }
        self.faulting = true;
        self.context().fix_stacks();
        // An error thrown during a heap scan must not leave the
        // collector disabled.
        self.gc_off = false;

        let handler = self.special(SpecialObject::ErrorHandlerQuot);
        if !handler.to_boolean() {
            self.fatal_error(
                "error raised before the error handler was installed",
                trap.kind as usize,
            );
        }

        let error = self.allot_array_from(&[
            Cell::from_fixnum(KERNEL_ERROR_MARKER),
            Cell::from_fixnum(trap.kind as usize as isize),
            trap.arg1,
            trap.arg2,
        ]);

        // The computation that faulted is abandoned: its continuation
        // items and any anchors it held will never be used again.
        self.work_stack.clear();
        self.data_roots.clear();

        if !self.context().push(error) {
            // The data stack itself overflowed; start the handler from
            // a clean context rather than fault recursively.
            self.context().reset();
            if !self.context().push(error) {
                self.fatal_error("error object does not fit a fresh context", 0);
            }
        }
        self.work_stack.push(WorkItem::CallCallable(handler));
    }

    /// Unrecoverable failure: print a heap-layout diagnostic and abort.
    pub fn fatal_error(&self, message: &str, value: usize) -> ! {
        eprintln!("fatal_error: {message}: 0x{value:x}");
        eprintln!("heap: {}", self.data.describe());
        if let Some(op) = self.current_gc {
            eprintln!("during gc op: {op:?}");
        }
        std::process::abort();
    }

    // ── Post-GC hooks ─────────────────────────────────────────────────

    /// Drop raw layout pointers cached by the interpreter; a collection
    /// may have moved the layouts.
    pub(crate) fn clear_layout_caches(&mut self) {
        self.curried_layout = Cell::FALSE;
        self.composed_layout = Cell::FALSE;
    }
}
