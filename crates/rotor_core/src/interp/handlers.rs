//! Built-in word handlers: stack shuffling, fixnum arithmetic with
//! bignum promotion, slot access, and the control-flow combinators.
//!
//! Every word carries a handler-id cache in its `pic_def` slot (unused
//! by the interpreter otherwise): a fixnum whose high bits hold a magic
//! marker distinguishing "never looked up" from "looked up, no
//! handler".  The cache survives GC because it is an immediate slot
//! value.
//!
//! A handler may decline its operands by returning `Ok(false)` — e.g.
//! `length` on a tuple class it does not know — in which case the word
//! dispatch falls back to the word's quotation definition unchanged.

use smallvec::SmallVec;

use crate::error::{KernelError, Trap, TrapResult};
use crate::interp::{dispatch, WorkItem};
use crate::objects::cell::{Cell, TypeCode};
use crate::objects::kinds::{
    array_capacity, cells_eq, cells_equal, string_bytes, tuple_data, Array, ByteArray,
    Quotation, Tuple, VmString, Word,
};
use crate::vm::{SpecialObject, Vm, SPECIAL_OBJECT_COUNT};
use crate::ctx::CONTEXT_OBJECT_COUNT;

/// Magic marker in the high bits of a cached handler id.
const HANDLER_MAGIC: usize = 0xFA57_0000;
const HANDLER_MAGIC_MASK: usize = 0xFFFF_0000;
/// Cached index meaning "no handler; run the definition".
const HANDLER_NONE_INDEX: usize = 0xFFFF;

/// The interpreter's built-in behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerId {
    // Control flow and combinators.
    If,
    When,
    Unless,
    Choice,
    Call,
    Execute,
    Dip,
    TwoDip,
    ThreeDip,
    Keep,
    TwoKeep,
    ThreeKeep,
    Loop,
    Curry,
    Compose,
    Prepose,
    MegaCacheLookup,
    // Stack shuffling.
    Dup,
    TwoDup,
    ThreeDup,
    FourDup,
    Dupd,
    Drop,
    TwoDrop,
    ThreeDrop,
    FourDrop,
    Nip,
    TwoNip,
    Over,
    TwoOver,
    Pick,
    Swap,
    Swapd,
    Rot,
    NegRot,
    // Predicates and equality.
    Eq,
    Equal,
    BothFixnums,
    CallableP,
    // Fixnum arithmetic (promoting on overflow).
    FixnumPlus,
    FixnumMinus,
    FixnumTimes,
    FixnumDivi,
    FixnumMod,
    FixnumDivmod,
    FixnumShift,
    FixnumBitand,
    FixnumBitor,
    FixnumBitxor,
    FixnumBitnot,
    FixnumLt,
    FixnumLe,
    FixnumGt,
    FixnumGe,
    // Object access.
    Tag,
    Slot,
    SetSlot,
    Length,
    SpecialObjectGet,
    SpecialObjectSet,
    ContextObjectGet,
    ContextObjectSet,
}

/// Word-name → handler table.  Compiled-image names (`fixnum+`,
/// `fixnum<` …) and the plain math words map to the same handlers; the
/// `*-fast` and `-unsafe` spellings the image emits are aliases.
const HANDLER_TABLE: &[(&[u8], HandlerId)] = &[
    (b"if", HandlerId::If),
    (b"when", HandlerId::When),
    (b"unless", HandlerId::Unless),
    (b"?", HandlerId::Choice),
    (b"call", HandlerId::Call),
    (b"(call)", HandlerId::Call),
    (b"call-effect", HandlerId::Call),
    (b"call-effect-unsafe", HandlerId::Call),
    (b"execute", HandlerId::Execute),
    (b"(execute)", HandlerId::Execute),
    (b"execute-effect", HandlerId::Execute),
    (b"execute-effect-unsafe", HandlerId::Execute),
    (b"dip", HandlerId::Dip),
    (b"2dip", HandlerId::TwoDip),
    (b"3dip", HandlerId::ThreeDip),
    (b"keep", HandlerId::Keep),
    (b"2keep", HandlerId::TwoKeep),
    (b"3keep", HandlerId::ThreeKeep),
    (b"loop", HandlerId::Loop),
    (b"curry", HandlerId::Curry),
    (b"compose", HandlerId::Compose),
    (b"prepose", HandlerId::Prepose),
    (b"mega-cache-lookup", HandlerId::MegaCacheLookup),
    (b"dup", HandlerId::Dup),
    (b"2dup", HandlerId::TwoDup),
    (b"3dup", HandlerId::ThreeDup),
    (b"4dup", HandlerId::FourDup),
    (b"dupd", HandlerId::Dupd),
    (b"drop", HandlerId::Drop),
    (b"2drop", HandlerId::TwoDrop),
    (b"3drop", HandlerId::ThreeDrop),
    (b"4drop", HandlerId::FourDrop),
    (b"nip", HandlerId::Nip),
    (b"2nip", HandlerId::TwoNip),
    (b"over", HandlerId::Over),
    (b"2over", HandlerId::TwoOver),
    (b"pick", HandlerId::Pick),
    (b"swap", HandlerId::Swap),
    (b"swapd", HandlerId::Swapd),
    (b"rot", HandlerId::Rot),
    (b"-rot", HandlerId::NegRot),
    (b"eq?", HandlerId::Eq),
    (b"equal?", HandlerId::Equal),
    (b"both-fixnums?", HandlerId::BothFixnums),
    (b"callable?", HandlerId::CallableP),
    (b"+", HandlerId::FixnumPlus),
    (b"fixnum+", HandlerId::FixnumPlus),
    (b"fixnum+fast", HandlerId::FixnumPlus),
    (b"-", HandlerId::FixnumMinus),
    (b"fixnum-", HandlerId::FixnumMinus),
    (b"fixnum-fast", HandlerId::FixnumMinus),
    (b"*", HandlerId::FixnumTimes),
    (b"fixnum*", HandlerId::FixnumTimes),
    (b"fixnum*fast", HandlerId::FixnumTimes),
    (b"/i", HandlerId::FixnumDivi),
    (b"fixnum/i", HandlerId::FixnumDivi),
    (b"fixnum/i-fast", HandlerId::FixnumDivi),
    (b"mod", HandlerId::FixnumMod),
    (b"fixnum-mod", HandlerId::FixnumMod),
    (b"/mod", HandlerId::FixnumDivmod),
    (b"fixnum/mod", HandlerId::FixnumDivmod),
    (b"fixnum/mod-fast", HandlerId::FixnumDivmod),
    (b"shift", HandlerId::FixnumShift),
    (b"fixnum-shift", HandlerId::FixnumShift),
    (b"fixnum-shift-fast", HandlerId::FixnumShift),
    (b"bitand", HandlerId::FixnumBitand),
    (b"fixnum-bitand", HandlerId::FixnumBitand),
    (b"bitor", HandlerId::FixnumBitor),
    (b"fixnum-bitor", HandlerId::FixnumBitor),
    (b"bitxor", HandlerId::FixnumBitxor),
    (b"fixnum-bitxor", HandlerId::FixnumBitxor),
    (b"bitnot", HandlerId::FixnumBitnot),
    (b"fixnum-bitnot", HandlerId::FixnumBitnot),
    (b"<", HandlerId::FixnumLt),
    (b"fixnum<", HandlerId::FixnumLt),
    (b"<=", HandlerId::FixnumLe),
    (b"fixnum<=", HandlerId::FixnumLe),
    (b">", HandlerId::FixnumGt),
    (b"fixnum>", HandlerId::FixnumGt),
    (b">=", HandlerId::FixnumGe),
    (b"fixnum>=", HandlerId::FixnumGe),
    (b"tag", HandlerId::Tag),
    (b"slot", HandlerId::Slot),
    (b"set-slot", HandlerId::SetSlot),
    (b"length", HandlerId::Length),
    (b"special-object", HandlerId::SpecialObjectGet),
    (b"set-special-object", HandlerId::SpecialObjectSet),
    (b"context-object", HandlerId::ContextObjectGet),
    (b"set-context-object", HandlerId::ContextObjectSet),
];

/// Read the word's cached handler id, populating the cache by name on
/// the first encounter.  Returns `None` when the word has no built-in
/// behavior (run its definition).
///
/// # Safety
/// `word` must point to a live word object.
pub unsafe fn lookup_cached_handler(word: *mut Word) -> Option<HandlerId> {
    let cached = (*word).pic_def;
    if cached.is_fixnum() {
        let raw = cached.to_fixnum() as usize;
        if raw & HANDLER_MAGIC_MASK == HANDLER_MAGIC {
            let index = raw & 0xFFFF;
            return if index == HANDLER_NONE_INDEX {
                None
            } else {
                Some(HANDLER_TABLE[index].1)
            };
        }
    }

    let name = (*word).name;
    let index = if !name.is_immediate() && name.type_code() == TypeCode::String {
        let bytes = string_bytes(name.untagged() as *mut VmString);
        HANDLER_TABLE.iter().position(|(n, _)| *n == bytes)
    } else {
        None
    };
    let encoded = HANDLER_MAGIC | index.unwrap_or(HANDLER_NONE_INDEX);
    (*word).pic_def = Cell::from_fixnum(encoded as isize);
    index.map(|i| HANDLER_TABLE[i].1)
}

/// The fixnum intermediate range check, shared by the promoting ops.
fn push_integer(vm: &mut Vm, n: i128) -> TrapResult<()> {
    let value = vm.allot_integer(n);
    vm.dpush(value)
}

/// Pop two fixnum operands, or decline without touching the stack.
fn pop_fixnum_pair(vm: &mut Vm) -> TrapResult<Option<(isize, isize)>> {
    let y = vm.dpeek()?;
    let x = vm.dpeek_nth(1)?;
    if !x.is_fixnum() || !y.is_fixnum() {
        return Ok(None);
    }
    vm.dpop()?;
    vm.dpop()?;
    Ok(Some((x.to_fixnum(), y.to_fixnum())))
}

fn nonzero(y: isize) -> TrapResult<isize> {
    if y == 0 {
        Err(Trap::new(KernelError::DivideByZero))
    } else {
        Ok(y)
    }
}

/// Execute a handler.  `Ok(false)` means the handler does not apply to
/// the operands and the word's definition should run instead.
pub fn dispatch_handler(vm: &mut Vm, id: HandlerId) -> TrapResult<bool> {
    match id {
        // ── Control flow ─────────────────────────────────────────────
        HandlerId::If => {
            let false_quot = vm.dpop()?;
            let true_quot = vm.dpop()?;
            let cond = vm.dpop()?;
            let branch = if cond.to_boolean() { true_quot } else { false_quot };
            vm.work_stack.push(WorkItem::CallCallable(branch));
        }
        HandlerId::When => {
            let quot = vm.dpop()?;
            let cond = vm.dpop()?;
            if cond.to_boolean() {
                vm.work_stack.push(WorkItem::CallCallable(quot));
            }
        }
        HandlerId::Unless => {
            let quot = vm.dpop()?;
            let cond = vm.dpop()?;
            if !cond.to_boolean() {
                vm.work_stack.push(WorkItem::CallCallable(quot));
            }
        }
        HandlerId::Choice => {
            let false_value = vm.dpop()?;
            let true_value = vm.dpop()?;
            let cond = vm.dpop()?;
            vm.dpush(if cond.to_boolean() { true_value } else { false_value })?;
        }
        HandlerId::Call | HandlerId::Execute => {
            let callable = vm.dpop()?;
            vm.work_stack.push(WorkItem::CallCallable(callable));
        }
        HandlerId::Dip => {
            let quot = vm.dpop()?;
            let x = vm.dpop()?;
            vm.work_stack.push(WorkItem::RestoreValues {
                values: SmallVec::from_slice(&[x]),
            });
            vm.work_stack.push(WorkItem::CallCallable(quot));
        }
        HandlerId::TwoDip => {
            let quot = vm.dpop()?;
            let y = vm.dpop()?;
            let x = vm.dpop()?;
            vm.work_stack.push(WorkItem::RestoreValues {
                values: SmallVec::from_slice(&[x, y]),
            });
            vm.work_stack.push(WorkItem::CallCallable(quot));
        }
        HandlerId::ThreeDip => {
            let quot = vm.dpop()?;
            let z = vm.dpop()?;
            let y = vm.dpop()?;
            let x = vm.dpop()?;
            vm.work_stack.push(WorkItem::RestoreValues {
                values: SmallVec::from_slice(&[x, y, z]),
            });
            vm.work_stack.push(WorkItem::CallCallable(quot));
        }
        HandlerId::Keep => {
            let quot = vm.dpop()?;
            let x = vm.dpeek()?;
            vm.work_stack.push(WorkItem::RestoreValues {
                values: SmallVec::from_slice(&[x]),
            });
            vm.work_stack.push(WorkItem::CallCallable(quot));
        }
        HandlerId::TwoKeep => {
            let quot = vm.dpop()?;
            let y = vm.dpeek()?;
            let x = vm.dpeek_nth(1)?;
            vm.work_stack.push(WorkItem::RestoreValues {
                values: SmallVec::from_slice(&[x, y]),
            });
            vm.work_stack.push(WorkItem::CallCallable(quot));
        }
        HandlerId::ThreeKeep => {
            let quot = vm.dpop()?;
            let z = vm.dpeek()?;
            let y = vm.dpeek_nth(1)?;
            let x = vm.dpeek_nth(2)?;
            vm.work_stack.push(WorkItem::RestoreValues {
                values: SmallVec::from_slice(&[x, y, z]),
            });
            vm.work_stack.push(WorkItem::CallCallable(quot));
        }
        HandlerId::Loop => {
            let quot = vm.dpop()?;
            vm.work_stack.push(WorkItem::LoopContinue(quot));
            vm.work_stack.push(WorkItem::CallCallable(quot));
        }
        HandlerId::Curry => return curry(vm),
        HandlerId::Compose => return compose(vm, false),
        HandlerId::Prepose => return compose(vm, true),
        HandlerId::MegaCacheLookup => return dispatch::mega_cache_lookup(vm).map(|_| true),

        // ── Stack shuffling ──────────────────────────────────────────
        HandlerId::Dup => {
            let x = vm.dpeek()?;
            vm.dpush(x)?;
        }
        HandlerId::TwoDup => {
            let y = vm.dpeek()?;
            let x = vm.dpeek_nth(1)?;
            vm.dpush(x)?;
            vm.dpush(y)?;
        }
        HandlerId::ThreeDup => {
            let z = vm.dpeek()?;
            let y = vm.dpeek_nth(1)?;
            let x = vm.dpeek_nth(2)?;
            vm.dpush(x)?;
            vm.dpush(y)?;
            vm.dpush(z)?;
        }
        HandlerId::FourDup => {
            let w = vm.dpeek()?;
            let z = vm.dpeek_nth(1)?;
            let y = vm.dpeek_nth(2)?;
            let x = vm.dpeek_nth(3)?;
            vm.dpush(x)?;
            vm.dpush(y)?;
            vm.dpush(z)?;
            vm.dpush(w)?;
        }
        HandlerId::Dupd => {
            let y = vm.dpop()?;
            let x = vm.dpeek()?;
            vm.dpush(x)?;
            vm.dpush(y)?;
        }
        HandlerId::Drop => {
            vm.dpop()?;
        }
        HandlerId::TwoDrop => {
            vm.dpop()?;
            vm.dpop()?;
        }
        HandlerId::ThreeDrop => {
            vm.dpop()?;
            vm.dpop()?;
            vm.dpop()?;
        }
        HandlerId::FourDrop => {
            vm.dpop()?;
            vm.dpop()?;
            vm.dpop()?;
            vm.dpop()?;
        }
        HandlerId::Nip => {
            let y = vm.dpop()?;
            vm.dpop()?;
            vm.dpush(y)?;
        }
        HandlerId::TwoNip => {
            let z = vm.dpop()?;
            vm.dpop()?;
            vm.dpop()?;
            vm.dpush(z)?;
        }
        HandlerId::Over => {
            let x = vm.dpeek_nth(1)?;
            vm.dpush(x)?;
        }
        HandlerId::TwoOver => {
            let y = vm.dpeek_nth(2)?;
            let x = vm.dpeek_nth(1)?;
            vm.dpush(y)?;
            vm.dpush(x)?;
        }
        HandlerId::Pick => {
            let x = vm.dpeek_nth(2)?;
            vm.dpush(x)?;
        }
        HandlerId::Swap => {
            let y = vm.dpop()?;
            let x = vm.dpop()?;
            vm.dpush(y)?;
            vm.dpush(x)?;
        }
        HandlerId::Swapd => {
            let z = vm.dpop()?;
            let y = vm.dpop()?;
            let x = vm.dpop()?;
            vm.dpush(y)?;
            vm.dpush(x)?;
            vm.dpush(z)?;
        }
        HandlerId::Rot => {
            let z = vm.dpop()?;
            let y = vm.dpop()?;
            let x = vm.dpop()?;
            vm.dpush(y)?;
            vm.dpush(z)?;
            vm.dpush(x)?;
        }
        HandlerId::NegRot => {
            let z = vm.dpop()?;
            let y = vm.dpop()?;
            let x = vm.dpop()?;
            vm.dpush(z)?;
            vm.dpush(x)?;
            vm.dpush(y)?;
        }

        // ── Predicates and equality ──────────────────────────────────
        HandlerId::Eq => {
            let y = vm.dpop()?;
            let x = vm.dpop()?;
            let flag = vm.from_boolean(cells_eq(x, y));
            vm.dpush(flag)?;
        }
        HandlerId::Equal => {
            let y = vm.dpop()?;
            let x = vm.dpop()?;
            // SAFETY: both operands came off the data stack and are
            // live; structural equality does not allocate.
            let flag = vm.from_boolean(unsafe { cells_equal(x, y) });
            vm.dpush(flag)?;
        }
        HandlerId::BothFixnums => {
            let y = vm.dpeek()?;
            let x = vm.dpeek_nth(1)?;
            let flag = vm.from_boolean(x.is_fixnum() && y.is_fixnum());
            vm.dpush(flag)?;
        }
        HandlerId::CallableP => {
            let x = vm.dpop()?;
            let callable = !x.is_immediate()
                && matches!(
                    x.type_code(),
                    TypeCode::Quotation | TypeCode::Word | TypeCode::Tuple | TypeCode::Wrapper
                );
            let flag = vm.from_boolean(callable);
            vm.dpush(flag)?;
        }

        // ── Fixnum arithmetic ────────────────────────────────────────
        HandlerId::FixnumPlus => match pop_fixnum_pair(vm)? {
            Some((x, y)) => push_integer(vm, x as i128 + y as i128)?,
            None => return Ok(false),
        },
        HandlerId::FixnumMinus => match pop_fixnum_pair(vm)? {
            Some((x, y)) => push_integer(vm, x as i128 - y as i128)?,
            None => return Ok(false),
        },
        HandlerId::FixnumTimes => match pop_fixnum_pair(vm)? {
            Some((x, y)) => push_integer(vm, x as i128 * y as i128)?,
            None => return Ok(false),
        },
        HandlerId::FixnumDivi => match pop_fixnum_pair(vm)? {
            Some((x, y)) => {
                let y = nonzero(y)?;
                push_integer(vm, x as i128 / y as i128)?;
            }
            None => return Ok(false),
        },
        HandlerId::FixnumMod => match pop_fixnum_pair(vm)? {
            Some((x, y)) => {
                let y = nonzero(y)?;
                push_integer(vm, x as i128 % y as i128)?;
            }
            None => return Ok(false),
        },
        HandlerId::FixnumDivmod => match pop_fixnum_pair(vm)? {
            Some((x, y)) => {
                let y = nonzero(y)?;
                push_integer(vm, x as i128 / y as i128)?;
                push_integer(vm, x as i128 % y as i128)?;
            }
            None => return Ok(false),
        },
        HandlerId::FixnumShift => {
            let y = vm.dpeek()?;
            let x = vm.dpeek_nth(1)?;
            if !x.is_fixnum() || !y.is_fixnum() {
                return Ok(false);
            }
            let amount = y.to_fixnum();
            let value = x.to_fixnum() as i128;
            if amount >= 0 {
                if amount >= 64 {
                    // Beyond the boxed intermediate; leave it to the
                    // library definition.
                    return Ok(false);
                }
                vm.dpop()?;
                vm.dpop()?;
                push_integer(vm, value << amount)?;
            } else {
                vm.dpop()?;
                vm.dpop()?;
                let amount = (-amount).min(127) as u32;
                push_integer(vm, value >> amount)?;
            }
        }
        HandlerId::FixnumBitand => match pop_fixnum_pair(vm)? {
            Some((x, y)) => vm.dpush(Cell::from_fixnum(x & y))?,
            None => return Ok(false),
        },
        HandlerId::FixnumBitor => match pop_fixnum_pair(vm)? {
            Some((x, y)) => vm.dpush(Cell::from_fixnum(x | y))?,
            None => return Ok(false),
        },
        HandlerId::FixnumBitxor => match pop_fixnum_pair(vm)? {
            Some((x, y)) => vm.dpush(Cell::from_fixnum(x ^ y))?,
            None => return Ok(false),
        },
        HandlerId::FixnumBitnot => {
            let x = vm.dpeek()?;
            if !x.is_fixnum() {
                return Ok(false);
            }
            vm.dpop()?;
            // Complementing never leaves the fixnum range.
            vm.dpush(Cell::from_fixnum(!x.to_fixnum()))?;
        }
        HandlerId::FixnumLt => match pop_fixnum_pair(vm)? {
            Some((x, y)) => {
                let flag = vm.from_boolean(x < y);
                vm.dpush(flag)?;
            }
            None => return Ok(false),
        },
        HandlerId::FixnumLe => match pop_fixnum_pair(vm)? {
            Some((x, y)) => {
                let flag = vm.from_boolean(x <= y);
                vm.dpush(flag)?;
            }
            None => return Ok(false),
        },
        HandlerId::FixnumGt => match pop_fixnum_pair(vm)? {
            Some((x, y)) => {
                let flag = vm.from_boolean(x > y);
                vm.dpush(flag)?;
            }
            None => return Ok(false),
        },
        HandlerId::FixnumGe => match pop_fixnum_pair(vm)? {
            Some((x, y)) => {
                let flag = vm.from_boolean(x >= y);
                vm.dpush(flag)?;
            }
            None => return Ok(false),
        },

        // ── Object access ────────────────────────────────────────────
        HandlerId::Tag => {
            let x = vm.dpop()?;
            vm.dpush(Cell::from_fixnum(x.tag() as isize))?;
        }
        HandlerId::Slot => {
            let n = vm.dpop_fixnum()?;
            let obj = vm.dpop()?;
            if obj.is_immediate() || n < 0 {
                return Err(Trap::with_args(
                    KernelError::TypeCheck,
                    Cell::from_fixnum(TypeCode::Tuple as isize),
                    obj,
                ));
            }
            // SAFETY: slot access is unchecked by contract; the image
            // only emits it behind type declarations.
            let value = unsafe { *(obj.untagged() as *const Cell).add(n as usize) };
            vm.dpush(value)?;
        }
        HandlerId::SetSlot => {
            // ( value obj n -- )
            let n = vm.dpop_fixnum()?;
            let obj = vm.dpop()?;
            let value = vm.dpop()?;
            if obj.is_immediate() || n < 0 {
                return Err(Trap::with_args(
                    KernelError::TypeCheck,
                    Cell::from_fixnum(TypeCode::Tuple as isize),
                    obj,
                ));
            }
            // SAFETY: as `Slot`; the store goes through the write
            // barrier because it may create an old-to-young edge.
            unsafe {
                let slot = (obj.untagged() as *mut Cell).add(n as usize);
                vm.store_slot(slot, value);
            }
        }
        HandlerId::Length => {
            let x = vm.dpeek()?;
            if x.is_immediate() {
                return Ok(false);
            }
            // SAFETY: x is a live heap object off the data stack.
            let length = unsafe {
                match x.type_code() {
                    TypeCode::Array => array_capacity(x.untagged() as *mut Array),
                    TypeCode::ByteArray => {
                        (*(x.untagged() as *mut ByteArray)).length.to_fixnum() as usize
                    }
                    TypeCode::String => {
                        (*(x.untagged() as *mut VmString)).length.to_fixnum() as usize
                    }
                    TypeCode::Quotation => {
                        let array = (*(x.untagged() as *mut Quotation)).array;
                        array_capacity(array.untagged() as *mut Array)
                    }
                    // Slice-like tuples and everything else go through
                    // the library definition.
                    _ => return Ok(false),
                }
            };
            vm.dpop()?;
            vm.dpush(Cell::from_fixnum(length as isize))?;
        }
        HandlerId::SpecialObjectGet => {
            let n = vm.dpop_fixnum()?;
            if n < 0 || n as usize >= SPECIAL_OBJECT_COUNT {
                return Err(Trap::new(KernelError::ArraySize));
            }
            let value = vm.special_objects[n as usize];
            vm.dpush(value)?;
        }
        HandlerId::SpecialObjectSet => {
            // ( value n -- )
            let n = vm.dpop_fixnum()?;
            let value = vm.dpop()?;
            if n < 0 || n as usize >= SPECIAL_OBJECT_COUNT {
                return Err(Trap::new(KernelError::ArraySize));
            }
            vm.special_objects[n as usize] = value;
        }
        HandlerId::ContextObjectGet => {
            let n = vm.dpop_fixnum()?;
            if n < 0 || n as usize >= CONTEXT_OBJECT_COUNT {
                return Err(Trap::new(KernelError::ArraySize));
            }
            let value = vm.context().context_objects[n as usize];
            vm.dpush(value)?;
        }
        HandlerId::ContextObjectSet => {
            // ( value n -- )
            let n = vm.dpop_fixnum()?;
            let value = vm.dpop()?;
            if n < 0 || n as usize >= CONTEXT_OBJECT_COUNT {
                return Err(Trap::new(KernelError::ArraySize));
            }
            vm.context().context_objects[n as usize] = value;
        }
    }
    Ok(true)
}

/// `curry ( obj quot -- curried )` — requires the curried layout from
/// the special-object table; declines to the definition otherwise.
fn curry(vm: &mut Vm) -> TrapResult<bool> {
    let layout = vm.special(SpecialObject::CurriedLayout);
    if layout.is_immediate() || layout.type_code() != TypeCode::TupleLayout {
        return Ok(false);
    }
    let mut quot = vm.dpop()?;
    let mut obj = vm.dpop()?;
    // SAFETY: the operands live on this frame; anchors are popped in
    // reverse order before any fallible call.
    let curried = unsafe {
        vm.data_roots.push(&raw mut obj);
        vm.data_roots.push(&raw mut quot);
        let curried = vm.allot_tuple(layout);
        vm.data_roots.pop(&raw mut quot);
        vm.data_roots.pop(&raw mut obj);
        let data = tuple_data(curried.untagged() as *mut Tuple);
        *data = obj;
        *data.add(1) = quot;
        curried
    };
    vm.dpush(curried)?;
    Ok(true)
}

/// `compose ( quot1 quot2 -- composed )`; `prepose` swaps the call
/// order.
fn compose(vm: &mut Vm, swap: bool) -> TrapResult<bool> {
    let layout = vm.special(SpecialObject::ComposedLayout);
    if layout.is_immediate() || layout.type_code() != TypeCode::TupleLayout {
        return Ok(false);
    }
    let mut second = vm.dpop()?;
    let mut first = vm.dpop()?;
    if swap {
        std::mem::swap(&mut first, &mut second);
    }
    // SAFETY: as in `curry`.
    let composed = unsafe {
        vm.data_roots.push(&raw mut first);
        vm.data_roots.push(&raw mut second);
        let composed = vm.allot_tuple(layout);
        vm.data_roots.pop(&raw mut second);
        vm.data_roots.pop(&raw mut first);
        let data = tuple_data(composed.untagged() as *mut Tuple);
        *data = first;
        *data.add(1) = second;
        composed
    };
    vm.dpush(composed)?;
    Ok(true)
}
