//! Error types for the Rotor runtime.
//!
//! Two error planes coexist:
//!
//! - [`VmError`] — host-facing failures (bad configuration, a boot image
//!   that does not honor the loader contract).  Ordinary Rust errors.
//! - [`KernelError`] — errors raised *inside* the running program
//!   (stack underflow, type checks, division by zero, …).  These are
//!   data: a failing primitive builds a 4-element error array and
//!   transfers control to the image's error-handler quotation.  The ids
//!   are stable because user code pattern-matches on them.

use thiserror::Error;

use crate::objects::cell::Cell;

/// Host-facing errors produced by the Rotor runtime.
#[derive(Debug, Error)]
pub enum VmError {
    /// The boot image (or test fixture) did not install a special object
    /// the core depends on.
    #[error("boot contract violation: {0}")]
    BootContract(&'static str),

    /// The image header failed validation.
    #[error("bad image: {0}")]
    BadImage(&'static str),

    /// A configured size is invalid (zero, unaligned, or too small).
    #[error("bad configuration: {0}")]
    BadConfig(&'static str),
}

/// Convenient `Result` alias for fallible host-facing operations.
pub type VmResult<T> = Result<T, VmError>;

/// Stable kernel error ids expected by user code.
///
/// Numbering matches the historical `vm_error_type` table; slot 2 is
/// reserved (it was unused upstream and the ids after it must not
/// shift).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum KernelError {
    ExpiredAlien = 0,
    Io = 1,
    // 2 reserved
    TypeCheck = 3,
    DivideByZero = 4,
    Signal = 5,
    ArraySize = 6,
    FixnumRange = 7,
    Ffi = 8,
    UndefinedSymbol = 9,
    DatastackUnderflow = 10,
    DatastackOverflow = 11,
    RetainstackUnderflow = 12,
    RetainstackOverflow = 13,
    CallstackUnderflow = 14,
    CallstackOverflow = 15,
    MemoryProtection = 16,
    FpTrap = 17,
    Interrupt = 18,
    CallbackSpaceOverflow = 19,
}

/// First element of every kernel error array, distinguishing VM-raised
/// conditions from user-thrown objects.
pub const KERNEL_ERROR_MARKER: isize = 0;

/// A kernel error signal propagating out of a primitive or handler.
///
/// Carries the id plus the two payload cells that end up in the error
/// array.  Payload cells are always immediates or objects already
/// reachable from the data stack, so a `Trap` in flight never hides a
/// heap reference from the collector.
#[derive(Debug, Clone, Copy)]
pub struct Trap {
    pub kind: KernelError,
    pub arg1: Cell,
    pub arg2: Cell,
}

impl Trap {
    pub fn new(kind: KernelError) -> Self {
        Trap {
            kind,
            arg1: Cell::FALSE,
            arg2: Cell::FALSE,
        }
    }

    pub fn with_args(kind: KernelError, arg1: Cell, arg2: Cell) -> Self {
        Trap { kind, arg1, arg2 }
    }
}

/// `Result` alias for operations that may raise a kernel error.
pub type TrapResult<T> = Result<T, Trap>;
