//! Startup glue and the boot contract.
//!
//! The image loader is an external collaborator: it reconstitutes the
//! heap, patches pointers, and installs the canonical singletons and
//! quotations into the special-object table.  The core only checks
//! that the contract was honored, wires up the command line, and runs
//! the startup quotation through the trampoline.

use crate::error::{VmError, VmResult};
use crate::objects::cell::{Cell, TypeCode, CELL_BYTES};
use crate::objects::kinds::{array_data, string_bytes, Array, VmString};
use crate::vm::{SpecialObject, Vm};

/// Magic bytes at the head of a boot image.
pub const IMAGE_MAGIC: u32 = 0x0f0e_0d0c;
/// Image format version this core understands.
pub const IMAGE_VERSION: u32 = 4;

/// The fixed-size header a boot image begins with.  Validated here;
/// consumed by the external loader.
#[derive(Debug, Clone, Copy)]
pub struct ImageHeader {
    pub magic: u32,
    pub version: u32,
    pub data_size: usize,
    pub code_size: usize,
    pub special_object_count: usize,
}

impl ImageHeader {
    /// Check the parts of the header the core depends on.
    pub fn validate(&self) -> VmResult<()> {
        if self.magic != IMAGE_MAGIC {
            return Err(VmError::BadImage("wrong magic"));
        }
        if self.version != IMAGE_VERSION {
            return Err(VmError::BadImage("unsupported image version"));
        }
        if self.special_object_count > crate::vm::SPECIAL_OBJECT_COUNT {
            return Err(VmError::BadImage("special object table too large"));
        }
        Ok(())
    }
}

impl Vm {
    /// Verify that the loader installed everything the core reads.
    pub fn check_boot_contract(&self) -> VmResult<()> {
        let cell_size = self.special(SpecialObject::CellSize);
        if !cell_size.is_fixnum() || cell_size.to_fixnum() != CELL_BYTES as isize {
            return Err(VmError::BootContract("cell-size fixnum"));
        }
        if !self.special(SpecialObject::CanonicalTrue).to_boolean() {
            return Err(VmError::BootContract("canonical t"));
        }
        if !self.special(SpecialObject::PrimitiveWord).to_boolean() {
            return Err(VmError::BootContract("primitive-call sentinel word"));
        }
        if !self.special(SpecialObject::DeclareWord).to_boolean() {
            return Err(VmError::BootContract("declare sentinel word"));
        }
        Ok(())
    }

    /// Standalone entry point: check the boot contract, expose `args`
    /// to the image, run the startup quotation, then evaluate a single
    /// `-e=<expression>` if one was given and an eval callback exists.
    ///
    /// Returns the process exit code (0 on a normal return from
    /// startup; fatal errors abort before returning).
    pub fn start_standalone(&mut self, args: &[String]) -> VmResult<i32> {
        self.check_boot_contract()?;

        // Arguments become an array of aliens over byte-array payloads,
        // stored in the args special object.
        let mut args_array = self.allot_array(args.len(), Cell::FALSE);
        // SAFETY: `args_array` lives on this frame until the pop below
        // and is re-read after each allocation.
        unsafe {
            self.data_roots.push(&raw mut args_array);
            for (i, arg) in args.iter().enumerate() {
                let mut bytes = arg.clone().into_bytes();
                bytes.push(0);
                let payload = self.allot_byte_array_from(&bytes);
                let alien = self.allot_alien(payload, 0);
                let slot = array_data(args_array.untagged() as *mut Array).add(i);
                self.store_slot(slot, alien);
            }
            self.data_roots.pop(&raw mut args_array);
        }
        self.set_special(SpecialObject::Args, args_array);

        let startup = self.special(SpecialObject::StartupQuot);
        if startup.to_boolean() {
            self.call_callable(startup);
        }

        if let Some(expression) = args.iter().find_map(|arg| arg.strip_prefix("-e=")) {
            self.eval_string(expression);
        }
        Ok(0)
    }

    /// Evaluate an expression through the image's eval callback,
    /// returning the result string if the callback produced one.
    ///
    /// The callback is a managed callable taking a string and leaving a
    /// string (or `f`).  Returns `None` when no callback is installed,
    /// when it produced no string, or when the trampoline is already
    /// running: a re-entrant `call_callable` only enqueues work for the
    /// outer loop, so no synchronous result would exist to read back.
    pub fn eval_string(&mut self, expression: &str) -> Option<String> {
        let callback = self.special(SpecialObject::EvalCallback);
        if !callback.to_boolean() {
            return None;
        }
        if self.in_trampoline {
            return None;
        }
        // Save and restore the current-context pointer around the
        // entry, in case the callback's image code switches contexts.
        let saved_ctx = self.ctx;
        let input = self.allot_string_from(expression);
        if self.dpush(input).is_err() {
            self.ctx = saved_ctx;
            return None;
        }
        self.call_callable(callback);
        let result = self.context().pop();
        self.ctx = saved_ctx;

        let result = result?;
        if result.is_immediate() || result.type_code() != TypeCode::String {
            return None;
        }
        // SAFETY: result is a live string.
        let bytes = unsafe { string_bytes(result.untagged() as *mut VmString) };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmConfig;

    #[test]
    fn header_validation_checks_magic_and_version() {
        let good = ImageHeader {
            magic: IMAGE_MAGIC,
            version: IMAGE_VERSION,
            data_size: 0,
            code_size: 0,
            special_object_count: 4,
        };
        assert!(good.validate().is_ok());

        let bad_magic = ImageHeader { magic: 0, ..good };
        assert!(bad_magic.validate().is_err());

        let bad_version = ImageHeader {
            version: IMAGE_VERSION + 1,
            ..good
        };
        assert!(bad_version.validate().is_err());
    }

    #[test]
    fn start_standalone_requires_the_boot_contract() {
        let mut vm = Vm::new(VmConfig::default());
        // A fresh VM has no canonical t or sentinel words installed.
        assert!(vm.start_standalone(&[]).is_err());
    }

    #[test]
    fn eval_without_callback_returns_none() {
        let mut vm = Vm::new(VmConfig::default());
        assert_eq!(vm.eval_string("1 2 +"), None);
    }

    #[test]
    fn eval_mid_trampoline_returns_none() {
        let mut vm = Vm::new(VmConfig::default());
        let elements = vm.allot_array(0, Cell::FALSE);
        let callback = vm.allot_quotation(elements);
        vm.set_special(SpecialObject::EvalCallback, callback);
        // A re-entrant call would only enqueue work; there is no
        // synchronous result to read.
        vm.in_trampoline = true;
        assert_eq!(vm.eval_string("1 2 +"), None);
        assert_eq!(vm.context_ref().datastack_depth(), 0);
    }
}
