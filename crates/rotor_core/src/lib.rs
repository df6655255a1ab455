//! `rotor_core` — the runtime of the Rotor concatenative language:
//! a generational copying garbage collector and a trampoline bytecode
//! interpreter able to execute the bootstrap image on platforms that
//! forbid native code generation.
//!
//! # Crate layout
//!
//! - [`error`] — host-facing errors and the kernel error protocol.
//! - [`objects`] — tagged cells, object headers, and heap object kinds.
//! - [`gc`] — the three-generation collector: bump and free-list
//!   allocators, card/deck remembered set, slot visitor, and the
//!   collection driver.
//! - [`ctx`] — execution contexts and their stacks.
//! - [`code`] — the code/callback heap (a root source; the interpreter
//!   compiles nothing into it).
//! - [`interp`] — the trampoline interpreter: work items, built-in
//!   handlers, primitives, and generic dispatch.
//! - [`vm`] — the owned [`vm::Vm`] value tying everything together.
//! - [`startup`] — the boot contract and standalone entry point.

/// Code/callback heap and its remembered sets.
pub mod code;
/// Execution contexts: data/retain/call stacks and context objects.
pub mod ctx;
/// Error types and the kernel error protocol.
pub mod error;
/// Garbage collector infrastructure.
pub mod gc;
/// The trampoline interpreter.
pub mod interp;
/// Value representation and heap object model.
pub mod objects;
/// Boot contract, image header, and standalone startup.
pub mod startup;
/// The VM instance.
pub mod vm;
