//! SPIR-V kernel assembler
//!
//! Lowers [`crate::lir`] functions into a SPIR-V 1.2 module for the OpenCL
//! execution environment (`Kernel` capability, `Physical64` addressing).
//!
//! ```text
//! LirModule -> ModuleAssembler -> Emitter (per op) -> Session (ids, types, constants) -> words
//! ```

pub mod assembler;
pub mod builtins;
mod emit;
pub mod literal;
pub mod session;
pub mod symbols;

pub use assembler::{
    AssemblerState, CompiledModule, ModuleAssembler, RESERVED_SLOTS, assemble_module,
    bytes_to_words, disassemble_words, is_reserved_name, words_to_bytes,
};
pub use emit::FunctionSignature;
pub use session::{Session, TargetInfo};
