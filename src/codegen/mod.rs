//! Code generation backends
//!
//! SPIR-V for OpenCL-style compute devices is the only target.

pub mod spirv;

pub use spirv::{CompiledModule, ModuleAssembler, TargetInfo, assemble_module};
