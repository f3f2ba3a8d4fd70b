//! Kiln: SPIR-V kernel assembler and device execution runtime
//!
//! Kiln takes kernels an upstream scheduler has already lowered to a small SSA
//! IR, assembles them into SPIR-V modules for OpenCL-style devices, and drives
//! those devices: installing modules, moving buffers, launching kernels and
//! timing every operation through a bounded event window.
//!
//! # Architecture
//!
//! ```text
//! LirModule → ModuleAssembler → SPIR-V words → CodeCache → DeviceBackend
//!                                                  ↑
//!                        DeviceContext (plans × devices × threads)
//! ```
//!
//! # Example
//!
//! ```
//! use kiln::config::CodegenConfig;
//! use kiln::codegen::{TargetInfo, assemble_module};
//! use kiln::lir::{FunctionBuilder, LirModule, Terminator};
//!
//! let mut f = FunctionBuilder::kernel("noop");
//! f.terminate(Terminator::Return(None));
//! let mut module = LirModule::new("demo");
//! module.add_function(f.build());
//! let compiled = assemble_module(&module, TargetInfo::default(), &CodegenConfig::default()).unwrap();
//! assert_eq!(compiled.entry_points, vec!["noop".to_string()]);
//! ```

pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod lir;
pub mod runtime;

pub use codegen::{CompiledModule, ModuleAssembler, TargetInfo, assemble_module};
pub use config::Config;
pub use diagnostics::{Bailout, Error, ErrorClass, InternalError, ResourceExhausted, Result};
pub use lir::{FunctionBuilder, Kind, LirFunction, LirModule};
pub use runtime::{DeviceBackend, DeviceContext, KernelArg, LaunchConfig, SimulatedBackend};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
