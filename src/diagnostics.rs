//! Error taxonomy for assembly and device execution
//!
//! Every failure is one of three classes:
//! - [`Bailout`]: recoverable by retrying the kernel on another device or backend
//! - [`InternalError`]: a missing lowering case or a broken invariant, fatal for the unit
//! - [`ResourceExhausted`]: recoverable only by raising a configured capacity

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

use crate::lir::Kind;

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error, wrapping one of the three classes
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Bailout(#[from] Bailout),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Internal(#[from] InternalError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Exhausted(#[from] ResourceExhausted),
}

/// Coarse classification callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Bailout,
    Internal,
    Exhausted,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Bailout(_) => ErrorClass::Bailout,
            Error::Internal(_) => ErrorClass::Internal,
            Error::Exhausted(_) => ErrorClass::Exhausted,
        }
    }

    /// True when the caller should fall back to another device or backend
    pub fn is_bailout(&self) -> bool {
        matches!(self, Error::Bailout(_))
    }
}

impl From<rspirv::dr::Error> for Error {
    fn from(err: rspirv::dr::Error) -> Self {
        Error::Internal(InternalError::Builder(err))
    }
}

/// Recoverable failures: the kernel may still run elsewhere
#[derive(Error, Debug, Diagnostic)]
pub enum Bailout {
    #[error("function name `{name}` collides with a reserved target keyword")]
    #[diagnostic(
        code(bailout::reserved_name),
        help("rename the function; OpenCL C keywords cannot name kernels")
    )]
    ReservedName { name: String },

    #[error("device does not support {kind} precision")]
    #[diagnostic(code(bailout::unsupported_precision))]
    UnsupportedPrecision { kind: Kind },

    #[error("refusing to install empty binary for `{key}`")]
    #[diagnostic(code(bailout::empty_binary))]
    EmptyBinary { key: String },

    #[error("device failed to build `{entry_point}`:\n{log}")]
    #[diagnostic(code(bailout::build_failed))]
    BuildFailed { entry_point: String, log: String },

    #[error("could not stage binary at {}", path.display())]
    #[diagnostic(code(bailout::staging))]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Non-recoverable failures: a lowering case or runtime invariant is missing
#[derive(Error, Debug, Diagnostic)]
pub enum InternalError {
    #[error("unsupported type: {0}")]
    #[diagnostic(code(internal::unsupported_kind))]
    UnsupportedKind(String),

    #[error("address origin not supported: {0}")]
    #[diagnostic(code(internal::address_origin))]
    AddressOrigin(String),

    #[error("unimplemented: {0}")]
    #[diagnostic(code(internal::unimplemented))]
    Unimplemented(String),

    #[error("invalid literal `{value}` for {kind}")]
    #[diagnostic(code(internal::invalid_literal))]
    InvalidLiteral { value: String, kind: Kind },

    #[error("undefined value {0}")]
    #[diagnostic(
        code(internal::undefined_value),
        help("a value was used before any block defined it")
    )]
    UndefinedValue(String),

    #[error("unknown function `{0}`")]
    #[diagnostic(code(internal::unknown_function))]
    UnknownFunction(String),

    #[error("merge for {0} only references itself")]
    #[diagnostic(code(internal::phi_cycle))]
    PhiCycle(String),

    #[error("merge for {merge} is malformed: {reason}")]
    #[diagnostic(code(internal::malformed_merge))]
    MalformedMerge { merge: String, reason: String },

    #[error("assembler cannot {action} in state {state}")]
    #[diagnostic(code(internal::invalid_state))]
    InvalidState { action: &'static str, state: String },

    #[error("SPIR-V builder error: {0}")]
    #[diagnostic(code(internal::builder))]
    Builder(#[source] rspirv::dr::Error),

    #[error("undefined event index {0}")]
    #[diagnostic(code(internal::undefined_event))]
    UndefinedEvent(usize),

    #[error("event window is full (retained={retained}, capacity={capacity})")]
    #[diagnostic(
        code(internal::event_slots_retained),
        help("events must be released before their slots can be reused")
    )]
    EventSlotsRetained { retained: usize, capacity: usize },

    #[error("unknown device index {0}")]
    #[diagnostic(code(internal::unknown_device))]
    UnknownDevice(usize),

    #[error("unknown device buffer at {0:#x}")]
    #[diagnostic(code(internal::unknown_buffer))]
    UnknownBuffer(u64),

    #[error("no installed kernel for `{0}`")]
    #[diagnostic(code(internal::unknown_kernel))]
    UnknownKernel(String),

    #[error("device execution fault: {0}")]
    #[diagnostic(code(internal::execution))]
    Execution(String),
}

/// Capacity limits reached
#[derive(Error, Debug, Diagnostic)]
pub enum ResourceExhausted {
    #[error("event window is full (capacity={capacity})")]
    #[diagnostic(
        code(exhausted::event_window),
        help("raise `runtime.event_window` or enable `runtime.circular_events`")
    )]
    EventWindowFull { capacity: usize },
}
