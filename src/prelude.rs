//! # cilvirt Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the cilvirt library. Import this module to get quick access to everything needed
//! to build method bodies and run the local virtualization over them.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all cilvirt operations
pub use crate::Error;

/// The result type used throughout cilvirt
pub use crate::Result;

// ================================================================================================
// Method Bodies
// ================================================================================================

/// Metadata token identifying methods, types and fields
pub use crate::cil::Token;

/// Instructions and their operands
pub use crate::cil::{CallTarget, InstrId, Instruction, LocalId, MethodRef, OpCode, Operand, TypeSig};

/// Method bodies and exception handlers
pub use crate::cil::{ExceptionHandler, HandlerKind, Local, MethodBody};

/// Fluent body construction with labels
pub use crate::cil::BodyBuilder;

// ================================================================================================
// Protection Surface
// ================================================================================================

/// The protection, its targets and the exclusion service
pub use crate::virtualization::{
    LocalVirtualizationProtection, LocalVirtualizationService, ProtectionParameters,
    ProtectionPreset,
};

/// Phase driver over a module's methods
pub use crate::virtualization::{CancellationToken, MethodDef, PhaseReport, VirtualizationPhase};

/// Per-method pass
pub use crate::virtualization::{LocalVirtualizationPass, MethodOutcome, MethodPass};

// ================================================================================================
// Configuration
// ================================================================================================

/// Per-method parameters and engine-wide configuration
pub use crate::virtualization::{
    DispatchStyle, LiteralKinds, MaxStackPolicy, Parameters, PredicateKind, TableCapacity,
    VirtualizationConfig,
};

/// Module and writer state consulted during configuration
pub use crate::virtualization::{ComImageFlags, ModuleInfo, WriterOptions};

/// Key cipher service
pub use crate::virtualization::{DynCipher, DynCipherService, KeyCipher};

/// Generated native decoding stubs
pub use crate::virtualization::NativeStub;

// ================================================================================================
// Diagnostics
// ================================================================================================

/// Structured event log
pub use crate::events::{DerivedStats, Event, EventKind, EventLog};
