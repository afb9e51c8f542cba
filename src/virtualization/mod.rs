//! Local virtualization of CIL method bodies.
//!
//! This module hides a method's control flow and literal data from static
//! inspection. Each targeted method goes through the same pipeline:
//!
//! ```text
//! Parameters ──► CfContext ──► constants ──► scaffold ──► blocks ──► mangler ──► emitter
//! ```
//!
//! # Architecture
//!
//! - [`config`] - Per-method [`Parameters`] and engine-wide [`VirtualizationConfig`]
//! - [`context`] - [`CfContext`], the resolved per-method settings
//! - [`constants`] - Literal extraction into the `object[]` data table
//! - [`scaffold`] - Virtualization locals and their initializers
//! - [`blocks`] - Block/scope tree construction
//! - [`mangler`] - Scope flattening with pluggable dispatch strategies
//! - [`predicate`] / [`cipher`] - Obfuscated dispatch keys, in IL or native code
//! - [`emitter`] - Linearization and handler / max-stack repair
//! - [`pass`] / [`phase`] - Per-method pass and the parallel driver over a module
//! - [`protection`] - Identity, targets and the exclusion service
//!
//! # Usage
//!
//! ```rust
//! use cilvirt::prelude::*;
//!
//! let body = BodyBuilder::new()
//!     .ldstr("a")
//!     .ldstr("b")
//!     .op(OpCode::Pop)
//!     .op(OpCode::Pop)
//!     .ret()
//!     .build()?;
//! let token = Token::new(0x0600_0001);
//! let mut methods = vec![MethodDef::new(token, "M", body)];
//!
//! let targets = ProtectionParameters::new();
//! targets.set(token, Parameters::new().with("type", "jump"));
//!
//! let protection = LocalVirtualizationProtection::default();
//! let report = protection.phase().run(
//!     &mut methods,
//!     &targets,
//!     &ModuleInfo::default(),
//!     &WriterOptions::default(),
//!     &CancellationToken::new(),
//! );
//! assert_eq!(report.outcomes[0].constants, 2);
//! # Ok::<(), cilvirt::Error>(())
//! ```

pub mod blocks;
pub mod cipher;
pub mod config;
pub mod constants;
mod context;
pub mod emitter;
pub mod mangler;
mod module;
pub mod pass;
pub mod phase;
pub mod predicate;
pub mod protection;
mod random;
pub mod scaffold;

pub use cipher::{CipherOp, DynCipher, DynCipherService, KeyCipher, OpSet};
pub use config::{
    DispatchStyle, LiteralKinds, MaxStackPolicy, Parameters, PredicateKind, TableCapacity,
    VirtualizationConfig,
};
pub use context::CfContext;
pub use module::{
    AttributeArg, ComImageFlags, DebuggableAttribute, DebuggingModes, ModuleInfo, WriterOptions,
};
pub use pass::{LocalVirtualizationPass, MethodOutcome, MethodPass};
pub use phase::{CancellationToken, MethodDef, PhaseReport, VirtualizationPhase};
pub use predicate::{NativeStub, SwitchPredicate};
pub use protection::{
    LocalVirtualizationProtection, LocalVirtualizationService, ProtectionParameters,
    ProtectionPreset,
};
pub use random::RandomSource;
pub use scaffold::ScaffoldLocals;
