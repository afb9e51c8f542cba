// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![warn(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]
#![deny(unsafe_code)]

//! # cilvirt
//!
//! Local virtualization for CIL method bodies. `cilvirt` rewrites a method so
//! that its literal data and its control flow are no longer visible to static
//! inspection, while the method keeps doing exactly what it did before.
//!
//! ## Features
//!
//! - **Constant indirection** - String and numeric literals move into a per-method
//!   `object[]` table and are loaded back through indexed, cast accesses
//! - **Control-flow flattening** - Every scope becomes a set of units reached only
//!   through a dispatcher, either one `switch` or a balanced tree of comparisons
//! - **Obfuscated keys** - Dispatch keys are encoded with a random reversible
//!   cipher and decoded in IL or in a generated x86 stub
//! - **Exception-safe** - Try, catch, filter, finally and fault regions are kept
//!   intact and their boundaries re-resolved after reordering
//! - **Parallel** - Methods are processed independently with `rayon`, each with
//!   its own deterministic random stream
//!
//! ## Quick Start
//!
//! ```rust
//! use cilvirt::prelude::*;
//!
//! let body = BodyBuilder::new()
//!     .ldarg(0)
//!     .branch(OpCode::Brtrue, "yes")
//!     .ldstr("no")
//!     .ret()
//!     .label("yes")
//!     .ldstr("yes")
//!     .ret()
//!     .build()?;
//! let token = Token::new(0x0600_0001);
//! let mut methods = vec![MethodDef::new(token, "Answer", body)];
//!
//! let targets = ProtectionParameters::new();
//! targets.set(token, Parameters::new().with("junk", "true"));
//!
//! let report = LocalVirtualizationProtection::default().phase().run(
//!     &mut methods,
//!     &targets,
//!     &ModuleInfo::default(),
//!     &WriterOptions::default(),
//!     &CancellationToken::new(),
//! );
//! assert!(report.is_complete());
//! # Ok::<(), cilvirt::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`prelude`] - Convenient re-exports of commonly used types
//! - [`cil`] - Method body model, builder and stack analysis
//! - [`virtualization`] - The transformation stages, the per-method pass and the phase driver
//! - [`events`] - Structured record of everything a run did
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Development and Testing
//!
//! Unit tests run every sample body through an IL interpreter before and after
//! transformation and compare return values, thrown exceptions and side effects.
//!
//! ```bash
//! cargo test
//! cargo bench
//! ```
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust
/// use cilvirt::prelude::*;
///
/// let body = BodyBuilder::new().ldc_i4(1).ret().build()?;
/// assert_eq!(body.len(), 2);
/// # Ok::<(), cilvirt::Error>(())
/// ```
pub mod prelude;

/// CIL method bodies.
///
/// Macro-expanded instructions in an arena with a separate execution order,
/// exception handlers addressed by instruction handles, a label-based
/// [`cil::BodyBuilder`] and the stack depth analysis the other stages rely on.
pub mod cil;

/// Structured events recorded while transforming methods.
pub mod events;

/// The local virtualization engine.
///
/// See the module documentation for the stage pipeline and a complete example.
pub mod virtualization;

/// `cilvirt` Result type
///
/// A type alias for `std::result::Result<T, Error>`.
///
/// # Examples
///
/// ```rust
/// use cilvirt::{cil::MethodBody, Result};
///
/// fn validated(body: MethodBody) -> Result<MethodBody> {
///     body.validate()?;
///     Ok(body)
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `cilvirt` Error type
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust
/// use cilvirt::Error;
///
/// let err = Error::Structural("branch into a protected region".into());
/// assert!(err.is_structural());
/// assert_eq!(
///     err.to_string(),
///     "Unsupported method structure: branch into a protected region"
/// );
/// ```
pub use error::Error;
