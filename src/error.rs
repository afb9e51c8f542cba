use thiserror::Error;

use crate::cil::{InstrId, Token};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Errors fall into three groups, and the virtualization phase treats each group differently:
///
/// ## Structural errors
/// - [`Error::Structural`] - The method uses control flow the block parser does not accept
/// - [`Error::InvalidBranch`] - A branch or handler refers to an instruction outside the body
///
/// The method is skipped and left untransformed. Processing continues with other methods.
///
/// ## Invariant violations
/// - [`Error::NonBijectiveKey`] - Two dispatch cases received the same encoded key
/// - [`Error::StackMismatch`] - Two paths reach an instruction with different stack depths
/// - [`Error::StackUnderflow`] - An instruction pops more values than are on the stack
/// - [`Error::UnresolvedBoundary`] - An exception handler boundary could not be re-resolved
/// - [`Error::Malformed`] - Internal consistency failure with source location
///
/// The method body is restored from its snapshot and the error is reported.
///
/// ## Control
/// - [`Error::Cancelled`] - Cooperative cancellation was requested
/// - [`Error::LockError`] - A shared lock was poisoned
///
/// # Examples
///
/// ```rust
/// use cilvirt::Error;
///
/// let err = Error::Structural("overlapping exception regions".into());
/// assert!(err.is_structural());
/// assert!(!err.is_invariant_violation());
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// Internal consistency failure.
    ///
    /// Raised when a stage observes state that a previous stage should have made
    /// impossible. Carries the source location where it was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The method body has a shape that cannot be decomposed into blocks and scopes.
    ///
    /// Examples are partially overlapping exception regions or branches into the
    /// middle of a protected region. Methods failing with this error are skipped.
    #[error("Unsupported method structure: {0}")]
    Structural(String),

    /// A branch operand or exception handler boundary refers to an instruction that
    /// is not part of the method body.
    #[error("Instruction {0} is referenced but not present in the body")]
    InvalidBranch(InstrId),

    /// Two dispatch cases map to the same encoded key.
    ///
    /// The switch key function must be a bijection over the dispatched units.
    /// A collision would make one case unreachable.
    #[error("Dispatch key collision: logical key {logical} encodes to {encoded:#x}, already in use")]
    NonBijectiveKey {
        /// Logical (case) index whose key collided
        logical: u32,
        /// Encoded key value that was already taken
        encoded: u32,
    },

    /// Two control-flow paths reach the same instruction with different stack depths.
    #[error("Stack depth mismatch at {at}: {expected} vs {found}")]
    StackMismatch {
        /// Instruction at which the paths merge
        at: InstrId,
        /// Depth recorded first
        expected: u16,
        /// Depth arriving on the other path
        found: u16,
    },

    /// An instruction pops more values than the evaluation stack holds.
    #[error("Stack underflow at {at}: needs {needed}, depth is {depth}")]
    StackUnderflow {
        /// Instruction that underflowed
        at: InstrId,
        /// Values the instruction pops
        needed: u16,
        /// Depth at the instruction
        depth: u16,
    },

    /// An exception handler boundary could not be recomputed after re-emission.
    #[error("Exception handler {handler} has an unresolvable {boundary} boundary")]
    UnresolvedBoundary {
        /// Index into the exception handler table
        handler: usize,
        /// Which boundary failed (`try` / `handler` / `filter`)
        boundary: &'static str,
    },

    /// A method was given to the engine that has no body.
    #[error("Method {0} has no body")]
    NoBody(Token),

    /// Processing was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,
}

impl Error {
    /// Returns `true` if the error means "leave this method untransformed".
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::Structural(_) | Error::InvalidBranch(_) | Error::NoBody(_)
        )
    }

    /// Returns `true` if the error is a correctness violation detected during a
    /// transformation.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::NonBijectiveKey { .. }
                | Error::StackMismatch { .. }
                | Error::StackUnderflow { .. }
                | Error::UnresolvedBoundary { .. }
                | Error::Malformed { .. }
        )
    }
}
