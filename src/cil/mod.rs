//! CIL method body model.
//!
//! This module holds the data the virtualization stages operate on:
//!
//! - [`OpCode`], [`Instruction`], [`Operand`] - macro-expanded CIL instructions
//! - [`MethodBody`] - instruction arena with a separate executable order, locals,
//!   exception handlers and stack metadata
//! - [`stack`] - stack depth analysis used for splitting and max-stack computation
//! - [`BodyBuilder`] - fluent construction with labels
//!
//! Branch operands and handler boundaries refer to instructions through stable
//! [`InstrId`] handles, so stages can insert and reorder freely.

mod body;
mod builder;
mod instruction;
mod opcodes;
pub mod stack;
mod token;

pub use body::{ExceptionHandler, HandlerKind, Local, MethodBody};
pub use builder::BodyBuilder;
pub use instruction::{
    CallTarget, FlowType, InstrId, Instruction, LocalId, MethodRef, Operand, StackBehavior,
    TypeSig,
};
pub use opcodes::OpCode;
pub use token::Token;
