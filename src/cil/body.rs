//! Method bodies: instruction arena, linear order, locals and exception handlers.

use std::collections::{HashMap, HashSet};

use crate::{
    cil::{InstrId, Instruction, LocalId, TypeSig},
    Error, Result,
};

/// A local variable declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Local {
    /// Optional debug name
    pub name: Option<String>,
    /// Declared type
    pub ty: TypeSig,
}

/// Kind of an exception handler clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerKind {
    /// Typed catch clause
    Catch(TypeSig),
    /// Filter clause; the filter block starts at the given instruction and ends
    /// where the handler block begins
    Filter(InstrId),
    /// Finally clause
    Finally,
    /// Fault clause
    Fault,
}

impl HandlerKind {
    /// Stack depth on entry to the handler block.
    #[must_use]
    pub fn entry_depth(&self) -> u16 {
        match self {
            HandlerKind::Catch(_) | HandlerKind::Filter(_) => 1,
            HandlerKind::Finally | HandlerKind::Fault => 0,
        }
    }
}

/// An exception handler clause.
///
/// End references denote the first instruction *after* the region and are `None`
/// when the region runs to the end of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Clause kind
    pub kind: HandlerKind,
    /// First protected instruction
    pub try_start: InstrId,
    /// First instruction after the protected region
    pub try_end: Option<InstrId>,
    /// First handler instruction
    pub handler_start: InstrId,
    /// First instruction after the handler
    pub handler_end: Option<InstrId>,
}

impl ExceptionHandler {
    /// Returns the filter block start for filter clauses.
    #[must_use]
    pub fn filter_start(&self) -> Option<InstrId> {
        match self.kind {
            HandlerKind::Filter(start) => Some(start),
            _ => None,
        }
    }
}

/// A method body.
///
/// Instructions live in an arena and are addressed by [`InstrId`]. The executable
/// sequence is the separate `order` list, so instructions can be inserted, moved
/// or dropped from the sequence while every handle stays valid.
///
/// # Examples
///
/// ```rust
/// use cilvirt::cil::{Instruction, MethodBody, OpCode};
///
/// let mut body = MethodBody::new();
/// let ret = body.push(Instruction::new(OpCode::Ret));
/// body.insert_at(0, vec![Instruction::new(OpCode::Nop)]);
/// assert_eq!(body.position(ret), Some(1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MethodBody {
    arena: Vec<Instruction>,
    order: Vec<InstrId>,
    /// Local variable declarations
    pub locals: Vec<Local>,
    /// Exception handler clauses, innermost first
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Declared maximum evaluation stack depth
    pub max_stack: u16,
    /// Whether a serializer must keep `max_stack` as declared
    pub keep_old_max_stack: bool,
    /// Whether locals are zero-initialized on entry
    pub init_locals: bool,
}

impl MethodBody {
    /// Creates an empty body.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instructions in the executable sequence.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if the body has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Allocates an instruction in the arena without placing it in the sequence.
    pub fn alloc(&mut self, instruction: Instruction) -> InstrId {
        let id = InstrId::new(self.arena.len());
        self.arena.push(instruction);
        id
    }

    /// Allocates an instruction and appends it to the sequence.
    pub fn push(&mut self, instruction: Instruction) -> InstrId {
        let id = self.alloc(instruction);
        self.order.push(id);
        id
    }

    /// Allocates `instructions` and inserts them before position `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index > len`.
    pub fn insert_at(&mut self, index: usize, instructions: Vec<Instruction>) -> Vec<InstrId> {
        let ids: Vec<InstrId> = instructions.into_iter().map(|i| self.alloc(i)).collect();
        self.order.splice(index..index, ids.iter().copied());
        ids
    }

    /// Allocates `instructions` and inserts them right after `anchor`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBranch`] if `anchor` is not in the sequence.
    pub fn insert_after(
        &mut self,
        anchor: InstrId,
        instructions: Vec<Instruction>,
    ) -> Result<Vec<InstrId>> {
        let pos = self.position(anchor).ok_or(Error::InvalidBranch(anchor))?;
        Ok(self.insert_at(pos + 1, instructions))
    }

    /// Returns the instruction behind a handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle was not allocated by this body.
    #[must_use]
    pub fn instr(&self, id: InstrId) -> &Instruction {
        &self.arena[id.index()]
    }

    /// Returns the instruction behind a handle, mutably.
    ///
    /// # Panics
    ///
    /// Panics if the handle was not allocated by this body.
    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instruction {
        &mut self.arena[id.index()]
    }

    /// Returns the instruction behind a handle if it was allocated by this body.
    #[must_use]
    pub fn get(&self, id: InstrId) -> Option<&Instruction> {
        self.arena.get(id.index())
    }

    /// The executable sequence.
    #[must_use]
    pub fn order(&self) -> &[InstrId] {
        &self.order
    }

    /// Replaces the executable sequence.
    pub fn set_order(&mut self, order: Vec<InstrId>) {
        self.order = order;
    }

    /// Iterates the executable sequence.
    pub fn iter(&self) -> impl Iterator<Item = (InstrId, &Instruction)> + '_ {
        self.order.iter().map(move |id| (*id, &self.arena[id.index()]))
    }

    /// Returns the instructions of the sequence, in order, as owned values.
    #[must_use]
    pub fn instructions(&self) -> Vec<Instruction> {
        self.iter().map(|(_, i)| i.clone()).collect()
    }

    /// Position of `id` in the sequence.
    #[must_use]
    pub fn position(&self, id: InstrId) -> Option<usize> {
        self.order.iter().position(|i| *i == id)
    }

    /// Position lookup table for the current sequence.
    #[must_use]
    pub fn positions(&self) -> HashMap<InstrId, usize> {
        self.order
            .iter()
            .enumerate()
            .map(|(pos, id)| (*id, pos))
            .collect()
    }

    /// Declares a new local variable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the body already declares 65536 locals.
    pub fn add_local(&mut self, ty: TypeSig, name: Option<&str>) -> Result<LocalId> {
        let index = u16::try_from(self.locals.len()).map_err(|_| {
            malformed_error!("Local {} exceeds the 16-bit index space", self.locals.len())
        })?;
        self.locals.push(Local {
            name: name.map(str::to_string),
            ty,
        });
        Ok(LocalId(index))
    }

    /// Finds a local by its debug name.
    #[must_use]
    pub fn find_local(&self, name: &str) -> Option<LocalId> {
        self.locals
            .iter()
            .position(|l| l.name.as_deref() == Some(name))
            .and_then(|i| u16::try_from(i).ok())
            .map(LocalId)
    }

    /// Checks that every branch target and handler boundary is part of the
    /// sequence and that each handler region is non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBranch`] for dangling references and
    /// [`Error::Structural`] for inverted or empty regions.
    pub fn validate(&self) -> Result<()> {
        let positions = self.positions();
        if positions.len() != self.order.len() {
            return Err(Error::Structural(
                "instruction appears twice in the sequence".into(),
            ));
        }

        for (_, instr) in self.iter() {
            for target in instr.targets() {
                if !positions.contains_key(&target) {
                    return Err(Error::InvalidBranch(target));
                }
            }
        }

        let resolve = |id: InstrId| positions.get(&id).copied().ok_or(Error::InvalidBranch(id));
        let resolve_end = |end: Option<InstrId>| match end {
            Some(id) => resolve(id),
            None => Ok(self.order.len()),
        };

        for (index, eh) in self.exception_handlers.iter().enumerate() {
            let try_start = resolve(eh.try_start)?;
            let try_end = resolve_end(eh.try_end)?;
            let handler_start = resolve(eh.handler_start)?;
            let handler_end = resolve_end(eh.handler_end)?;
            if try_start >= try_end || handler_start >= handler_end {
                return Err(Error::Structural(format!(
                    "exception handler {index} has an empty or inverted region"
                )));
            }
            if let Some(filter) = eh.filter_start() {
                if resolve(filter)? >= handler_start {
                    return Err(Error::Structural(format!(
                        "filter of exception handler {index} does not precede its handler"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Returns every instruction referenced as a branch target.
    #[must_use]
    pub fn branch_targets(&self) -> HashSet<InstrId> {
        self.iter().flat_map(|(_, i)| i.targets()).collect()
    }
}
