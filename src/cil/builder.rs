//! Fluent construction of method bodies with symbolic labels.

use std::collections::HashMap;

use crate::{
    cil::{
        stack, ExceptionHandler, HandlerKind, InstrId, Instruction, LocalId, MethodBody,
        MethodRef, OpCode, Operand, Token, TypeSig,
    },
    Error, Result,
};

enum Fixup {
    Target(String),
    Switch(Vec<String>),
}

enum PendingKind {
    Catch(TypeSig),
    Filter(String),
    Finally,
    Fault,
}

struct PendingHandler {
    kind: PendingKind,
    try_start: String,
    try_end: String,
    handler_start: String,
    handler_end: String,
}

/// Builder for method bodies.
///
/// Labels name the position of the next emitted instruction. A label placed after
/// the last instruction denotes "end of body", which is valid as a region end but
/// not as a branch target. Labels are resolved in [`BodyBuilder::build`], so
/// forward references are fine.
///
/// Unless [`BodyBuilder::max_stack`] is given, the declared maximum stack is
/// computed from the finished body.
///
/// # Examples
///
/// ```rust
/// use cilvirt::cil::{BodyBuilder, OpCode, TypeSig};
///
/// // int sum = 0; for (int i = 0; i < arg0; i++) sum += i; return sum;
/// let body = BodyBuilder::new()
///     .local(TypeSig::Int32)
///     .local(TypeSig::Int32)
///     .ldc_i4(0).stloc(0)
///     .ldc_i4(0).stloc(1)
///     .branch(OpCode::Br, "cond")
///     .label("loop")
///     .ldloc(0).ldloc(1).op(OpCode::Add).stloc(0)
///     .ldloc(1).ldc_i4(1).op(OpCode::Add).stloc(1)
///     .label("cond")
///     .ldloc(1).ldarg(0).branch(OpCode::Blt, "loop")
///     .ldloc(0).op(OpCode::Ret)
///     .build()?;
///
/// assert_eq!(body.max_stack, 2);
/// # Ok::<(), cilvirt::Error>(())
/// ```
pub struct BodyBuilder {
    body: MethodBody,
    labels: HashMap<String, usize>,
    fixups: Vec<(InstrId, Fixup)>,
    handlers: Vec<PendingHandler>,
    max_stack: Option<u16>,
    duplicate_label: Option<String>,
    error: Option<Error>,
}

impl Default for BodyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyBuilder {
    /// Create a new body builder.
    #[must_use]
    pub fn new() -> Self {
        let mut body = MethodBody::new();
        body.init_locals = true;
        BodyBuilder {
            body,
            labels: HashMap::new(),
            fixups: Vec::new(),
            handlers: Vec::new(),
            max_stack: None,
            duplicate_label: None,
            error: None,
        }
    }

    /// Declares an unnamed local.
    #[must_use]
    pub fn local(mut self, ty: TypeSig) -> Self {
        if let Err(error) = self.body.add_local(ty, None) {
            self.error.get_or_insert(error);
        }
        self
    }

    /// Declares a named local.
    #[must_use]
    pub fn named_local(mut self, name: &str, ty: TypeSig) -> Self {
        if let Err(error) = self.body.add_local(ty, Some(name)) {
            self.error.get_or_insert(error);
        }
        self
    }

    /// Overrides the declared maximum stack depth.
    #[must_use]
    pub fn max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = Some(max_stack);
        self
    }

    /// Names the position of the next instruction.
    #[must_use]
    pub fn label(mut self, name: &str) -> Self {
        let position = self.body.len();
        if self.labels.insert(name.to_string(), position).is_some() {
            self.duplicate_label = Some(name.to_string());
        }
        self
    }

    /// Appends an arbitrary instruction.
    #[must_use]
    pub fn instr(mut self, instruction: Instruction) -> Self {
        self.body.push(instruction);
        self
    }

    /// Appends an instruction without operand.
    #[must_use]
    pub fn op(self, opcode: OpCode) -> Self {
        self.instr(Instruction::new(opcode))
    }

    /// `ldc.i4`
    #[must_use]
    pub fn ldc_i4(self, value: i32) -> Self {
        self.instr(Instruction::ldc_i4(value))
    }

    /// `ldc.i8`
    #[must_use]
    pub fn ldc_i8(self, value: i64) -> Self {
        self.instr(Instruction::with_operand(OpCode::LdcI8, Operand::Int64(value)))
    }

    /// `ldc.r4`
    #[must_use]
    pub fn ldc_r4(self, value: f32) -> Self {
        self.instr(Instruction::with_operand(OpCode::LdcR4, Operand::Float32(value)))
    }

    /// `ldc.r8`
    #[must_use]
    pub fn ldc_r8(self, value: f64) -> Self {
        self.instr(Instruction::with_operand(OpCode::LdcR8, Operand::Float64(value)))
    }

    /// `ldstr`
    #[must_use]
    pub fn ldstr(self, value: &str) -> Self {
        self.instr(Instruction::with_operand(
            OpCode::Ldstr,
            Operand::String(value.to_string()),
        ))
    }

    /// `ldarg`
    #[must_use]
    pub fn ldarg(self, index: u16) -> Self {
        self.instr(Instruction::with_operand(OpCode::Ldarg, Operand::Argument(index)))
    }

    /// `starg`
    #[must_use]
    pub fn starg(self, index: u16) -> Self {
        self.instr(Instruction::with_operand(OpCode::Starg, Operand::Argument(index)))
    }

    /// `ldloc`
    #[must_use]
    pub fn ldloc(self, index: u16) -> Self {
        self.instr(Instruction::ldloc(LocalId(index)))
    }

    /// `stloc`
    #[must_use]
    pub fn stloc(self, index: u16) -> Self {
        self.instr(Instruction::stloc(LocalId(index)))
    }

    /// `call`
    #[must_use]
    pub fn call(self, method: MethodRef) -> Self {
        self.instr(Instruction::with_operand(OpCode::Call, Operand::Method(method)))
    }

    /// `callvirt`
    #[must_use]
    pub fn callvirt(self, method: MethodRef) -> Self {
        self.instr(Instruction::with_operand(
            OpCode::Callvirt,
            Operand::Method(method),
        ))
    }

    /// `newobj`
    #[must_use]
    pub fn newobj(self, ctor: MethodRef) -> Self {
        self.instr(Instruction::with_operand(OpCode::Newobj, Operand::Method(ctor)))
    }

    /// An instruction with a type operand (`newarr`, `box`, `castclass`, ...).
    #[must_use]
    pub fn typed(self, opcode: OpCode, ty: TypeSig) -> Self {
        self.instr(Instruction::typed(opcode, ty))
    }

    /// A field access (`ldsfld`, `stsfld`, `ldfld`, `stfld`).
    #[must_use]
    pub fn field(self, opcode: OpCode, field: Token) -> Self {
        self.instr(Instruction::with_operand(opcode, Operand::Token(field)))
    }

    /// A branch of kind `opcode` to `label`.
    #[must_use]
    pub fn branch(mut self, opcode: OpCode, label: &str) -> Self {
        let id = self
            .body
            .push(Instruction::with_operand(opcode, Operand::None));
        self.fixups.push((id, Fixup::Target(label.to_string())));
        self
    }

    /// `leave label`
    #[must_use]
    pub fn leave(self, label: &str) -> Self {
        self.branch(OpCode::Leave, label)
    }

    /// `switch (labels...)`
    #[must_use]
    pub fn switch(mut self, labels: &[&str]) -> Self {
        let id = self
            .body
            .push(Instruction::with_operand(OpCode::Switch, Operand::None));
        self.fixups.push((
            id,
            Fixup::Switch(labels.iter().map(|l| (*l).to_string()).collect()),
        ));
        self
    }

    /// `ret`
    #[must_use]
    pub fn ret(self) -> Self {
        self.op(OpCode::Ret)
    }

    /// Adds a typed catch clause. All arguments are label names.
    #[must_use]
    pub fn catch_handler(
        mut self,
        try_start: &str,
        try_end: &str,
        handler_start: &str,
        handler_end: &str,
        catch_type: TypeSig,
    ) -> Self {
        self.handlers.push(PendingHandler {
            kind: PendingKind::Catch(catch_type),
            try_start: try_start.to_string(),
            try_end: try_end.to_string(),
            handler_start: handler_start.to_string(),
            handler_end: handler_end.to_string(),
        });
        self
    }

    /// Adds a filter clause. The filter block runs from `filter_start` up to
    /// `handler_start`.
    #[must_use]
    pub fn filter_handler(
        mut self,
        try_start: &str,
        try_end: &str,
        filter_start: &str,
        handler_start: &str,
        handler_end: &str,
    ) -> Self {
        self.handlers.push(PendingHandler {
            kind: PendingKind::Filter(filter_start.to_string()),
            try_start: try_start.to_string(),
            try_end: try_end.to_string(),
            handler_start: handler_start.to_string(),
            handler_end: handler_end.to_string(),
        });
        self
    }

    /// Adds a finally clause.
    #[must_use]
    pub fn finally_handler(
        mut self,
        try_start: &str,
        try_end: &str,
        handler_start: &str,
        handler_end: &str,
    ) -> Self {
        self.handlers.push(PendingHandler {
            kind: PendingKind::Finally,
            try_start: try_start.to_string(),
            try_end: try_end.to_string(),
            handler_start: handler_start.to_string(),
            handler_end: handler_end.to_string(),
        });
        self
    }

    /// Adds a fault clause.
    #[must_use]
    pub fn fault_handler(
        mut self,
        try_start: &str,
        try_end: &str,
        handler_start: &str,
        handler_end: &str,
    ) -> Self {
        self.handlers.push(PendingHandler {
            kind: PendingKind::Fault,
            try_start: try_start.to_string(),
            try_end: try_end.to_string(),
            handler_start: handler_start.to_string(),
            handler_end: handler_end.to_string(),
        });
        self
    }

    /// Resolves labels and produces the body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] for unknown or duplicate labels and for branch
    /// labels that point past the last instruction.
    pub fn build(mut self) -> Result<MethodBody> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if let Some(name) = self.duplicate_label.take() {
            return Err(malformed_error!("Label '{}' defined twice", name));
        }

        let order = self.body.order().to_vec();
        let labels = self.labels;
        let region = |name: &str| -> Result<Option<InstrId>> {
            let position = labels
                .get(name)
                .ok_or_else(|| malformed_error!("Unknown label '{}'", name))?;
            Ok(order.get(*position).copied())
        };
        let target = |name: &str| -> Result<InstrId> {
            region(name)?.ok_or_else(|| malformed_error!("Label '{}' is past the end", name))
        };

        for (id, fixup) in self.fixups {
            let operand = match fixup {
                Fixup::Target(name) => Operand::Target(target(name.as_str())?),
                Fixup::Switch(names) => Operand::Switch(
                    names
                        .iter()
                        .map(|n| target(n.as_str()))
                        .collect::<Result<Vec<_>>>()?,
                ),
            };
            self.body.instr_mut(id).operand = operand;
        }

        for pending in self.handlers {
            let kind = match pending.kind {
                PendingKind::Catch(ty) => HandlerKind::Catch(ty),
                PendingKind::Filter(name) => HandlerKind::Filter(target(name.as_str())?),
                PendingKind::Finally => HandlerKind::Finally,
                PendingKind::Fault => HandlerKind::Fault,
            };
            self.body.exception_handlers.push(ExceptionHandler {
                kind,
                try_start: target(pending.try_start.as_str())?,
                try_end: region(pending.try_end.as_str())?,
                handler_start: target(pending.handler_start.as_str())?,
                handler_end: region(pending.handler_end.as_str())?,
            });
        }

        self.body.max_stack = match self.max_stack {
            Some(max_stack) => max_stack,
            None => stack::analyze(&self.body).map_or(8, |a| a.max_stack),
        };

        Ok(self.body)
    }
}
