//! Instructions, operands and the small type vocabulary the engine needs.
//!
//! Branch operands hold [`InstrId`] handles into the owning [`crate::cil::MethodBody`]
//! arena rather than byte offsets. Inserting or reordering instructions therefore
//! never invalidates a branch; only an explicit retarget changes where it points.

use std::fmt;

use crate::cil::{OpCode, Token};

/// Stable handle of an instruction inside a method body arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrId(usize);

impl InstrId {
    /// Creates a handle from a raw arena index.
    #[must_use]
    pub fn new(index: usize) -> Self {
        InstrId(index)
    }

    /// Returns the arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Index of a local variable declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub u16);

impl LocalId {
    /// Returns the slot index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowType {
    /// Normal execution continues to next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location (unconditional jump)
    UnconditionalBranch,
    /// Call to another method
    Call,
    /// Returns from current method
    Return,
    /// Multi-way branch (switch statement)
    Switch,
    /// Exception throwing
    Throw,
    /// End of finally or fault block
    EndFinally,
    /// End of filter block
    EndFilter,
    /// Leave protected region (try/catch/finally)
    Leave,
}

/// Stack effect of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBehavior {
    /// Number of items popped from stack
    pub pops: u16,
    /// Number of items pushed to stack
    pub pushes: u16,
}

impl StackBehavior {
    /// Net effect on stack depth (pushes - pops)
    #[must_use]
    pub fn net_effect(&self) -> i32 {
        i32::from(self.pushes) - i32::from(self.pops)
    }
}

/// Element and class types referenced by locals, `newarr`, `box` and friends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    /// `bool`
    Boolean,
    /// `int32`
    Int32,
    /// `uint32`
    UInt32,
    /// `int64`
    Int64,
    /// `float32`
    Float32,
    /// `float64`
    Float64,
    /// `string`
    String,
    /// `object`
    Object,
    /// Single-dimensional zero-based array of the element type
    SzArray(Box<TypeSig>),
    /// Any other class or value type, by metadata token
    Class(Token),
}

impl TypeSig {
    /// Shorthand for `SzArray(element)`.
    #[must_use]
    pub fn array_of(element: TypeSig) -> Self {
        TypeSig::SzArray(Box::new(element))
    }

    /// Returns `true` for value types that must be boxed to live in an `object[]`.
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        matches!(
            self,
            TypeSig::Boolean
                | TypeSig::Int32
                | TypeSig::UInt32
                | TypeSig::Int64
                | TypeSig::Float32
                | TypeSig::Float64
        )
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Boolean => f.write_str("bool"),
            TypeSig::Int32 => f.write_str("int32"),
            TypeSig::UInt32 => f.write_str("uint32"),
            TypeSig::Int64 => f.write_str("int64"),
            TypeSig::Float32 => f.write_str("float32"),
            TypeSig::Float64 => f.write_str("float64"),
            TypeSig::String => f.write_str("string"),
            TypeSig::Object => f.write_str("object"),
            TypeSig::SzArray(element) => write!(f, "{element}[]"),
            TypeSig::Class(token) => write!(f, "class {token}"),
        }
    }
}

/// What a call-like instruction invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTarget {
    /// A method defined or referenced in metadata
    Token(Token),
    /// A native decoding stub produced by the platform-specific predicate
    NativeStub(u32),
}

/// Operand of `call`, `callvirt` and `newobj`.
///
/// Carries just enough of the signature to compute the stack effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodRef {
    /// Invoked method
    pub target: CallTarget,
    /// Number of declared parameters (excluding `this`)
    pub params: u16,
    /// Whether the callee takes a `this` argument
    pub has_this: bool,
    /// Whether the callee returns a value
    pub returns: bool,
}

impl MethodRef {
    /// A static method taking `params` arguments.
    #[must_use]
    pub fn static_method(token: Token, params: u16, returns: bool) -> Self {
        MethodRef {
            target: CallTarget::Token(token),
            params,
            has_this: false,
            returns,
        }
    }

    /// An instance method taking `params` arguments besides `this`.
    #[must_use]
    pub fn instance_method(token: Token, params: u16, returns: bool) -> Self {
        MethodRef {
            target: CallTarget::Token(token),
            params,
            has_this: true,
            returns,
        }
    }
}

/// Instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// 32-bit immediate (`ldc.i4`)
    Int32(i32),
    /// 64-bit immediate (`ldc.i8`)
    Int64(i64),
    /// 32-bit float immediate (`ldc.r4`)
    Float32(f32),
    /// 64-bit float immediate (`ldc.r8`)
    Float64(f64),
    /// User string (`ldstr`)
    String(String),
    /// Local variable (`ldloc`, `stloc`)
    Local(LocalId),
    /// Argument index (`ldarg`, `starg`)
    Argument(u16),
    /// Branch target
    Target(InstrId),
    /// Switch jump table
    Switch(Vec<InstrId>),
    /// Called method
    Method(MethodRef),
    /// Type operand (`newarr`, `box`, `castclass`, ...)
    Type(TypeSig),
    /// Field or other metadata token
    Token(Token),
}

impl Operand {
    /// Value equivalence: equal variant and equal payload.
    ///
    /// Floats compare by bit pattern, so `0.0` and `-0.0` are distinct and a NaN
    /// is equivalent to an identical NaN.
    #[must_use]
    pub fn equivalent(&self, other: &Operand) -> bool {
        match (self, other) {
            (Operand::Float32(a), Operand::Float32(b)) => a.to_bits() == b.to_bits(),
            (Operand::Float64(a), Operand::Float64(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

/// A single CIL instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Operation
    pub opcode: OpCode,
    /// Operand, if the opcode takes one
    pub operand: Operand,
}

impl Instruction {
    /// An instruction without operand.
    #[must_use]
    pub fn new(opcode: OpCode) -> Self {
        Instruction {
            opcode,
            operand: Operand::None,
        }
    }

    /// An instruction with the given operand.
    #[must_use]
    pub fn with_operand(opcode: OpCode, operand: Operand) -> Self {
        Instruction { opcode, operand }
    }

    /// `ldc.i4 value`
    #[must_use]
    pub fn ldc_i4(value: i32) -> Self {
        Self::with_operand(OpCode::LdcI4, Operand::Int32(value))
    }

    /// `ldloc local`
    #[must_use]
    pub fn ldloc(local: LocalId) -> Self {
        Self::with_operand(OpCode::Ldloc, Operand::Local(local))
    }

    /// `stloc local`
    #[must_use]
    pub fn stloc(local: LocalId) -> Self {
        Self::with_operand(OpCode::Stloc, Operand::Local(local))
    }

    /// A branch of kind `opcode` to `target`.
    #[must_use]
    pub fn branch(opcode: OpCode, target: InstrId) -> Self {
        Self::with_operand(opcode, Operand::Target(target))
    }

    /// An instruction with a type operand.
    #[must_use]
    pub fn typed(opcode: OpCode, ty: TypeSig) -> Self {
        Self::with_operand(opcode, Operand::Type(ty))
    }

    /// Returns how this instruction affects control flow.
    #[must_use]
    pub fn flow_type(&self) -> FlowType {
        self.opcode.flow_type()
    }

    /// Computes the stack effect, resolving call signatures from the operand.
    ///
    /// `ret` is reported as popping nothing; its pop depends on the enclosing
    /// method and does not matter for flow analysis since nothing follows it.
    #[must_use]
    pub fn stack_behavior(&self) -> StackBehavior {
        if let Some((pops, pushes)) = self.opcode.stack_effect() {
            return StackBehavior {
                pops: u16::from(pops),
                pushes: u16::from(pushes),
            };
        }

        match (&self.opcode, &self.operand) {
            (OpCode::Newobj, Operand::Method(method)) => StackBehavior {
                pops: method.params,
                pushes: 1,
            },
            (OpCode::Call | OpCode::Callvirt, Operand::Method(method)) => StackBehavior {
                pops: method.params + u16::from(method.has_this),
                pushes: u16::from(method.returns),
            },
            _ => StackBehavior { pops: 0, pushes: 0 },
        }
    }

    /// Returns all branch targets referenced by the operand.
    #[must_use]
    pub fn targets(&self) -> Vec<InstrId> {
        match &self.operand {
            Operand::Target(target) => vec![*target],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Replaces every reference to `from` in the operand with `to`.
    ///
    /// Returns the number of replaced references.
    pub fn retarget(&mut self, from: InstrId, to: InstrId) -> usize {
        match &mut self.operand {
            Operand::Target(target) if *target == from => {
                *target = to;
                1
            }
            Operand::Switch(targets) => {
                let mut replaced = 0;
                for target in targets.iter_mut().filter(|t| **t == from) {
                    *target = to;
                    replaced += 1;
                }
                replaced
            }
            _ => 0,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operand {
            Operand::None => write!(f, "{}", self.opcode),
            Operand::Int32(v) => write!(f, "{} {}", self.opcode, v),
            Operand::Int64(v) => write!(f, "{} {}", self.opcode, v),
            Operand::Float32(v) => write!(f, "{} {}", self.opcode, v),
            Operand::Float64(v) => write!(f, "{} {}", self.opcode, v),
            Operand::String(s) => write!(f, "{} {:?}", self.opcode, s),
            Operand::Local(l) => write!(f, "{} V_{}", self.opcode, l.0),
            Operand::Argument(a) => write!(f, "{} A_{}", self.opcode, a),
            Operand::Target(t) => write!(f, "{} {}", self.opcode, t),
            Operand::Switch(targets) => {
                let list: Vec<String> = targets.iter().map(ToString::to_string).collect();
                write!(f, "{} ({})", self.opcode, list.join(", "))
            }
            Operand::Method(m) => match m.target {
                CallTarget::Token(t) => write!(f, "{} {}", self.opcode, t),
                CallTarget::NativeStub(id) => write!(f, "{} native#{}", self.opcode, id),
            },
            Operand::Type(ty) => write!(f, "{} {}", self.opcode, ty),
            Operand::Token(t) => write!(f, "{} {}", self.opcode, t),
        }
    }
}
