//! CIL opcodes in their canonical long form.
//!
//! The engine works on macro-expanded instructions: a single `ldc.i4` carries any
//! 32-bit immediate, a single `ldloc` addresses any local, and branches are always
//! the long form. Choosing short encodings is left to whoever serializes the body.

use strum::{Display, EnumIter, IntoStaticStr};

use crate::cil::FlowType;

/// A CIL opcode.
///
/// `Display` yields the ECMA-335 mnemonic.
///
/// # Examples
///
/// ```rust
/// use cilvirt::cil::{FlowType, OpCode};
///
/// assert_eq!(OpCode::BgeUn.to_string(), "bge.un");
/// assert_eq!(OpCode::Switch.flow_type(), FlowType::Switch);
/// assert_eq!(OpCode::Add.stack_effect(), Some((2, 1)));
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum OpCode {
    #[strum(serialize = "nop")]
    Nop,
    #[strum(serialize = "ldarg")]
    Ldarg,
    #[strum(serialize = "starg")]
    Starg,
    #[strum(serialize = "ldloc")]
    Ldloc,
    #[strum(serialize = "stloc")]
    Stloc,
    #[strum(serialize = "ldnull")]
    Ldnull,
    #[strum(serialize = "ldc.i4")]
    LdcI4,
    #[strum(serialize = "ldc.i8")]
    LdcI8,
    #[strum(serialize = "ldc.r4")]
    LdcR4,
    #[strum(serialize = "ldc.r8")]
    LdcR8,
    #[strum(serialize = "ldstr")]
    Ldstr,
    #[strum(serialize = "dup")]
    Dup,
    #[strum(serialize = "pop")]
    Pop,

    #[strum(serialize = "call")]
    Call,
    #[strum(serialize = "callvirt")]
    Callvirt,
    #[strum(serialize = "newobj")]
    Newobj,
    #[strum(serialize = "ret")]
    Ret,

    #[strum(serialize = "br")]
    Br,
    #[strum(serialize = "brfalse")]
    Brfalse,
    #[strum(serialize = "brtrue")]
    Brtrue,
    #[strum(serialize = "beq")]
    Beq,
    #[strum(serialize = "bge")]
    Bge,
    #[strum(serialize = "bgt")]
    Bgt,
    #[strum(serialize = "ble")]
    Ble,
    #[strum(serialize = "blt")]
    Blt,
    #[strum(serialize = "bne.un")]
    BneUn,
    #[strum(serialize = "bge.un")]
    BgeUn,
    #[strum(serialize = "bgt.un")]
    BgtUn,
    #[strum(serialize = "ble.un")]
    BleUn,
    #[strum(serialize = "blt.un")]
    BltUn,
    #[strum(serialize = "switch")]
    Switch,

    #[strum(serialize = "add")]
    Add,
    #[strum(serialize = "sub")]
    Sub,
    #[strum(serialize = "mul")]
    Mul,
    #[strum(serialize = "div")]
    Div,
    #[strum(serialize = "div.un")]
    DivUn,
    #[strum(serialize = "rem")]
    Rem,
    #[strum(serialize = "rem.un")]
    RemUn,
    #[strum(serialize = "and")]
    And,
    #[strum(serialize = "or")]
    Or,
    #[strum(serialize = "xor")]
    Xor,
    #[strum(serialize = "shl")]
    Shl,
    #[strum(serialize = "shr")]
    Shr,
    #[strum(serialize = "shr.un")]
    ShrUn,
    #[strum(serialize = "neg")]
    Neg,
    #[strum(serialize = "not")]
    Not,

    #[strum(serialize = "ceq")]
    Ceq,
    #[strum(serialize = "cgt")]
    Cgt,
    #[strum(serialize = "cgt.un")]
    CgtUn,
    #[strum(serialize = "clt")]
    Clt,
    #[strum(serialize = "clt.un")]
    CltUn,

    #[strum(serialize = "conv.i4")]
    ConvI4,
    #[strum(serialize = "conv.u4")]
    ConvU4,
    #[strum(serialize = "conv.i8")]
    ConvI8,
    #[strum(serialize = "conv.r8")]
    ConvR8,

    #[strum(serialize = "newarr")]
    Newarr,
    #[strum(serialize = "ldlen")]
    Ldlen,
    #[strum(serialize = "ldelem.ref")]
    LdelemRef,
    #[strum(serialize = "stelem.ref")]
    StelemRef,
    #[strum(serialize = "ldelem.i4")]
    LdelemI4,
    #[strum(serialize = "ldelem.u4")]
    LdelemU4,
    #[strum(serialize = "stelem.i4")]
    StelemI4,

    #[strum(serialize = "box")]
    Box,
    #[strum(serialize = "unbox.any")]
    UnboxAny,
    #[strum(serialize = "castclass")]
    Castclass,
    #[strum(serialize = "isinst")]
    Isinst,

    #[strum(serialize = "ldfld")]
    Ldfld,
    #[strum(serialize = "stfld")]
    Stfld,
    #[strum(serialize = "ldsfld")]
    Ldsfld,
    #[strum(serialize = "stsfld")]
    Stsfld,

    #[strum(serialize = "throw")]
    Throw,
    #[strum(serialize = "rethrow")]
    Rethrow,
    #[strum(serialize = "leave")]
    Leave,
    #[strum(serialize = "endfinally")]
    Endfinally,
    #[strum(serialize = "endfilter")]
    Endfilter,
}

impl OpCode {
    /// Returns how this opcode affects control flow.
    #[must_use]
    pub fn flow_type(self) -> FlowType {
        match self {
            OpCode::Br => FlowType::UnconditionalBranch,
            OpCode::Brfalse
            | OpCode::Brtrue
            | OpCode::Beq
            | OpCode::Bge
            | OpCode::Bgt
            | OpCode::Ble
            | OpCode::Blt
            | OpCode::BneUn
            | OpCode::BgeUn
            | OpCode::BgtUn
            | OpCode::BleUn
            | OpCode::BltUn => FlowType::ConditionalBranch,
            OpCode::Switch => FlowType::Switch,
            OpCode::Call | OpCode::Callvirt | OpCode::Newobj => FlowType::Call,
            OpCode::Ret => FlowType::Return,
            OpCode::Throw | OpCode::Rethrow => FlowType::Throw,
            OpCode::Leave => FlowType::Leave,
            OpCode::Endfinally => FlowType::EndFinally,
            OpCode::Endfilter => FlowType::EndFilter,
            _ => FlowType::Sequential,
        }
    }

    /// Returns `(pops, pushes)` for opcodes with a fixed stack effect.
    ///
    /// Calls, `newobj` and `ret` depend on their operand or the enclosing method
    /// and return `None`; use [`crate::cil::Instruction::stack_behavior`] for those.
    #[must_use]
    pub fn stack_effect(self) -> Option<(u8, u8)> {
        let effect = match self {
            OpCode::Nop | OpCode::Br | OpCode::Rethrow | OpCode::Leave | OpCode::Endfinally => {
                (0, 0)
            }
            OpCode::Ldarg
            | OpCode::Ldloc
            | OpCode::Ldnull
            | OpCode::LdcI4
            | OpCode::LdcI8
            | OpCode::LdcR4
            | OpCode::LdcR8
            | OpCode::Ldstr
            | OpCode::Ldsfld => (0, 1),
            OpCode::Starg
            | OpCode::Stloc
            | OpCode::Pop
            | OpCode::Brfalse
            | OpCode::Brtrue
            | OpCode::Switch
            | OpCode::Throw
            | OpCode::Endfilter
            | OpCode::Stsfld => (1, 0),
            OpCode::Dup => (1, 2),
            OpCode::Beq
            | OpCode::Bge
            | OpCode::Bgt
            | OpCode::Ble
            | OpCode::Blt
            | OpCode::BneUn
            | OpCode::BgeUn
            | OpCode::BgtUn
            | OpCode::BleUn
            | OpCode::BltUn
            | OpCode::Stfld => (2, 0),
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::DivUn
            | OpCode::Rem
            | OpCode::RemUn
            | OpCode::And
            | OpCode::Or
            | OpCode::Xor
            | OpCode::Shl
            | OpCode::Shr
            | OpCode::ShrUn
            | OpCode::Ceq
            | OpCode::Cgt
            | OpCode::CgtUn
            | OpCode::Clt
            | OpCode::CltUn
            | OpCode::LdelemRef
            | OpCode::LdelemI4
            | OpCode::LdelemU4 => (2, 1),
            OpCode::Neg
            | OpCode::Not
            | OpCode::ConvI4
            | OpCode::ConvU4
            | OpCode::ConvI8
            | OpCode::ConvR8
            | OpCode::Newarr
            | OpCode::Ldlen
            | OpCode::Box
            | OpCode::UnboxAny
            | OpCode::Castclass
            | OpCode::Isinst
            | OpCode::Ldfld => (1, 1),
            OpCode::StelemRef | OpCode::StelemI4 => (3, 0),
            OpCode::Call | OpCode::Callvirt | OpCode::Newobj | OpCode::Ret => return None,
        };
        Some(effect)
    }

    /// Returns `true` if the opcode takes a single branch target operand.
    #[must_use]
    pub fn is_branch(self) -> bool {
        matches!(
            self.flow_type(),
            FlowType::UnconditionalBranch | FlowType::ConditionalBranch | FlowType::Leave
        )
    }

    /// Returns `true` if execution may continue with the next instruction in sequence.
    #[must_use]
    pub fn falls_through(self) -> bool {
        matches!(
            self.flow_type(),
            FlowType::Sequential | FlowType::Call | FlowType::ConditionalBranch | FlowType::Switch
        )
    }

    /// Returns `true` if the opcode ends a basic block.
    #[must_use]
    pub fn ends_block(self) -> bool {
        !matches!(self.flow_type(), FlowType::Sequential | FlowType::Call)
    }

    /// Returns the mnemonic of this opcode.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }
}
