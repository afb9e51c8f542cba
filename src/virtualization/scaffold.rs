//! Virtualization scaffold: the three synthetic locals and their initializers.

use crate::{
    cil::{Instruction, LocalId, MethodBody, OpCode, TypeSig},
    virtualization::{
        constants::{self, ConstantTable},
        VirtualizationConfig,
    },
    Result,
};

/// Debug name of the virtual program counter local.
pub const VPC_LOCAL: &str = "vpc";
/// Debug name of the opcode table local.
pub const OPCODES_LOCAL: &str = "opcodes";
/// Debug name of the data table local.
pub const DATA_LOCAL: &str = "data";

/// Handles of the scaffold locals of one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaffoldLocals {
    /// Virtual program counter (`uint32`)
    pub vpc: LocalId,
    /// Opcode table (`uint32[]`)
    pub opcodes: LocalId,
    /// Data table (`object[]`)
    pub data: LocalId,
}

impl ScaffoldLocals {
    /// Appends the three scaffold locals to `body`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the locals do not fit the 16-bit
    /// index space.
    pub fn declare(body: &mut MethodBody) -> Result<Self> {
        Ok(ScaffoldLocals {
            vpc: body.add_local(TypeSig::UInt32, Some(VPC_LOCAL))?,
            opcodes: body.add_local(TypeSig::array_of(TypeSig::UInt32), Some(OPCODES_LOCAL))?,
            data: body.add_local(TypeSig::array_of(TypeSig::Object), Some(DATA_LOCAL))?,
        })
    }

    /// Looks the scaffold locals up by name.
    #[must_use]
    pub fn find(body: &MethodBody) -> Option<Self> {
        Some(ScaffoldLocals {
            vpc: body.find_local(VPC_LOCAL)?,
            opcodes: body.find_local(OPCODES_LOCAL)?,
            data: body.find_local(DATA_LOCAL)?,
        })
    }
}

fn capacity(value: u32, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| malformed_error!("{} capacity {} exceeds int32", what, value))
}

/// Inserts the scaffold initializers at the start of `body`.
///
/// The inserted prologue allocates the opcode table, allocates the data table,
/// stores every canonical literal of `table` into it, and finally sets the
/// virtual program counter to `-1` and reads it once:
///
/// ```text
/// ldc.i4 100; newarr uint32; stloc opcodes
/// ldc.i4 200; newarr object; stloc data
/// ldloc data; ldc.i4 0; ldstr "a"; stelem.ref      ; one per literal
/// ldc.i4 -1; stloc vpc; ldloc vpc; pop
/// ```
///
/// Returns the number of inserted instructions.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if a table capacity does not fit `int32`.
pub fn inject(
    body: &mut MethodBody,
    locals: &ScaffoldLocals,
    config: &VirtualizationConfig,
    table: &ConstantTable,
) -> Result<usize> {
    let opcode_slots = capacity(config.opcode_capacity, "Opcode table")?;
    let data_slots = capacity(
        config.data_capacity.resolve(table.len() as u32),
        "Data table",
    )?;

    let mut prologue = vec![
        Instruction::ldc_i4(opcode_slots),
        Instruction::typed(OpCode::Newarr, TypeSig::UInt32),
        Instruction::stloc(locals.opcodes),
        Instruction::ldc_i4(data_slots),
        Instruction::typed(OpCode::Newarr, TypeSig::Object),
        Instruction::stloc(locals.data),
    ];
    prologue.extend(constants::population(table, locals.data));
    prologue.extend([
        Instruction::ldc_i4(-1),
        Instruction::stloc(locals.vpc),
        Instruction::ldloc(locals.vpc),
        Instruction::new(OpCode::Pop),
    ]);

    let count = prologue.len();
    body.insert_at(0, prologue);
    body.init_locals = true;
    Ok(count)
}
