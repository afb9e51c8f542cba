//! Constant extraction.
//!
//! Literal pushes are moved into a per-method `object[]` data table. Every
//! distinct literal value is stored once, at method entry, under a dense key;
//! every original push site then reads its value back through the table:
//!
//! ```text
//! ldstr "a"            =>    ldloc data
//!                            ldc.i4 0
//!                            ldelem.ref
//!                            castclass string
//! ```
//!
//! The site instruction itself becomes the `ldloc`, so branches and handler
//! boundaries that reference it stay valid without retargeting.

use crate::{
    cil::{InstrId, Instruction, LocalId, MethodBody, OpCode, TypeSig},
    virtualization::config::LiteralKinds,
    Error, Result,
};

/// Literal kind of an opcode, if it pushes an inline literal.
fn literal_kind(opcode: OpCode) -> Option<LiteralKinds> {
    match opcode {
        OpCode::Ldstr => Some(LiteralKinds::STRING),
        OpCode::LdcI4 => Some(LiteralKinds::INT32),
        OpCode::LdcI8 => Some(LiteralKinds::INT64),
        OpCode::LdcR4 => Some(LiteralKinds::FLOAT32),
        OpCode::LdcR8 => Some(LiteralKinds::FLOAT64),
        _ => None,
    }
}

/// Value type a numeric literal is boxed as. Strings are references and stay unboxed.
fn boxed_type(opcode: OpCode) -> Option<TypeSig> {
    match opcode {
        OpCode::LdcI4 => Some(TypeSig::Int32),
        OpCode::LdcI8 => Some(TypeSig::Int64),
        OpCode::LdcR4 => Some(TypeSig::Float32),
        OpCode::LdcR8 => Some(TypeSig::Float64),
        _ => None,
    }
}

/// Canonical literals of a method and the sites that push them.
#[derive(Debug, Clone, Default)]
pub struct ConstantTable {
    entries: Vec<Instruction>,
    sites: Vec<(InstrId, u32)>,
}

impl ConstantTable {
    /// Canonical literal instructions, indexed by key.
    #[must_use]
    pub fn entries(&self) -> &[Instruction] {
        &self.entries
    }

    /// Every eligible site in sequence order, with its key.
    #[must_use]
    pub fn sites(&self) -> &[(InstrId, u32)] {
        &self.sites
    }

    /// Number of distinct literals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the method pushes no eligible literal.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key assigned to the literal pushed at `site`.
    #[must_use]
    pub fn key_of(&self, site: InstrId) -> Option<u32> {
        self.sites
            .iter()
            .find(|(id, _)| *id == site)
            .map(|(_, key)| *key)
    }

    /// Canonical literal behind `key`.
    #[must_use]
    pub fn entry(&self, key: u32) -> Option<&Instruction> {
        self.entries.get(key as usize)
    }
}

/// Collects the literal pushes of `body` whose kind is in `kinds`.
///
/// Keys are assigned in first-seen order; a later push with an equivalent
/// opcode and operand reuses the earlier key. Handler regions are scanned like
/// any other code.
#[must_use]
pub fn scan(body: &MethodBody, kinds: LiteralKinds) -> ConstantTable {
    let mut table = ConstantTable::default();

    for (id, instr) in body.iter() {
        let Some(kind) = literal_kind(instr.opcode) else {
            continue;
        };
        if !kinds.contains(kind) {
            continue;
        }

        let existing = table
            .entries
            .iter()
            .position(|e| e.opcode == instr.opcode && e.operand.equivalent(&instr.operand));
        let key = match existing {
            Some(key) => key,
            None => {
                table.entries.push(instr.clone());
                table.entries.len() - 1
            }
        };
        table.sites.push((id, key as u32));
    }

    table
}

/// Instructions that fill the data table with every canonical literal.
///
/// Each entry is `ldloc data; ldc.i4 key; <literal>; [box T]; stelem.ref` and
/// leaves the stack as it found it.
#[must_use]
pub fn population(table: &ConstantTable, data: LocalId) -> Vec<Instruction> {
    let mut out = Vec::with_capacity(table.len() * 5);
    for (key, literal) in table.entries.iter().enumerate() {
        out.push(Instruction::ldloc(data));
        out.push(Instruction::ldc_i4(key as i32));
        out.push(literal.clone());
        if let Some(ty) = boxed_type(literal.opcode) {
            out.push(Instruction::typed(OpCode::Box, ty));
        }
        out.push(Instruction::new(OpCode::StelemRef));
    }
    out
}

/// Rewrites every site of `table` into an indirect load from `data`.
///
/// Returns the number of rewritten sites.
///
/// # Errors
///
/// Returns [`Error::InvalidBranch`] if a site is no longer part of the body, and
/// [`Error::Malformed`] if a site no longer pushes a literal.
pub fn replace(body: &mut MethodBody, table: &ConstantTable, data: LocalId) -> Result<usize> {
    for (site, key) in &table.sites {
        let opcode = body.get(*site).ok_or(Error::InvalidBranch(*site))?.opcode;
        if literal_kind(opcode).is_none() {
            return Err(malformed_error!(
                "Constant site {} holds '{}', not a literal push",
                site,
                opcode
            ));
        }

        *body.instr_mut(*site) = Instruction::ldloc(data);
        let unwrap = match boxed_type(opcode) {
            Some(ty) => Instruction::typed(OpCode::UnboxAny, ty),
            None => Instruction::typed(OpCode::Castclass, TypeSig::String),
        };
        body.insert_after(
            *site,
            vec![
                Instruction::ldc_i4(*key as i32),
                Instruction::new(OpCode::LdelemRef),
                unwrap,
            ],
        )?;
    }

    Ok(table.sites.len())
}
