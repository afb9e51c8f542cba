//! Switch predicates: how the dispatcher turns a pushed value into a case index.
//!
//! The contract between a predicate and the mangler:
//!
//! - [`SwitchPredicate::init`] runs once per method before any scope is flattened
//! - [`SwitchPredicate::get_switch_key`] maps a logical case index to the value a
//!   unit exit pushes; it is a bijection on `u32`
//! - [`SwitchPredicate::emit_switch_load`] appends the instructions that, at
//!   runtime, turn the pushed value on top of the stack back into the case index
//!
//! The two agree because both sides derive from the same [`KeyCipher`].

use rand::Rng;

use crate::{
    cil::{CallTarget, Instruction, MethodRef, OpCode, Operand},
    virtualization::{
        cipher::{CipherOp, KeyCipher, OpSet},
        CfContext, PredicateKind,
    },
};

/// A generated x86 decoding routine.
///
/// The routine is `stdcall` with one 32-bit argument and returns the decoded key
/// in `eax`. The host is expected to place the code in the output image and bind
/// calls to [`CallTarget::NativeStub`] with this id to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeStub {
    /// Identifier used in `call` operands
    pub id: u32,
    /// Machine code
    pub code: Vec<u8>,
    /// Cipher whose decode half the code implements
    pub cipher: KeyCipher,
}

impl NativeStub {
    /// Assembles the decoding routine for `cipher`.
    #[must_use]
    pub fn assemble(id: u32, cipher: KeyCipher) -> Self {
        // mov eax, [esp+4]
        let mut code = vec![0x8B, 0x44, 0x24, 0x04];
        for op in cipher.decode_ops() {
            match op {
                CipherOp::Xor(k) => {
                    code.push(0x35);
                    code.extend_from_slice(&k.to_le_bytes());
                }
                CipherOp::Add(k) => {
                    code.push(0x05);
                    code.extend_from_slice(&k.to_le_bytes());
                }
                CipherOp::Mul(k) => {
                    // imul eax, eax, imm32
                    code.extend_from_slice(&[0x69, 0xC0]);
                    code.extend_from_slice(&k.to_le_bytes());
                }
                CipherOp::RotateLeft(r) => code.extend_from_slice(&[0xC1, 0xC0, r as u8]),
                CipherOp::Not => code.extend_from_slice(&[0xF7, 0xD0]),
            }
        }
        // ret 4
        code.extend_from_slice(&[0xC2, 0x04, 0x00]);

        NativeStub { id, code, cipher }
    }

    /// The call instruction that invokes this stub.
    #[must_use]
    pub fn call_instruction(&self) -> Instruction {
        Instruction::with_operand(
            OpCode::Call,
            Operand::Method(MethodRef {
                target: CallTarget::NativeStub(self.id),
                params: 1,
                has_this: false,
                returns: true,
            }),
        )
    }
}

/// A switch predicate, chosen per method from [`PredicateKind`].
#[derive(Debug, Clone)]
pub enum SwitchPredicate {
    /// Decodes with inline IL arithmetic.
    Normal {
        /// Cipher, set by `init`
        cipher: Option<KeyCipher>,
    },
    /// Decodes through a generated native stub.
    Native {
        /// Stub, set by `init`
        stub: Option<NativeStub>,
    },
}

impl SwitchPredicate {
    /// Creates an uninitialized predicate of the given kind.
    #[must_use]
    pub fn new(kind: PredicateKind) -> Self {
        match kind {
            PredicateKind::Normal => SwitchPredicate::Normal { cipher: None },
            PredicateKind::Native => SwitchPredicate::Native { stub: None },
        }
    }

    /// One-time setup for the method being processed.
    pub fn init(&mut self, ctx: &mut CfContext) {
        match self {
            SwitchPredicate::Normal { cipher } => {
                let generated = ctx.cipher.generate(&mut ctx.rng, OpSet::Il);
                let steps = generated
                    .ops()
                    .iter()
                    .copied()
                    .filter(|op| op.is_il_expressible())
                    .collect();
                *cipher = Some(KeyCipher::new(steps));
            }
            SwitchPredicate::Native { stub } => {
                let generated = ctx.cipher.generate(&mut ctx.rng, OpSet::Native);
                let id = ctx.rng.random();
                *stub = Some(NativeStub::assemble(id, generated));
            }
        }
    }

    /// The cipher in use, once initialized.
    #[must_use]
    pub fn cipher(&self) -> Option<&KeyCipher> {
        match self {
            SwitchPredicate::Normal { cipher } => cipher.as_ref(),
            SwitchPredicate::Native { stub } => stub.as_ref().map(|s| &s.cipher),
        }
    }

    /// The generated native stub, for the platform-specific predicate.
    #[must_use]
    pub fn native_stub(&self) -> Option<&NativeStub> {
        match self {
            SwitchPredicate::Native { stub } => stub.as_ref(),
            SwitchPredicate::Normal { .. } => None,
        }
    }

    /// Value a unit exit pushes to select case `key`.
    ///
    /// An uninitialized predicate is the identity.
    #[must_use]
    pub fn get_switch_key(&self, key: u32) -> u32 {
        self.cipher().map_or(key, |c| c.encode(key))
    }

    /// Appends instructions that replace the pushed value on top of the stack by
    /// its case index.
    pub fn emit_switch_load(&self, out: &mut Vec<Instruction>) {
        match self {
            SwitchPredicate::Normal { cipher: Some(cipher) } => {
                for op in cipher.decode_ops() {
                    match op {
                        CipherOp::Xor(k) => {
                            out.push(Instruction::ldc_i4(k as i32));
                            out.push(Instruction::new(OpCode::Xor));
                        }
                        CipherOp::Add(k) => {
                            out.push(Instruction::ldc_i4(k as i32));
                            out.push(Instruction::new(OpCode::Add));
                        }
                        CipherOp::Mul(k) => {
                            out.push(Instruction::ldc_i4(k as i32));
                            out.push(Instruction::new(OpCode::Mul));
                        }
                        CipherOp::Not => out.push(Instruction::new(OpCode::Not)),
                        // dropped in init
                        CipherOp::RotateLeft(_) => {}
                    }
                }
            }
            SwitchPredicate::Native { stub: Some(stub) } => out.push(stub.call_instruction()),
            _ => {}
        }
    }
}
