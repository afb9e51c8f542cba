//! Helpers shared by the unit tests.
//!
//! - [`factories`] - sample method bodies with inputs to run them on
//! - [`interpreter`] - a small CIL interpreter for before/after comparison

pub mod interpreter;

use crate::cil::{Instruction, OpCode, Operand};

/// Evaluates a key decode sequence (`ldc.i4`, `xor`, `add`, `mul`, `not`) with
/// `value` already on the stack.
pub fn eval_decode(code: &[Instruction], value: u32) -> u32 {
    let mut stack = vec![value];
    for instr in code {
        match (instr.opcode, &instr.operand) {
            (OpCode::LdcI4, Operand::Int32(v)) => stack.push(*v as u32),
            (OpCode::Not, _) => {
                let a = stack.pop().unwrap();
                stack.push(!a);
            }
            (op @ (OpCode::Xor | OpCode::Add | OpCode::Mul), _) => {
                let b = stack.pop().unwrap();
                let a = stack.pop().unwrap();
                stack.push(match op {
                    OpCode::Xor => a ^ b,
                    OpCode::Add => a.wrapping_add(b),
                    _ => a.wrapping_mul(b),
                });
            }
            other => panic!("unexpected decode instruction {other:?}"),
        }
    }
    stack.pop().unwrap()
}

fn imm32(code: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = code.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Runs a generated x86 decoding stub on `arg`.
///
/// Understands exactly the instruction forms the stub generator emits and
/// returns `None` on anything else.
pub fn run_x86_stub(code: &[u8], arg: u32) -> Option<u32> {
    let mut eax = 0u32;
    let mut ip = 0;
    loop {
        match code.get(ip..)? {
            [0x8B, 0x44, 0x24, 0x04, ..] => {
                eax = arg;
                ip += 4;
            }
            [0x35, ..] => {
                eax ^= imm32(code, ip + 1)?;
                ip += 5;
            }
            [0x05, ..] => {
                eax = eax.wrapping_add(imm32(code, ip + 1)?);
                ip += 5;
            }
            [0x69, 0xC0, ..] => {
                eax = eax.wrapping_mul(imm32(code, ip + 2)?);
                ip += 6;
            }
            [0xC1, 0xC0, r, ..] => {
                eax = eax.rotate_left(u32::from(*r));
                ip += 3;
            }
            [0xF7, 0xD0, ..] => {
                eax = !eax;
                ip += 2;
            }
            [0xC2, 0x04, 0x00, ..] => return Some(eax),
            _ => return None,
        }
    }
}

#[test]
fn test_x86_emulator_rejects_unknown() {
    assert_eq!(run_x86_stub(&[0x90], 1), None);
    assert_eq!(run_x86_stub(&[0x8B, 0x44, 0x24, 0x04, 0xC2, 0x04, 0x00], 7), Some(7));
}
