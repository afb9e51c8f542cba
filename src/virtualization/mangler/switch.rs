use crate::{
    cil::{InstrId, Instruction, LocalId, MethodBody, OpCode, Operand},
    virtualization::mangler::DispatchStrategy,
};

/// One `switch` over every unit of the scope.
///
/// ```text
/// ldloc vpc
/// switch (U0, U1, ..., Un)
/// ldnull
/// throw
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchDispatch;

impl DispatchStrategy for SwitchDispatch {
    fn name(&self) -> &'static str {
        "switch"
    }

    fn emit(
        &self,
        body: &mut MethodBody,
        vpc: LocalId,
        cases: &[InstrId],
        _depth: u32,
    ) -> Vec<InstrId> {
        vec![
            body.alloc(Instruction::ldloc(vpc)),
            body.alloc(Instruction::with_operand(
                OpCode::Switch,
                Operand::Switch(cases.to_vec()),
            )),
            body.alloc(Instruction::new(OpCode::Ldnull)),
            body.alloc(Instruction::new(OpCode::Throw)),
        ]
    }
}
