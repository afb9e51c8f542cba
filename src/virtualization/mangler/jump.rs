use crate::{
    cil::{InstrId, Instruction, LocalId, MethodBody, OpCode, Operand},
    virtualization::mangler::DispatchStrategy,
};

/// Ranges narrower than this end in a switch rather than splitting further.
const MIN_SPLIT: usize = 4;

/// A binary tree of unsigned range checks, with narrow switches at the leaves.
///
/// Every level halves the case range with `bge.un`; after `depth` levels, or
/// once a range is too narrow to split, the remaining cases are dispatched by a
/// `switch` over the rebased key:
///
/// ```text
///       ldloc vpc; ldc.i4 mid; bge.un RIGHT
///       ...left half...
/// RIGHT: ldloc vpc; ldc.i4 mid; sub; switch (...); br DEFAULT
/// DEFAULT: ldnull; throw
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct NestedJumpDispatch;

impl DispatchStrategy for NestedJumpDispatch {
    fn name(&self) -> &'static str {
        "nested-jump"
    }

    fn emit(
        &self,
        body: &mut MethodBody,
        vpc: LocalId,
        cases: &[InstrId],
        depth: u32,
    ) -> Vec<InstrId> {
        let default = body.alloc(Instruction::new(OpCode::Ldnull));
        let throw = body.alloc(Instruction::new(OpCode::Throw));

        let mut out = Vec::new();
        let mut tree = RangeTree {
            body,
            vpc,
            cases,
            default,
            out: &mut out,
        };
        tree.range(0, cases.len(), depth);

        out.push(default);
        out.push(throw);
        out
    }
}

struct RangeTree<'a> {
    body: &'a mut MethodBody,
    vpc: LocalId,
    cases: &'a [InstrId],
    default: InstrId,
    out: &'a mut Vec<InstrId>,
}

impl RangeTree<'_> {
    fn push(&mut self, instr: Instruction) -> InstrId {
        let id = self.body.alloc(instr);
        self.out.push(id);
        id
    }

    fn range(&mut self, lo: usize, hi: usize, levels: u32) {
        if levels == 0 || hi - lo < MIN_SPLIT {
            self.push(Instruction::ldloc(self.vpc));
            if lo > 0 {
                self.push(Instruction::ldc_i4(lo as i32));
                self.push(Instruction::new(OpCode::Sub));
            }
            self.push(Instruction::with_operand(
                OpCode::Switch,
                Operand::Switch(self.cases[lo..hi].to_vec()),
            ));
            self.push(Instruction::branch(OpCode::Br, self.default));
            return;
        }

        let mid = lo + (hi - lo) / 2;
        self.push(Instruction::ldloc(self.vpc));
        self.push(Instruction::ldc_i4(mid as i32));
        let check = self.push(Instruction::branch(OpCode::BgeUn, self.default));

        self.range(lo, mid, levels - 1);
        let right = self.out.len();
        self.range(mid, hi, levels - 1);

        let right_head = self.out[right];
        self.body.instr_mut(check).operand = Operand::Target(right_head);
    }
}
