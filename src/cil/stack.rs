//! Evaluation stack depth analysis.
//!
//! Propagates stack depths along all control-flow edges of a body and reports the
//! maximum depth. Handler blocks are seeded with the depth the runtime establishes
//! on entry (the exception object for catch and filter blocks, nothing for finally
//! and fault). Code that no edge reaches is analysed as entered with an empty
//! stack, which is what the verifier assumes after an unconditional transfer.

use std::collections::HashMap;

use crate::{
    cil::{FlowType, InstrId, MethodBody},
    Error, Result,
};

/// Result of [`analyze`].
#[derive(Debug, Clone)]
pub struct StackAnalysis {
    depths: Vec<u16>,
    by_id: HashMap<InstrId, u16>,
    /// Maximum depth reached anywhere in the body
    pub max_stack: u16,
}

impl StackAnalysis {
    /// Stack depth on entry to the instruction at `position`.
    #[must_use]
    pub fn depth_at(&self, position: usize) -> Option<u16> {
        self.depths.get(position).copied()
    }

    /// Stack depth on entry to instruction `id`.
    #[must_use]
    pub fn depth_of(&self, id: InstrId) -> Option<u16> {
        self.by_id.get(&id).copied()
    }
}

/// Computes entry depths for every instruction and the maximum stack depth.
///
/// # Errors
///
/// - [`Error::StackUnderflow`] if an instruction pops more than is available
/// - [`Error::StackMismatch`] if two paths merge with different depths
/// - [`Error::InvalidBranch`] if a branch or handler refers outside the body
/// - [`Error::Structural`] if control falls through past the last instruction
pub fn analyze(body: &MethodBody) -> Result<StackAnalysis> {
    let order = body.order();
    let count = order.len();
    let positions = body.positions();
    let position_of = |id: InstrId| positions.get(&id).copied().ok_or(Error::InvalidBranch(id));

    let mut depths: Vec<Option<u16>> = vec![None; count];
    let mut work: Vec<(usize, u16)> = Vec::new();
    let mut max_stack = 0u16;

    if count > 0 {
        work.push((0, 0));
    }
    for eh in &body.exception_handlers {
        work.push((position_of(eh.handler_start)?, eh.kind.entry_depth()));
        if let Some(filter) = eh.filter_start() {
            work.push((position_of(filter)?, 1));
        }
    }

    let mut next_unvisited = 0;
    loop {
        while let Some((pos, depth)) = work.pop() {
            match depths[pos] {
                Some(known) if known == depth => continue,
                Some(known) => {
                    return Err(Error::StackMismatch {
                        at: order[pos],
                        expected: known,
                        found: depth,
                    })
                }
                None => depths[pos] = Some(depth),
            }

            let instr = body.instr(order[pos]);
            let behavior = instr.stack_behavior();
            if behavior.pops > depth {
                return Err(Error::StackUnderflow {
                    at: order[pos],
                    needed: behavior.pops,
                    depth,
                });
            }
            let after = depth - behavior.pops + behavior.pushes;
            max_stack = max_stack.max(depth).max(after);

            let (branch_depth, falls_through) = match instr.flow_type() {
                FlowType::Leave => (0, false),
                FlowType::Return | FlowType::Throw | FlowType::EndFinally | FlowType::EndFilter => {
                    (after, false)
                }
                FlowType::UnconditionalBranch => (after, false),
                FlowType::ConditionalBranch
                | FlowType::Switch
                | FlowType::Sequential
                | FlowType::Call => (after, true),
            };

            for target in instr.targets() {
                work.push((position_of(target)?, branch_depth));
            }
            if falls_through {
                if pos + 1 >= count {
                    return Err(Error::Structural(format!(
                        "control falls through past the end of the body at {}",
                        order[pos]
                    )));
                }
                work.push((pos + 1, after));
            }
        }

        while next_unvisited < count && depths[next_unvisited].is_some() {
            next_unvisited += 1;
        }
        if next_unvisited == count {
            break;
        }
        work.push((next_unvisited, 0));
    }

    let depths: Vec<u16> = depths.into_iter().map(|d| d.unwrap_or(0)).collect();
    let by_id = order
        .iter()
        .zip(depths.iter())
        .map(|(id, depth)| (*id, *depth))
        .collect();

    Ok(StackAnalysis {
        depths,
        by_id,
        max_stack,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::{BodyBuilder, OpCode, TypeSig};

    #[test]
    fn test_linear_max_stack() -> Result<()> {
        let body = BodyBuilder::new()
            .ldc_i4(1)
            .ldc_i4(2)
            .ldc_i4(3)
            .op(OpCode::Add)
            .op(OpCode::Add)
            .op(OpCode::Ret)
            .build()?;

        let analysis = analyze(&body)?;
        assert_eq!(analysis.max_stack, 3);
        assert_eq!(analysis.depth_at(3), Some(3));
        assert_eq!(analysis.depth_at(5), Some(1));
        Ok(())
    }

    #[test]
    fn test_branch_merge_with_value() -> Result<()> {
        // arg0 ? 10 : 20
        let body = BodyBuilder::new()
            .ldarg(0)
            .branch(OpCode::Brfalse, "else")
            .ldc_i4(10)
            .branch(OpCode::Br, "join")
            .label("else")
            .ldc_i4(20)
            .label("join")
            .op(OpCode::Ret)
            .build()?;

        let analysis = analyze(&body)?;
        assert_eq!(analysis.depth_at(5), Some(1));
        assert_eq!(analysis.max_stack, 1);
        Ok(())
    }

    #[test]
    fn test_mismatch_detected() -> Result<()> {
        let body = BodyBuilder::new()
            .ldarg(0)
            .branch(OpCode::Brfalse, "join")
            .ldc_i4(1)
            .label("join")
            .op(OpCode::Ret)
            .build()?;

        assert!(matches!(analyze(&body), Err(Error::StackMismatch { .. })));
        Ok(())
    }

    #[test]
    fn test_underflow_detected() -> Result<()> {
        let body = BodyBuilder::new().op(OpCode::Pop).op(OpCode::Ret).build()?;
        assert!(matches!(
            analyze(&body),
            Err(Error::StackUnderflow { needed: 1, depth: 0, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_catch_handler_seeded_with_exception() -> Result<()> {
        let body = BodyBuilder::new()
            .local(TypeSig::Int32)
            .label("try")
            .ldarg(0)
            .stloc(0)
            .leave("end")
            .label("handler")
            .op(OpCode::Pop)
            .leave("end")
            .label("end")
            .ldloc(0)
            .op(OpCode::Ret)
            .catch_handler("try", "handler", "handler", "end", TypeSig::Object)
            .build()?;

        let analysis = analyze(&body)?;
        assert_eq!(analysis.depth_at(3), Some(1));
        assert_eq!(analysis.max_stack, 1);
        Ok(())
    }

    #[test]
    fn test_fall_off_end() -> Result<()> {
        let body = BodyBuilder::new().ldc_i4(1).op(OpCode::Pop).build()?;
        assert!(matches!(analyze(&body), Err(Error::Structural(_))));
        Ok(())
    }
}
