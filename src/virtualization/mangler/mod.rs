//! Control-flow flattening.
//!
//! Every scope of the block tree is flattened on its own, innermost first.
//! Inside one scope the children are grouped into *units*: a unit starts at a
//! stack-empty leaf or at a nested scope, and handler scopes stay with the
//! protected region before them. Units are the only dispatch targets, so the
//! dispatcher is always entered with exactly one value, the encoded key, on
//! the stack.
//!
//! A flattened scope is laid out as
//!
//! ```text
//! entry unit
//! DISPATCH:  <decode key>; stloc vpc; <strategy tail>
//! trampolines (ldc.i4 key; br DISPATCH)
//! remaining units, shuffled
//! ```
//!
//! Unit exits that target another unit of the same scope push that unit's
//! encoded key and jump to the dispatcher. Everything that leaves the scope
//! keeps its direct branch; `ret`, `throw`, `leave` and `endfinally` are never
//! touched.

mod jump;
mod switch;

pub use jump::NestedJumpDispatch;
pub use switch::SwitchDispatch;

use std::collections::{HashMap, HashSet};

use rand::{seq::SliceRandom, Rng};
use tracing::trace;

use crate::{
    cil::{InstrId, Instruction, LocalId, MethodBody, OpCode, Operand},
    virtualization::{
        blocks::{BlockNode, BlockTree, InstrBlock, ScopeBlock, ScopeKind},
        CfContext, DispatchStyle, ScaffoldLocals, SwitchPredicate,
    },
    Error, Result,
};

/// Emits the dispatch tail that jumps to `cases[vpc]`.
///
/// Strategies are stateless. Instructions are allocated in the body's arena and
/// returned in layout order; placing them is up to the caller. Out-of-range
/// keys must end in `ldnull; throw`.
pub trait DispatchStrategy: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Allocates the dispatch tail.
    fn emit(
        &self,
        body: &mut MethodBody,
        vpc: LocalId,
        cases: &[InstrId],
        depth: u32,
    ) -> Vec<InstrId>;
}

/// The strategy implementing `style`.
#[must_use]
pub fn strategy(style: DispatchStyle) -> &'static dyn DispatchStrategy {
    match style {
        DispatchStyle::Switch => &SwitchDispatch,
        DispatchStyle::NestedJump => &NestedJumpDispatch,
    }
}

/// Counters reported by [`Mangler::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MangleStats {
    /// Scopes turned into dispatch loops
    pub scopes_flattened: usize,
    /// Dispatch cases across all flattened scopes
    pub units: usize,
    /// Leaves split at stack-empty points
    pub splits: usize,
    /// Trampolines created for conditional and switch targets
    pub trampolines: usize,
    /// Junk stores and fake jumps planted
    pub junk: usize,
}

/// Flattens the scopes of a block tree.
pub struct Mangler<'a> {
    ctx: &'a mut CfContext,
    predicate: &'a SwitchPredicate,
    locals: ScaffoldLocals,
    opcode_capacity: u32,
    strategy: &'static dyn DispatchStrategy,
    stats: MangleStats,
}

struct Unit {
    nodes: Vec<BlockNode>,
    head: Option<InstrId>,
    key: Option<u32>,
}

impl<'a> Mangler<'a> {
    /// Creates a mangler for one method.
    ///
    /// `predicate` must already be initialized. `opcode_capacity` bounds the
    /// slots used by junk stores.
    pub fn new(
        ctx: &'a mut CfContext,
        predicate: &'a SwitchPredicate,
        locals: ScaffoldLocals,
        opcode_capacity: u32,
    ) -> Self {
        let strategy = strategy(ctx.style);
        Mangler {
            ctx,
            predicate,
            locals,
            opcode_capacity,
            strategy,
            stats: MangleStats::default(),
        }
    }

    /// Flattens every scope of `tree`, allocating new instructions in `body`.
    ///
    /// The body's order is left untouched; the re-emitter derives it from the tree.
    ///
    /// # Errors
    ///
    /// - [`Error::NonBijectiveKey`] if two units of a scope receive the same encoded key
    /// - [`Error::Structural`] if a loop falls through past the end of the body
    pub fn run(mut self, body: &mut MethodBody, tree: &mut BlockTree) -> Result<MangleStats> {
        self.scope(body, &mut tree.root)?;
        Ok(self.stats)
    }

    fn scope(&mut self, body: &mut MethodBody, scope: &mut ScopeBlock) -> Result<()> {
        for child in &mut scope.children {
            if let BlockNode::Scope(inner) = child {
                self.scope(body, inner)?;
            }
        }

        if scope.kind == ScopeKind::Loop {
            self.close_loop_exit(body, scope)?;
        }
        self.split_leaves(scope);

        let mut units = group_units(std::mem::take(&mut scope.children));
        if units.len() < 2 {
            scope.children = units.into_iter().flat_map(|u| u.nodes).collect();
            return Ok(());
        }

        let before = self.stats;
        let cases = self.assign_keys(&mut units)?;
        let heads: HashMap<InstrId, u32> = units
            .iter()
            .filter_map(|u| Some((u.head?, u.key?)))
            .collect();

        let dispatcher = self.dispatcher(body, &cases)?;
        let entry = dispatcher
            .first()
            .copied()
            .ok_or_else(|| malformed_error!("Empty dispatcher"))?;

        let mut trampolines = Trampolines::new(entry);
        let next_keys: Vec<Option<u32>> = (0..units.len())
            .map(|u| units.get(u + 1).and_then(|next| next.key))
            .collect();
        let mut jumps = 0;
        for (unit, next_key) in units.iter_mut().zip(next_keys) {
            let count = unit.nodes.len();
            for (index, node) in unit.nodes.iter_mut().enumerate() {
                if let BlockNode::Instr(leaf) = node {
                    let exit = UnitExit {
                        last_in_unit: index + 1 == count,
                        next_key,
                    };
                    jumps += self.reroute(body, leaf, &heads, &mut trampolines, exit, entry)?;
                }
            }
        }

        // Units linked only by `leave` or by exits out of nested scopes never
        // reach the dispatcher. Such a scope keeps its original layout.
        if jumps == 0 && trampolines.blocks.is_empty() {
            self.stats = before;
            scope.children = units.into_iter().flat_map(|u| u.nodes).collect();
            trace!(
                "{:?} scope has no transfer through a dispatcher, left in place",
                scope.kind
            );
            return Ok(());
        }

        let mut layout = Vec::new();
        let mut rest = units.split_off(1);
        rest.shuffle(&mut self.ctx.rng);

        for unit in units {
            layout.extend(unit.nodes);
        }
        layout.push(BlockNode::Instr(InstrBlock::new(dispatcher, 1)));
        self.stats.trampolines += trampolines.blocks.len();
        layout.extend(trampolines.blocks.into_iter().map(BlockNode::Instr));
        if self.ctx.junk {
            let fake = self.fake_jump(body, entry);
            layout.push(BlockNode::Instr(InstrBlock::new(fake, 0)));
        }
        for unit in rest {
            layout.extend(unit.nodes);
        }
        scope.children = layout;

        self.stats.scopes_flattened += 1;
        self.stats.units += cases.len();
        trace!(
            "flattened {:?} scope into {} cases with {} dispatch",
            scope.kind,
            cases.len(),
            self.strategy.name()
        );
        Ok(())
    }

    /// Makes the fall-out of a loop's last leaf an explicit branch, since the
    /// leaf may not stay last once the loop is flattened.
    fn close_loop_exit(&mut self, body: &mut MethodBody, scope: &mut ScopeBlock) -> Result<()> {
        let Some(BlockNode::Instr(last)) = scope.children.last_mut() else {
            return Ok(());
        };
        if !last.exit(body).falls_through() {
            return Ok(());
        }
        let follow = scope
            .follow
            .ok_or_else(|| Error::Structural("loop falls through past the end of the body".into()))?;
        last.instrs
            .push(body.alloc(Instruction::branch(OpCode::Br, follow)));
        Ok(())
    }

    fn split_leaves(&mut self, scope: &mut ScopeBlock) {
        let intensity = self.ctx.intensity.clamp(0.0, 1.0);
        let mut out = Vec::with_capacity(scope.children.len());

        for child in std::mem::take(&mut scope.children) {
            let BlockNode::Instr(mut leaf) = child else {
                out.push(child);
                continue;
            };
            let cuts: Vec<usize> = leaf
                .split_points
                .clone()
                .into_iter()
                .filter(|_| self.ctx.rng.random_bool(intensity))
                .collect();

            let mut tail = Vec::with_capacity(cuts.len());
            for cut in cuts.into_iter().rev() {
                tail.push(leaf.split_off(cut));
            }
            self.stats.splits += tail.len();

            out.push(BlockNode::Instr(leaf));
            out.extend(tail.into_iter().rev().map(BlockNode::Instr));
        }

        scope.children = out;
    }

    /// Gives every dispatchable unit a logical key from a random permutation and
    /// returns the case table indexed by logical key.
    fn assign_keys(&mut self, units: &mut [Unit]) -> Result<Vec<InstrId>> {
        let dispatchable: Vec<usize> = units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.head.is_some() && entry_depth(&u.nodes) == 0)
            .map(|(i, _)| i)
            .collect();

        let mut logical: Vec<u32> = (0..dispatchable.len() as u32).collect();
        logical.shuffle(&mut self.ctx.rng);

        let mut cases = vec![None; dispatchable.len()];
        let mut seen = HashSet::new();
        for (unit, key) in dispatchable.into_iter().zip(logical) {
            let encoded = self.predicate.get_switch_key(key);
            if !seen.insert(encoded) {
                return Err(Error::NonBijectiveKey {
                    logical: key,
                    encoded,
                });
            }
            units[unit].key = Some(encoded);
            cases[key as usize] = units[unit].head;
        }

        cases
            .into_iter()
            .map(|case| case.ok_or_else(|| malformed_error!("Dispatch case without a unit")))
            .collect()
    }

    fn dispatcher(&mut self, body: &mut MethodBody, cases: &[InstrId]) -> Result<Vec<InstrId>> {
        let mut prologue = Vec::new();
        self.predicate.emit_switch_load(&mut prologue);
        prologue.push(Instruction::stloc(self.locals.vpc));

        if self.ctx.junk && self.opcode_capacity > 0 {
            let slot = self.ctx.rng.random_range(0..self.opcode_capacity);
            let slot = i32::try_from(slot)
                .map_err(|_| malformed_error!("Opcode slot {} exceeds int32", slot))?;
            prologue.extend([
                Instruction::ldloc(self.locals.opcodes),
                Instruction::ldc_i4(slot),
                Instruction::ldc_i4(self.ctx.rng.random()),
                Instruction::new(OpCode::StelemI4),
            ]);
            self.stats.junk += 1;
        }

        let mut ids: Vec<InstrId> = prologue.into_iter().map(|i| body.alloc(i)).collect();
        ids.extend(
            self.strategy
                .emit(body, self.locals.vpc, cases, self.ctx.depth),
        );
        Ok(ids)
    }

    /// An unreachable key push and jump back to the dispatcher.
    fn fake_jump(&mut self, body: &mut MethodBody, dispatcher: InstrId) -> Vec<InstrId> {
        self.stats.junk += 1;
        vec![
            body.alloc(Instruction::ldc_i4(self.ctx.rng.random())),
            body.alloc(Instruction::branch(OpCode::Br, dispatcher)),
        ]
    }

    fn reroute(
        &mut self,
        body: &mut MethodBody,
        leaf: &mut InstrBlock,
        heads: &HashMap<InstrId, u32>,
        trampolines: &mut Trampolines,
        exit: UnitExit,
        dispatcher: InstrId,
    ) -> Result<usize> {
        let Some(last) = leaf.last() else {
            return Ok(0);
        };
        let original = body.instr(last).clone();
        let mut jumps = 0;

        match (&original.opcode, &original.operand) {
            (OpCode::Br, Operand::Target(target)) => {
                if let Some(key) = heads.get(target) {
                    *body.instr_mut(last) = Instruction::ldc_i4(*key as i32);
                    leaf.instrs
                        .push(body.alloc(Instruction::branch(OpCode::Br, dispatcher)));
                    self.maybe_fake_jump(body, leaf, dispatcher);
                    jumps += 1;
                }
            }
            (op, _) if op.is_branch() || *op == OpCode::Switch => {
                if *op != OpCode::Leave {
                    for target in original.targets() {
                        if let Some(key) = heads.get(&target) {
                            let trampoline = trampolines.get(body, target, *key);
                            body.instr_mut(last).retarget(target, trampoline);
                        }
                    }
                }
            }
            _ => {}
        }

        if exit.last_in_unit && original.opcode.falls_through() {
            let key = exit.next_key.ok_or_else(|| {
                malformed_error!("Unit ending at {} falls out of its scope", last)
            })?;
            leaf.instrs.push(body.alloc(Instruction::ldc_i4(key as i32)));
            leaf.instrs
                .push(body.alloc(Instruction::branch(OpCode::Br, dispatcher)));
            self.maybe_fake_jump(body, leaf, dispatcher);
            jumps += 1;
        }

        Ok(jumps)
    }

    fn maybe_fake_jump(&mut self, body: &mut MethodBody, leaf: &mut InstrBlock, dispatcher: InstrId) {
        if self.ctx.junk && self.ctx.rng.random_bool(0.5) {
            let fake = self.fake_jump(body, dispatcher);
            leaf.instrs.extend(fake);
        }
    }
}

/// Where a leaf sits within its unit.
#[derive(Debug, Clone, Copy)]
struct UnitExit {
    last_in_unit: bool,
    /// Encoded key of the unit that follows in the original order
    next_key: Option<u32>,
}

/// Per-scope cache of `ldc.i4 key; br DISPATCH` blocks, one per target.
struct Trampolines {
    dispatcher: InstrId,
    by_target: HashMap<InstrId, InstrId>,
    blocks: Vec<InstrBlock>,
}

impl Trampolines {
    fn new(dispatcher: InstrId) -> Self {
        Trampolines {
            dispatcher,
            by_target: HashMap::new(),
            blocks: Vec::new(),
        }
    }

    fn get(&mut self, body: &mut MethodBody, target: InstrId, key: u32) -> InstrId {
        if let Some(existing) = self.by_target.get(&target) {
            return *existing;
        }
        let push = body.alloc(Instruction::ldc_i4(key as i32));
        let jump = body.alloc(Instruction::branch(OpCode::Br, self.dispatcher));
        self.by_target.insert(target, push);
        self.blocks.push(InstrBlock::new(vec![push, jump], 0));
        push
    }
}

fn entry_depth(nodes: &[BlockNode]) -> u16 {
    nodes.first().map_or(0, BlockNode::entry_depth)
}

/// Groups the children of a scope into dispatch units.
fn group_units(children: Vec<BlockNode>) -> Vec<Unit> {
    let mut units: Vec<Unit> = Vec::new();
    for child in children {
        let starts_unit = match &child {
            BlockNode::Scope(scope) => !scope.kind.is_handler(),
            BlockNode::Instr(leaf) => leaf.entry_depth == 0,
        };
        match units.last_mut() {
            Some(unit) if !starts_unit => unit.nodes.push(child),
            _ => units.push(Unit {
                head: child.first_instr(),
                nodes: vec![child],
                key: None,
            }),
        }
    }
    units
}
