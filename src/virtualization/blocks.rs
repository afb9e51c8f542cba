//! Block/scope decomposition of a method body.
//!
//! The parser turns the flat instruction sequence into a tree:
//!
//! - leaves ([`InstrBlock`]) are basic blocks, split at branch targets and after
//!   every control transfer, annotated with their entry stack depth
//! - inner nodes ([`ScopeBlock`]) are the method body itself, protected regions,
//!   handler and filter blocks, and natural loops
//!
//! Flattening the tree in pre-order yields exactly the sequence it was built
//! from. Instructions are referenced by [`InstrId`], so later stages can move
//! whole subtrees without touching branch operands.
//!
//! # Rejected shapes
//!
//! Partially overlapping exception regions, branches from outside into the
//! middle of a protected region or into a handler, and regions that control
//! can fall out of are reported as [`Error::Structural`]. The method is then
//! left untransformed.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::{
    cil::{stack, FlowType, InstrId, MethodBody, OpCode},
    Error, Result,
};

/// Kind of a scope node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeKind {
    /// The whole method body (root)
    Body,
    /// A protected region, shared by the listed exception handlers
    Try(Vec<usize>),
    /// The handler block of exception handler `n`
    Handler(usize),
    /// The filter block of exception handler `n`
    Filter(usize),
    /// A natural loop
    Loop,
}

impl ScopeKind {
    /// Returns `true` for blocks entered by the runtime when an exception is dispatched.
    #[must_use]
    pub fn is_handler(&self) -> bool {
        matches!(self, ScopeKind::Handler(_) | ScopeKind::Filter(_))
    }

    /// Returns `true` for scopes that correspond to exception handler boundaries.
    #[must_use]
    pub fn is_protected(&self) -> bool {
        matches!(
            self,
            ScopeKind::Try(_) | ScopeKind::Handler(_) | ScopeKind::Filter(_)
        )
    }
}

/// How control leaves a leaf block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockExit {
    /// Continues with the next block
    FallThrough,
    /// Unconditional branch
    Branch(InstrId),
    /// Conditional branch; falls through otherwise
    Conditional(InstrId),
    /// Multi-way branch; falls through on out-of-range values
    Switch(Vec<InstrId>),
    /// `ret`
    Return,
    /// `throw` / `rethrow`
    Throw,
    /// `leave`
    Leave(InstrId),
    /// `endfinally`
    EndFinally,
    /// `endfilter`
    EndFilter,
}

impl BlockExit {
    /// Returns `true` if control may continue with the next block in sequence.
    #[must_use]
    pub fn falls_through(&self) -> bool {
        matches!(
            self,
            BlockExit::FallThrough | BlockExit::Conditional(_) | BlockExit::Switch(_)
        )
    }
}

/// A basic block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrBlock {
    /// Instructions in sequence order
    pub instrs: Vec<InstrId>,
    /// Stack depth on entry
    pub entry_depth: u16,
    /// Interior indices (into `instrs`) at which the stack is empty
    pub split_points: Vec<usize>,
}

impl InstrBlock {
    /// A block without split points.
    #[must_use]
    pub fn new(instrs: Vec<InstrId>, entry_depth: u16) -> Self {
        InstrBlock {
            instrs,
            entry_depth,
            split_points: Vec::new(),
        }
    }

    /// First instruction.
    #[must_use]
    pub fn first(&self) -> Option<InstrId> {
        self.instrs.first().copied()
    }

    /// Last instruction.
    #[must_use]
    pub fn last(&self) -> Option<InstrId> {
        self.instrs.last().copied()
    }

    /// Classifies the block's last instruction.
    #[must_use]
    pub fn exit(&self, body: &MethodBody) -> BlockExit {
        let Some(last) = self.last() else {
            return BlockExit::FallThrough;
        };
        let instr = body.instr(last);
        let target = instr.targets().first().copied();
        match (instr.flow_type(), target) {
            (FlowType::UnconditionalBranch, Some(t)) => BlockExit::Branch(t),
            (FlowType::ConditionalBranch, Some(t)) => BlockExit::Conditional(t),
            (FlowType::Leave, Some(t)) => BlockExit::Leave(t),
            (FlowType::Switch, _) => BlockExit::Switch(instr.targets()),
            (FlowType::Return, _) => BlockExit::Return,
            (FlowType::Throw, _) => BlockExit::Throw,
            (FlowType::EndFinally, _) => BlockExit::EndFinally,
            (FlowType::EndFilter, _) => BlockExit::EndFilter,
            _ => BlockExit::FallThrough,
        }
    }

    /// Splits the block before index `at`, which must be a split point.
    ///
    /// Returns the second half; `self` keeps the first.
    pub fn split_off(&mut self, at: usize) -> InstrBlock {
        let instrs = self.instrs.split_off(at);
        let split_points = self
            .split_points
            .iter()
            .filter(|p| **p > at)
            .map(|p| p - at)
            .collect();
        self.split_points.retain(|p| *p < at);
        InstrBlock {
            instrs,
            entry_depth: 0,
            split_points,
        }
    }
}

/// A structured region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeBlock {
    /// Region kind
    pub kind: ScopeKind,
    /// Child nodes in sequence order
    pub children: Vec<BlockNode>,
    /// Instruction that originally followed the region, if any
    pub follow: Option<InstrId>,
}

impl ScopeBlock {
    /// Number of leaves in this subtree.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.children
            .iter()
            .map(|c| match c {
                BlockNode::Instr(_) => 1,
                BlockNode::Scope(s) => s.leaf_count(),
            })
            .sum()
    }

    /// Number of scopes in this subtree, including this one.
    #[must_use]
    pub fn scope_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(|c| match c {
                BlockNode::Instr(_) => 0,
                BlockNode::Scope(s) => s.scope_count(),
            })
            .sum::<usize>()
    }

    /// Number of loop scopes in this subtree.
    #[must_use]
    pub fn loop_count(&self) -> usize {
        let own = usize::from(self.kind == ScopeKind::Loop);
        own + self
            .children
            .iter()
            .map(|c| match c {
                BlockNode::Instr(_) => 0,
                BlockNode::Scope(s) => s.loop_count(),
            })
            .sum::<usize>()
    }
}

/// A node of the block tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockNode {
    /// Basic block
    Instr(InstrBlock),
    /// Nested scope
    Scope(ScopeBlock),
}

impl BlockNode {
    /// First instruction of the subtree.
    #[must_use]
    pub fn first_instr(&self) -> Option<InstrId> {
        match self {
            BlockNode::Instr(block) => block.first(),
            BlockNode::Scope(scope) => scope.children.iter().find_map(BlockNode::first_instr),
        }
    }

    /// Stack depth on entry to the subtree.
    #[must_use]
    pub fn entry_depth(&self) -> u16 {
        match self {
            BlockNode::Instr(block) => block.entry_depth,
            BlockNode::Scope(scope) => scope.children.first().map_or(0, BlockNode::entry_depth),
        }
    }

    /// Returns `true` for handler and filter scopes.
    #[must_use]
    pub fn is_handler_scope(&self) -> bool {
        matches!(self, BlockNode::Scope(scope) if scope.kind.is_handler())
    }

    /// Appends the subtree's instructions in pre-order.
    pub fn flatten_into(&self, out: &mut Vec<InstrId>) {
        match self {
            BlockNode::Instr(block) => out.extend_from_slice(&block.instrs),
            BlockNode::Scope(scope) => {
                for child in &scope.children {
                    child.flatten_into(out);
                }
            }
        }
    }
}

/// Block tree of one method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTree {
    /// Root scope, of kind [`ScopeKind::Body`]
    pub root: ScopeBlock,
}

impl BlockTree {
    /// The instruction sequence the tree describes.
    #[must_use]
    pub fn flatten(&self) -> Vec<InstrId> {
        let mut out = Vec::new();
        for child in &self.root.children {
            child.flatten_into(&mut out);
        }
        out
    }
}

#[derive(Debug, Clone)]
struct Region {
    start: usize,
    end: usize,
    kind: ScopeKind,
}

impl Region {
    fn contains(&self, pos: usize) -> bool {
        (self.start..self.end).contains(&pos)
    }
}

struct Parser<'a> {
    body: &'a MethodBody,
    depths: Vec<u16>,
    leaders: HashSet<usize>,
    detect_loops: bool,
}

/// Decomposes `body` into a block tree.
///
/// With `detect_loops`, backward branches to an earlier stack-empty sibling
/// wrap the enclosed siblings into a [`ScopeKind::Loop`] scope, outermost
/// first; inner loops nest recursively.
///
/// # Errors
///
/// - [`Error::InvalidBranch`] if a branch or handler refers outside the body
/// - [`Error::Structural`] for empty bodies, inconsistent stack depths,
///   partially overlapping regions, branches into the middle of a region, and
///   regions that control falls out of
pub fn parse(body: &MethodBody, detect_loops: bool) -> Result<BlockTree> {
    if body.is_empty() {
        return Err(Error::Structural("method body is empty".into()));
    }
    body.validate()?;

    let analysis = stack::analyze(body).map_err(|e| match e {
        Error::InvalidBranch(_) | Error::Structural(_) => e,
        other => Error::Structural(format!("stack analysis failed: {other}")),
    })?;

    let order = body.order();
    let count = order.len();
    let positions = body.positions();
    let position_of = |id: InstrId| positions.get(&id).copied().ok_or(Error::InvalidBranch(id));
    let end_of = |end: Option<InstrId>| match end {
        Some(id) => position_of(id),
        None => Ok(count),
    };

    let mut regions: Vec<Region> = Vec::new();
    for (index, eh) in body.exception_handlers.iter().enumerate() {
        let try_start = position_of(eh.try_start)?;
        let try_end = end_of(eh.try_end)?;
        let handler_start = position_of(eh.handler_start)?;
        let handler_end = end_of(eh.handler_end)?;

        let shared = regions.iter().position(|r| {
            matches!(r.kind, ScopeKind::Try(_)) && r.start == try_start && r.end == try_end
        });
        match shared {
            Some(i) => {
                if let ScopeKind::Try(handlers) = &mut regions[i].kind {
                    handlers.push(index);
                }
            }
            None => regions.push(Region {
                start: try_start,
                end: try_end,
                kind: ScopeKind::Try(vec![index]),
            }),
        }

        let mut bounds = vec![(try_start, try_end), (handler_start, handler_end)];
        if let Some(filter) = eh.filter_start() {
            let filter_start = position_of(filter)?;
            regions.push(Region {
                start: filter_start,
                end: handler_start,
                kind: ScopeKind::Filter(index),
            });
            bounds.push((filter_start, handler_start));
        }
        regions.push(Region {
            start: handler_start,
            end: handler_end,
            kind: ScopeKind::Handler(index),
        });

        for (start, end) in bounds {
            if end <= start {
                return Err(Error::Structural(format!(
                    "exception handler {index} has an empty region"
                )));
            }
            if body.instr(order[end - 1]).opcode.falls_through() {
                return Err(Error::Structural(format!(
                    "control falls out of a region of exception handler {index}"
                )));
            }
        }
    }

    regions.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut open: Vec<usize> = Vec::new();
    for region in &regions {
        while open.last().is_some_and(|end| *end <= region.start) {
            open.pop();
        }
        if let Some(end) = open.last() {
            if region.end > *end {
                return Err(Error::Structural(format!(
                    "exception regions [{}, {}) and one ending at {} partially overlap",
                    region.start, region.end, end
                )));
            }
        }
        open.push(region.end);
    }

    let mut leaders = HashSet::new();
    leaders.insert(0);
    for (pos, id) in order.iter().enumerate() {
        let instr = body.instr(*id);
        for target in instr.targets() {
            let target_pos = position_of(target)?;
            check_region_entry(&regions, pos, target_pos)?;
            leaders.insert(target_pos);
        }
        if instr.opcode.ends_block() && pos + 1 < count {
            leaders.insert(pos + 1);
        }
    }

    let depths = (0..count)
        .map(|pos| analysis.depth_at(pos).unwrap_or(0))
        .collect();
    let parser = Parser {
        body,
        depths,
        leaders,
        detect_loops,
    };
    let root = parser.scope(ScopeKind::Body, 0, count, &regions, None);

    trace!(
        "parsed {} instructions into {} scopes and {} blocks",
        count,
        root.scope_count(),
        root.leaf_count()
    );
    Ok(BlockTree { root })
}

/// Branches may enter a region from outside only at the start of a protected block.
fn check_region_entry(regions: &[Region], from: usize, to: usize) -> Result<()> {
    for region in regions {
        if !region.contains(to) || region.contains(from) {
            continue;
        }
        let at_start = to == region.start;
        if !at_start || region.kind.is_handler() {
            return Err(Error::Structural(format!(
                "branch at {from} enters the region [{}, {}) at {to}",
                region.start, region.end
            )));
        }
    }
    Ok(())
}

impl Parser<'_> {
    fn scope(
        &self,
        kind: ScopeKind,
        start: usize,
        end: usize,
        nested: &[Region],
        follow: Option<InstrId>,
    ) -> ScopeBlock {
        let order = self.body.order();
        let mut children = Vec::new();
        let mut cursor = start;
        let mut i = 0;

        while i < nested.len() {
            let region = &nested[i];
            let mut j = i + 1;
            while j < nested.len() && nested[j].start < region.end {
                j += 1;
            }

            self.leaves(cursor, region.start, &mut children);
            let child = self.scope(
                region.kind.clone(),
                region.start,
                region.end,
                &nested[i + 1..j],
                order.get(region.end).copied(),
            );
            children.push(BlockNode::Scope(child));

            cursor = region.end;
            i = j;
        }
        self.leaves(cursor, end, &mut children);

        if self.detect_loops {
            children = wrap_loops(self.body, children, false, follow);
        }

        ScopeBlock {
            kind,
            children,
            follow,
        }
    }

    fn leaves(&self, start: usize, end: usize, out: &mut Vec<BlockNode>) {
        let order = self.body.order();
        let mut block_start = start;
        for pos in start..end {
            let next = pos + 1;
            if next == end || self.leaders.contains(&next) {
                let split_points = (block_start + 1..next)
                    .filter(|p| self.depths[*p] == 0)
                    .map(|p| p - block_start)
                    .collect();
                out.push(BlockNode::Instr(InstrBlock {
                    instrs: order[block_start..next].to_vec(),
                    entry_depth: self.depths[block_start],
                    split_points,
                }));
                block_start = next;
            }
        }
    }
}

/// Wraps natural loops among `children` into loop scopes.
///
/// A loop is headed by a stack-empty child that a later leaf branches back
/// to. Overlapping candidate ranges are merged, and a trailing handler scope
/// is pulled into the range so a protected region never loses its handlers.
fn wrap_loops(
    body: &MethodBody,
    children: Vec<BlockNode>,
    within_loop: bool,
    parent_follow: Option<InstrId>,
) -> Vec<BlockNode> {
    let len = children.len();
    if len < 2 {
        return children;
    }

    let firsts: Vec<Option<InstrId>> = children.iter().map(BlockNode::first_instr).collect();
    let heads: HashMap<InstrId, usize> = firsts
        .iter()
        .enumerate()
        .filter_map(|(i, first)| first.map(|id| (id, i)))
        .collect();

    let mut reach: Vec<Option<usize>> = vec![None; len];
    for (j, child) in children.iter().enumerate() {
        let BlockNode::Instr(block) = child else {
            continue;
        };
        let Some(last) = block.last() else {
            continue;
        };
        let instr = body.instr(last);
        if instr.opcode == OpCode::Leave {
            continue;
        }
        for target in instr.targets() {
            if let Some(&i) = heads.get(&target) {
                if i < j {
                    reach[i] = Some(reach[i].map_or(j, |r| r.max(j)));
                }
            }
        }
    }

    let mut ranges = Vec::new();
    let mut i = 0;
    while i < len {
        let Some(mut end) = reach[i] else {
            i += 1;
            continue;
        };
        if children[i].entry_depth() != 0 || children[i].is_handler_scope() {
            i += 1;
            continue;
        }

        let mut k = i;
        while k <= end {
            if let Some(r) = reach[k] {
                end = end.max(r);
            }
            k += 1;
        }
        while end + 1 < len && children[end + 1].is_handler_scope() {
            end += 1;
        }

        if within_loop && i == 0 && end == len - 1 {
            i += 1;
            continue;
        }
        ranges.push((i, end));
        i = end + 1;
    }

    if ranges.is_empty() {
        return children;
    }

    let mut out = Vec::with_capacity(len);
    let mut rest = children.into_iter();
    let mut index = 0;
    for (start, end) in ranges {
        while index < start {
            if let Some(child) = rest.next() {
                out.push(child);
            }
            index += 1;
        }
        let inner: Vec<BlockNode> = rest.by_ref().take(end - start + 1).collect();
        index = end + 1;

        let follow = firsts.get(end + 1).copied().flatten().or(parent_follow);
        out.push(BlockNode::Scope(ScopeBlock {
            kind: ScopeKind::Loop,
            children: wrap_loops(body, inner, true, follow),
            follow,
        }));
    }
    out.extend(rest);
    out
}
