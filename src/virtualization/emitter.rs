//! Re-emission: block tree back to a flat body.

use tracing::{debug, warn};

use crate::{
    cil::{stack, HandlerKind, InstrId, MethodBody},
    virtualization::{
        blocks::{BlockNode, BlockTree, ScopeBlock, ScopeKind},
        config::MaxStackPolicy,
    },
    Error, Result,
};

/// What [`emit`] did to the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitReport {
    /// Instructions in the final sequence
    pub instructions: usize,
    /// Exception handlers whose boundaries were recomputed
    pub handlers: usize,
    /// Declared max-stack
    pub max_stack: u16,
    /// Whether max-stack was recomputed exactly
    pub exact_max_stack: bool,
}

struct Span<'a> {
    kind: &'a ScopeKind,
    start: usize,
    end: usize,
}

fn collect<'a>(scope: &'a ScopeBlock, order: &mut Vec<InstrId>, spans: &mut Vec<Span<'a>>) {
    let start = order.len();
    for child in &scope.children {
        match child {
            BlockNode::Instr(block) => order.extend_from_slice(&block.instrs),
            BlockNode::Scope(inner) => collect(inner, order, spans),
        }
    }
    if scope.kind.is_protected() {
        spans.push(Span {
            kind: &scope.kind,
            start,
            end: order.len(),
        });
    }
}

/// Writes the tree's instruction sequence into `body` and repairs its metadata.
///
/// Handler starts are taken from the first instruction of the matching scope.
/// Ends are the instruction that now follows the scope, or `None` when the
/// scope runs to the end of the body. Max-stack is then recomputed or set per
/// `policy`, and the result is validated.
///
/// # Errors
///
/// - [`Error::UnresolvedBoundary`] if a handler scope is missing or empty
/// - [`Error::StackMismatch`] / [`Error::StackUnderflow`] if exact max-stack
///   computation finds the new sequence inconsistent
/// - [`Error::InvalidBranch`] if a branch refers to an instruction that was dropped
pub fn emit(body: &mut MethodBody, tree: &BlockTree, policy: MaxStackPolicy) -> Result<EmitReport> {
    let mut order = Vec::with_capacity(body.len());
    let mut spans = Vec::new();
    collect(&tree.root, &mut order, &mut spans);

    let count = body.exception_handlers.len();
    let mut seen_try = vec![false; count];
    let mut seen_handler = vec![false; count];
    let mut seen_filter = vec![false; count];

    for span in &spans {
        let indices: &[usize] = match span.kind {
            ScopeKind::Try(indices) => indices,
            ScopeKind::Handler(index) | ScopeKind::Filter(index) => std::slice::from_ref(index),
            ScopeKind::Body | ScopeKind::Loop => continue,
        };
        for &index in indices {
            let boundary = match span.kind {
                ScopeKind::Try(_) => "try",
                ScopeKind::Filter(_) => "filter",
                _ => "handler",
            };
            if index >= count || span.start == span.end {
                return Err(Error::UnresolvedBoundary {
                    handler: index,
                    boundary,
                });
            }

            let first = order[span.start];
            let after = order.get(span.end).copied();
            let eh = &mut body.exception_handlers[index];
            match span.kind {
                ScopeKind::Try(_) => {
                    eh.try_start = first;
                    eh.try_end = after;
                    seen_try[index] = true;
                }
                ScopeKind::Filter(_) => {
                    eh.kind = HandlerKind::Filter(first);
                    seen_filter[index] = true;
                }
                _ => {
                    eh.handler_start = first;
                    eh.handler_end = after;
                    seen_handler[index] = true;
                }
            }
        }
    }

    for (index, eh) in body.exception_handlers.iter().enumerate() {
        let missing = if !seen_try[index] {
            Some("try")
        } else if !seen_handler[index] {
            Some("handler")
        } else if eh.filter_start().is_some() && !seen_filter[index] {
            Some("filter")
        } else {
            None
        };
        if let Some(boundary) = missing {
            return Err(Error::UnresolvedBoundary {
                handler: index,
                boundary,
            });
        }
    }

    body.set_order(order);

    let exact = match policy {
        MaxStackPolicy::Exact => {
            body.max_stack = stack::analyze(body)?.max_stack;
            body.keep_old_max_stack = false;
            true
        }
        MaxStackPolicy::Conservative(bound) => {
            warn!(
                "declaring a fixed max-stack of {} instead of recomputing it",
                bound
            );
            body.max_stack = bound;
            body.keep_old_max_stack = true;
            false
        }
    };

    body.validate()?;
    debug!(
        "re-emitted {} instructions, {} handlers, max-stack {}",
        body.len(),
        count,
        body.max_stack
    );

    Ok(EmitReport {
        instructions: body.len(),
        handlers: count,
        max_stack: body.max_stack,
        exact_max_stack: exact,
    })
}
