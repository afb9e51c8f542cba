//! The per-method virtualization pass.
//!
//! [`LocalVirtualizationPass`] chains the stages over one method body:
//!
//! 1. **Constants**: literal operands move into the data table
//! 2. **Scaffold**: the `vpc` / `opcodes` / `data` locals and their initializers
//! 3. **Parse**: the body becomes a block/scope tree
//! 4. **Mangle**: every scope with more than one unit is flattened into a dispatch loop
//! 5. **Emit**: the tree is linearized, handlers and max-stack are repaired
//!
//! Cancellation is checked between stages. The body is snapshotted on entry and
//! restored if any stage fails, so a method is either fully transformed or left
//! exactly as it was.

use tracing::{debug, trace};

use crate::{
    cil::{MethodBody, Token},
    events::{EventKind, EventLog},
    virtualization::{
        blocks, constants, emitter,
        mangler::Mangler,
        phase::CancellationToken,
        scaffold::{self, ScaffoldLocals},
        CfContext, NativeStub, SwitchPredicate, VirtualizationConfig,
    },
    Result,
};

/// A transformation applied to one method body at a time.
///
/// Passes must be thread-safe (Send + Sync); the phase driver runs them on many
/// methods in parallel, each with its own [`CfContext`].
pub trait MethodPass: Send + Sync {
    /// Unique name for logging and debugging.
    fn name(&self) -> &'static str;

    /// Get a description of what this pass does.
    fn description(&self) -> &'static str {
        "No description available"
    }

    /// Run the pass on a single method body.
    ///
    /// Events describing the transformation reach `events` only if it succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the method could not be transformed. The body must be
    /// left unchanged in that case.
    fn run_on_method(
        &self,
        body: &mut MethodBody,
        ctx: CfContext,
        events: &EventLog,
        cancel: &CancellationToken,
    ) -> Result<MethodOutcome>;
}

/// Summary of a successfully transformed method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodOutcome {
    /// The method
    pub method: Token,
    /// Distinct literals moved into the data table
    pub constants: usize,
    /// Literal occurrences rewritten to table loads
    pub sites: usize,
    /// Instructions added at the method entry
    pub scaffold_len: usize,
    /// Scopes turned into dispatch loops
    pub scopes: usize,
    /// Units placed behind dispatchers
    pub units: usize,
    /// Native stub the host has to materialize, if the x86 predicate was chosen
    pub native_stub: Option<NativeStub>,
    /// Final declared max-stack
    pub max_stack: u16,
}

/// Local virtualization of a single method body.
#[derive(Debug, Clone, Default)]
pub struct LocalVirtualizationPass {
    config: VirtualizationConfig,
}

impl LocalVirtualizationPass {
    /// Creates the pass with the given engine configuration.
    #[must_use]
    pub fn new(config: VirtualizationConfig) -> Self {
        LocalVirtualizationPass { config }
    }

    /// The engine configuration in use.
    #[must_use]
    pub fn config(&self) -> &VirtualizationConfig {
        &self.config
    }

    fn transform(
        &self,
        body: &mut MethodBody,
        ctx: &mut CfContext,
        events: &EventLog,
        cancel: &CancellationToken,
    ) -> Result<MethodOutcome> {
        let method = ctx.method;
        cancel.check()?;

        let table = constants::scan(body, self.config.literal_kinds);
        let positions = body.positions();
        let locals = ScaffoldLocals::declare(body)?;
        let sites = constants::replace(body, &table, locals.data)?;
        for (key, entry) in table.entries().iter().enumerate() {
            events
                .record(EventKind::ConstantExtracted)
                .method(method)
                .message(format!("{entry} -> key {key}"))
                .stage("constants");
        }
        for (site, key) in table.sites() {
            let position = positions
                .get(site)
                .copied()
                .ok_or(crate::Error::InvalidBranch(*site))?;
            events
                .record(EventKind::ConstantReplaced)
                .at(method, position)
                .message(format!("site loads key {key} from the data table"))
                .stage("constants");
        }

        let scaffold_len = scaffold::inject(body, &locals, &self.config, &table)?;
        events
            .record(EventKind::ScaffoldInjected)
            .method(method)
            .message(format!("{scaffold_len} instructions"))
            .stage("scaffold");
        cancel.check()?;

        let mut tree = blocks::parse(body, self.config.detect_loops)?;
        events
            .record(EventKind::ScopesParsed)
            .method(method)
            .message(format!(
                "{} leaves, {} scopes, {} loops",
                tree.root.leaf_count(),
                tree.root.scope_count(),
                tree.root.loop_count()
            ))
            .stage("parse");
        cancel.check()?;

        let mut predicate = SwitchPredicate::new(ctx.predicate);
        predicate.init(ctx);
        let native_stub = predicate.native_stub().cloned();
        if let Some(stub) = &native_stub {
            events
                .record(EventKind::NativeStubGenerated)
                .method(method)
                .message(format!("stub {:#010x}, {} bytes", stub.id, stub.code.len()))
                .stage("mangle");
        }

        let stats = Mangler::new(ctx, &predicate, locals, self.config.opcode_capacity)
            .run(body, &mut tree)?;
        if stats.splits > 0 {
            events
                .record(EventKind::BlockSplit)
                .method(method)
                .message(format!("{} splits", stats.splits))
                .stage("mangle");
        }
        if stats.scopes_flattened > 0 {
            events
                .record(EventKind::ControlFlowFlattened)
                .method(method)
                .message(format!(
                    "{} scopes, {} units, {} trampolines",
                    stats.scopes_flattened, stats.units, stats.trampolines
                ))
                .stage("mangle");
        }
        if stats.junk > 0 {
            events
                .record(EventKind::JunkInserted)
                .method(method)
                .message(format!("{} junk sequences", stats.junk))
                .stage("mangle");
        }
        cancel.check()?;

        let report = emitter::emit(body, &tree, self.config.max_stack)?;
        if report.handlers > 0 {
            events
                .record(EventKind::HandlersRepaired)
                .method(method)
                .message(format!("{} handlers", report.handlers))
                .stage("emit");
        }
        if report.exact_max_stack {
            events
                .record(EventKind::MaxStackComputed)
                .method(method)
                .message(format!("max-stack {}", report.max_stack))
                .stage("emit");
        } else {
            events
                .record(EventKind::Warning)
                .method(method)
                .message(format!("max-stack fixed at {}", report.max_stack))
                .stage("emit");
        }

        Ok(MethodOutcome {
            method,
            constants: table.len(),
            sites,
            scaffold_len,
            scopes: stats.scopes_flattened,
            units: stats.units,
            native_stub,
            max_stack: report.max_stack,
        })
    }
}

impl MethodPass for LocalVirtualizationPass {
    fn name(&self) -> &'static str {
        "local-virtualization"
    }

    fn description(&self) -> &'static str {
        "Moves literals into a data table and flattens control flow into key-driven dispatch loops"
    }

    fn run_on_method(
        &self,
        body: &mut MethodBody,
        mut ctx: CfContext,
        events: &EventLog,
        cancel: &CancellationToken,
    ) -> Result<MethodOutcome> {
        let method = ctx.method;
        if body.is_empty() {
            return Err(crate::Error::NoBody(method));
        }

        events
            .record(EventKind::MethodProcessingStarted)
            .method(method)
            .message(format!("{} instructions", body.len()))
            .stage(self.name());

        let snapshot = body.clone();
        let staged = EventLog::new();
        match self.transform(body, &mut ctx, &staged, cancel) {
            Ok(outcome) => {
                events.merge(&staged);
                debug!(
                    "method {}: {} constants, {} scopes flattened, {} instructions",
                    method,
                    outcome.constants,
                    outcome.scopes,
                    body.len()
                );
                events
                    .record(EventKind::MethodProcessingCompleted)
                    .method(method)
                    .message(format!("{} instructions", body.len()))
                    .stage(self.name());
                Ok(outcome)
            }
            Err(error) => {
                trace!("method {}: restoring snapshot after {}", method, error);
                *body = snapshot;
                Err(error)
            }
        }
    }
}
