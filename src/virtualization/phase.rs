//! Phase driver: runs the pass over every targeted method of a module.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::{
    cil::{MethodBody, Token},
    events::{DerivedStats, EventKind, EventLog},
    virtualization::{
        cipher::DynCipherService,
        pass::{LocalVirtualizationPass, MethodOutcome, MethodPass},
        protection::{ProtectionParameters, PROTECTION_ID},
        CfContext, ModuleInfo, RandomSource, VirtualizationConfig, WriterOptions,
    },
    Error, Result,
};

/// Cooperative cancellation flag shared between the host and the workers.
///
/// Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Returns [`Error::Cancelled`] once cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the token was cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A method as the host hands it to the phase.
#[derive(Debug, Clone)]
pub struct MethodDef {
    /// MethodDef token
    pub token: Token,
    /// Display name
    pub name: String,
    /// The body, absent for abstract, extern and runtime methods
    pub body: Option<MethodBody>,
}

impl MethodDef {
    /// Creates a method with a body.
    #[must_use]
    pub fn new(token: Token, name: impl Into<String>, body: MethodBody) -> Self {
        MethodDef {
            token,
            name: name.into(),
            body: Some(body),
        }
    }

    /// Whether the method has instructions to transform.
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.as_ref().is_some_and(|b| !b.is_empty())
    }
}

/// Result of one phase run.
#[derive(Debug, Default)]
pub struct PhaseReport {
    /// Transformed methods
    pub outcomes: Vec<MethodOutcome>,
    /// Methods left untransformed because of their structure
    pub skipped: Vec<Token>,
    /// Methods whose transformation hit an invariant violation, restored
    pub failed: Vec<(Token, Error)>,
    /// Methods not processed because of cancellation
    pub cancelled: Vec<Token>,
    /// Counters derived from the events of this run
    pub stats: DerivedStats,
}

impl PhaseReport {
    /// Whether every targeted method was transformed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty() && self.cancelled.is_empty()
    }

    /// Whether the run was cut short.
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        !self.cancelled.is_empty()
    }
}

enum MethodResult {
    Untargeted,
    Done(MethodOutcome),
    Skipped(Token),
    Failed(Token, Error),
    Cancelled(Token),
}

/// Runs [`LocalVirtualizationPass`] over the targeted methods of a module.
pub struct VirtualizationPhase {
    pass: LocalVirtualizationPass,
    cipher: Arc<dyn DynCipherService>,
    random: RandomSource,
    events: EventLog,
}

impl VirtualizationPhase {
    /// Name shown by the host pipeline.
    pub const NAME: &'static str = "Local Virtualization mangling";

    /// Creates the phase.
    #[must_use]
    pub fn new(config: VirtualizationConfig, cipher: Arc<dyn DynCipherService>) -> Self {
        let random = RandomSource::new(config.seed);
        VirtualizationPhase {
            pass: LocalVirtualizationPass::new(config),
            cipher,
            random,
            events: EventLog::new(),
        }
    }

    /// Events recorded by all runs so far.
    ///
    /// Each run collects into its own log, merged here once the run ends.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Transforms every method of `methods` that has parameters in `targets`
    /// and a non-empty body.
    ///
    /// Methods are independent: a failure on one never stops the others. With
    /// `parallel` set in the configuration they are processed on the rayon pool.
    /// Once `cancel` fires, methods not yet started are reported as cancelled and
    /// left untouched.
    pub fn run(
        &self,
        methods: &mut [MethodDef],
        targets: &ProtectionParameters,
        module: &ModuleInfo,
        writer: &WriterOptions,
        cancel: &CancellationToken,
    ) -> PhaseReport {
        let start = Instant::now();
        let events = EventLog::new();
        let process =
            |method: &mut MethodDef| self.process(method, targets, module, writer, &events, cancel);
        let results: Vec<MethodResult> = if self.pass.config().parallel {
            methods.par_iter_mut().map(process).collect()
        } else {
            methods.iter_mut().map(process).collect()
        };

        let mut report = PhaseReport::default();
        for result in results {
            match result {
                MethodResult::Untargeted => {}
                MethodResult::Done(outcome) => report.outcomes.push(outcome),
                MethodResult::Skipped(token) => report.skipped.push(token),
                MethodResult::Failed(token, error) => report.failed.push((token, error)),
                MethodResult::Cancelled(token) => report.cancelled.push(token),
            }
        }

        report.stats = DerivedStats::from_log(&events).with_time(start.elapsed());
        self.events.merge(&events);

        debug!(
            "{}: {} transformed, {} skipped, {} failed, {} cancelled ({})",
            Self::NAME,
            report.outcomes.len(),
            report.skipped.len(),
            report.failed.len(),
            report.cancelled.len(),
            report.stats
        );
        report
    }

    fn process(
        &self,
        method: &mut MethodDef,
        targets: &ProtectionParameters,
        module: &ModuleInfo,
        writer: &WriterOptions,
        events: &EventLog,
        cancel: &CancellationToken,
    ) -> MethodResult {
        let token = method.token;
        let Some(params) = targets.get(token) else {
            return MethodResult::Untargeted;
        };
        let Some(body) = method.body.as_mut().filter(|b| !b.is_empty()) else {
            return MethodResult::Untargeted;
        };
        if cancel.is_cancelled() {
            return MethodResult::Cancelled(token);
        }

        let rng = self.random.for_method(PROTECTION_ID, token);
        let result = CfContext::resolve(&params, token, module, writer, rng, self.cipher.clone())
            .and_then(|ctx| self.pass.run_on_method(body, ctx, events, cancel));

        match result {
            Ok(outcome) => MethodResult::Done(outcome),
            Err(Error::Cancelled) => MethodResult::Cancelled(token),
            Err(error) if error.is_structural() => {
                events
                    .record(EventKind::MethodSkipped)
                    .method(token)
                    .message(format!("{}: {error}", method.name))
                    .stage(self.pass.name());
                MethodResult::Skipped(token)
            }
            Err(error) => {
                warn!("method {} ({}) not virtualized: {}", token, method.name, error);
                events
                    .record(EventKind::Error)
                    .method(token)
                    .message(format!("{}: {error}", method.name))
                    .stage(self.pass.name());
                MethodResult::Failed(token, error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cil::{BodyBuilder, OpCode, TypeSig},
        test::factories,
        virtualization::{cipher::DynCipher, config::PARAM_PREDICATE, ComImageFlags, Parameters},
    };

    fn methods() -> Result<Vec<MethodDef>> {
        let mut methods = Vec::new();
        for (row, case) in factories::cases()?.into_iter().enumerate() {
            methods.push(MethodDef::new(
                Token::new(0x0600_0001 + row as u32),
                case.name,
                case.body,
            ));
        }
        Ok(methods)
    }

    fn targets(methods: &[MethodDef], params: &Parameters) -> ProtectionParameters {
        let targets = ProtectionParameters::new();
        for method in methods {
            targets.set(method.token, params.clone());
        }
        targets
    }

    fn phase(parallel: bool) -> VirtualizationPhase {
        VirtualizationPhase::new(
            VirtualizationConfig::default()
                .with_seed(42)
                .with_parallel(parallel),
            Arc::new(DynCipher),
        )
    }

    #[test]
    fn test_parallel_matches_sequential() -> Result<()> {
        let mut sequential = methods()?;
        let mut parallel = methods()?;
        let targets = targets(&sequential, &Parameters::new());

        let a = phase(false).run(
            &mut sequential,
            &targets,
            &ModuleInfo::default(),
            &WriterOptions::default(),
            &CancellationToken::new(),
        );
        let b = phase(true).run(
            &mut parallel,
            &targets,
            &ModuleInfo::default(),
            &WriterOptions::default(),
            &CancellationToken::new(),
        );

        assert!(a.is_complete());
        assert_eq!(a.outcomes, b.outcomes);
        for (x, y) in sequential.iter().zip(&parallel) {
            let (x, y) = (x.body.as_ref().unwrap(), y.body.as_ref().unwrap());
            assert_eq!(x.instructions(), y.instructions());
        }
        Ok(())
    }

    #[test]
    fn test_untargeted_and_bodyless_are_ignored() -> Result<()> {
        let mut methods = methods()?;
        let targets = ProtectionParameters::new();
        targets.set(methods[0].token, Parameters::new());
        methods.push(MethodDef {
            token: Token::new(0x0600_0100),
            name: "Abstract".into(),
            body: None,
        });
        targets.set(Token::new(0x0600_0100), Parameters::new());

        let original = methods[1].body.clone().unwrap().instructions();
        let report = phase(false).run(
            &mut methods,
            &targets,
            &ModuleInfo::default(),
            &WriterOptions::default(),
            &CancellationToken::new(),
        );

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].method, methods[0].token);
        assert_eq!(methods[1].body.as_ref().unwrap().instructions(), original);
        Ok(())
    }

    #[test]
    fn test_structural_method_is_skipped() -> Result<()> {
        let broken = BodyBuilder::new()
            .label("try")
            .op(OpCode::Nop)
            .leave("end")
            .label("handler")
            .op(OpCode::Pop)
            .label("end")
            .ret()
            .catch_handler("try", "handler", "handler", "end", TypeSig::Object)
            .build()?;
        let mut methods = methods()?;
        let token = Token::new(0x0600_0200);
        methods.push(MethodDef::new(token, "Broken", broken.clone()));
        let targets = targets(&methods, &Parameters::new());

        let phase = phase(true);
        let report = phase.run(
            &mut methods,
            &targets,
            &ModuleInfo::default(),
            &WriterOptions::default(),
            &CancellationToken::new(),
        );

        assert_eq!(report.skipped, vec![token]);
        assert_eq!(report.outcomes.len(), methods.len() - 1);
        assert!(phase.events().has(EventKind::MethodSkipped));
        let kept = methods.last().and_then(|m| m.body.as_ref()).unwrap();
        assert_eq!(kept.instructions(), broken.instructions());
        Ok(())
    }

    #[test]
    fn test_cancelled_run_touches_nothing() -> Result<()> {
        let mut methods = methods()?;
        let before: Vec<_> = methods
            .iter()
            .map(|m| m.body.as_ref().unwrap().instructions())
            .collect();
        let targets = targets(&methods, &Parameters::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = phase(true).run(
            &mut methods,
            &targets,
            &ModuleInfo::default(),
            &WriterOptions::default(),
            &cancel,
        );

        assert!(report.was_cancelled());
        assert_eq!(report.cancelled.len(), methods.len());
        assert!(report.outcomes.is_empty());
        for (method, original) in methods.iter().zip(before) {
            assert_eq!(method.body.as_ref().unwrap().instructions(), original);
        }
        Ok(())
    }

    #[test]
    fn test_report_stats_cover_one_run() -> Result<()> {
        let phase = phase(false);
        let mut first = methods()?;
        let targets = targets(&first, &Parameters::new());
        let report = phase.run(
            &mut first,
            &targets,
            &ModuleInfo::default(),
            &WriterOptions::default(),
            &CancellationToken::new(),
        );

        let sites: usize = report.outcomes.iter().map(|o| o.sites).sum();
        let constants: usize = report.outcomes.iter().map(|o| o.constants).sum();
        assert_eq!(report.stats.constants_replaced, sites);
        assert_eq!(report.stats.constants_extracted, constants);
        assert_eq!(report.stats.methods_transformed, report.outcomes.len());
        assert_eq!(report.stats.errors, 0);
        assert!(report.stats.summary().contains("methods"));

        let mut second = methods()?;
        let again = phase.run(
            &mut second,
            &targets,
            &ModuleInfo::default(),
            &WriterOptions::default(),
            &CancellationToken::new(),
        );
        assert_eq!(again.stats.constants_replaced, sites);
        assert_eq!(
            phase.events().count_kind(EventKind::ConstantReplaced),
            2 * sites
        );
        Ok(())
    }

    #[test]
    fn test_native_predicate_clears_il_only() -> Result<()> {
        let mut methods = methods()?;
        let targets = targets(&methods, &Parameters::new().with(PARAM_PREDICATE, "x86"));
        let writer = WriterOptions::default();

        let report = phase(true).run(
            &mut methods,
            &targets,
            &ModuleInfo::default(),
            &writer,
            &CancellationToken::new(),
        );

        assert!(report.is_complete());
        assert!(report.outcomes.iter().all(|o| o.native_stub.is_some()));
        assert!(!writer.cor20_flags()?.contains(ComImageFlags::IL_ONLY));
        Ok(())
    }
}
