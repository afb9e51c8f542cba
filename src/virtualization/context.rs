//! Per-method control-flow context.
//!
//! [`CfContext`] is the resolved form of a method's protection parameters: the
//! dispatch style, the key predicate, split intensity, dispatch depth and junk
//! flag, together with the method's private random stream and the shared cipher
//! service. Every stage after configuration reads its settings from here.

use std::{fmt, sync::Arc};

use rand::rngs::StdRng;
use tracing::debug;

use crate::{
    cil::Token,
    virtualization::{
        cipher::DynCipherService,
        config::{
            Parameters, DEFAULT_DEPTH, DEFAULT_INTENSITY, MAX_DEPTH, PARAM_DEPTH,
            PARAM_INTENSITY, PARAM_JUNK, PARAM_PREDICATE, PARAM_TYPE,
        },
        DispatchStyle, ModuleInfo, PredicateKind, WriterOptions,
    },
    Result,
};

/// Per-method control-flow context.
///
/// Built once right before a method is processed and dropped afterwards. Only
/// the random generator is mutated while the method is transformed.
pub struct CfContext {
    /// Dispatch style of flattened scopes
    pub style: DispatchStyle,
    /// Key decoding strategy
    pub predicate: PredicateKind,
    /// Probability of splitting a block at a stack-empty point, `0.0..=1.0`
    pub intensity: f64,
    /// Nesting depth of the range-check tree for nested-jump dispatch
    pub depth: u32,
    /// Whether junk instructions are planted
    pub junk: bool,
    /// Method being processed
    pub method: Token,
    /// Method-private random generator
    pub rng: StdRng,
    /// Shared cipher service
    pub cipher: Arc<dyn DynCipherService>,
}

impl fmt::Debug for CfContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CfContext")
            .field("style", &self.style)
            .field("predicate", &self.predicate)
            .field("intensity", &self.intensity)
            .field("depth", &self.depth)
            .field("junk", &self.junk)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl CfContext {
    /// Resolves the per-method parameters into a context.
    ///
    /// Missing or malformed values fall back to their defaults: switch dispatch,
    /// normal predicate, intensity 60, depth 4, no junk. An intensity outside
    /// `0..=100` or a depth outside `1..=16` counts as malformed. Junk code is
    /// forced off when the module disables JIT optimizations.
    ///
    /// Choosing the native predicate clears `IL_ONLY` on `writer`, because the
    /// output image will contain unmanaged stubs.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LockError`] if the writer flags are poisoned.
    pub fn resolve(
        params: &Parameters,
        method: Token,
        module: &ModuleInfo,
        writer: &WriterOptions,
        rng: StdRng,
        cipher: Arc<dyn DynCipherService>,
    ) -> Result<Self> {
        let style = params.get(PARAM_TYPE, DispatchStyle::default());
        let predicate = params.get(PARAM_PREDICATE, PredicateKind::default());

        let raw_intensity = params.get(PARAM_INTENSITY, DEFAULT_INTENSITY);
        let intensity = if raw_intensity <= 100 {
            raw_intensity
        } else {
            DEFAULT_INTENSITY
        };

        let raw_depth = params.get(PARAM_DEPTH, DEFAULT_DEPTH);
        let depth = if (1..=MAX_DEPTH).contains(&raw_depth) {
            raw_depth
        } else {
            DEFAULT_DEPTH
        };

        let junk = params.get_bool(PARAM_JUNK, false) && !module.optimizations_disabled();

        if predicate.requires_native_code() {
            writer.clear_il_only()?;
        }

        debug!(
            "method {}: style={} predicate={} intensity={} depth={} junk={}",
            method, style, predicate, intensity, depth, junk
        );

        Ok(CfContext {
            style,
            predicate,
            intensity: f64::from(intensity) / 100.0,
            depth,
            junk,
            method,
            rng,
            cipher,
        })
    }
}
