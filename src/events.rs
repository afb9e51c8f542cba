//! Event logging for the virtualization pipeline.
//!
//! Every stage records what it did to a method into a shared [`EventLog`]. The log
//! is append-only and safe to share between the worker threads of the phase driver,
//! so methods processed in parallel report into the same log without locking.
//!
//! # Architecture
//!
//! - [`Event`] - A single recorded event (transformation, skip, diagnostic)
//! - [`EventLog`] - Collection of events with query capabilities
//! - [`EventBuilder`] - Fluent API for creating events, recorded on drop
//! - [`DerivedStats`] - Counters computed from a log, reported per phase run
//!
//! # Example
//!
//! ```rust
//! use cilvirt::events::{DerivedStats, EventKind, EventLog};
//! use cilvirt::cil::Token;
//!
//! let log = EventLog::new();
//! log.record(EventKind::ConstantExtracted)
//!     .method(Token::new(0x0600_0001))
//!     .message("ldstr \"hello\" -> key 0");
//! log.record(EventKind::ConstantReplaced)
//!     .at(Token::new(0x0600_0001), 3);
//!
//! assert_eq!(log.count_kind(EventKind::ConstantExtracted), 1);
//! assert_eq!(
//!     DerivedStats::from_log(&log).summary(),
//!     "1 methods, 1 constants (1 sites)"
//! );
//! ```

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use crate::cil::Token;

/// Categories of events that can be logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A distinct literal was moved into the data table.
    ConstantExtracted,
    /// A literal occurrence was rewritten into an indirect data-table load.
    ConstantReplaced,
    /// Virtualization locals and their initializers were added.
    ScaffoldInjected,
    /// A leaf block was split at a stack-empty point.
    BlockSplit,
    /// A scope was flattened into a dispatch loop.
    ControlFlowFlattened,
    /// Junk instructions were planted.
    JunkInserted,
    /// A native decoding stub was generated.
    NativeStubGenerated,
    /// Exception handler boundaries were recomputed.
    HandlersRepaired,

    /// The block/scope tree of a method was built.
    ScopesParsed,
    /// The maximum stack depth was recomputed.
    MaxStackComputed,

    /// Method processing started.
    MethodProcessingStarted,
    /// Method processing completed.
    MethodProcessingCompleted,
    /// A method was left untransformed.
    MethodSkipped,
    /// A method was removed from the protection targets.
    MethodExcluded,

    /// Warning (something unexpected but recoverable).
    Warning,
    /// Error (something failed).
    Error,
}

impl EventKind {
    /// Returns a human-readable description of this event kind.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            // Transformations
            Self::ConstantExtracted => "constant extracted",
            Self::ConstantReplaced => "constant replaced",
            Self::ScaffoldInjected => "scaffold injected",
            Self::BlockSplit => "block split",
            Self::ControlFlowFlattened => "control flow flattened",
            Self::JunkInserted => "junk inserted",
            Self::NativeStubGenerated => "native stub generated",
            Self::HandlersRepaired => "handlers repaired",
            // Analysis
            Self::ScopesParsed => "scopes parsed",
            Self::MaxStackComputed => "max stack computed",
            // Engine
            Self::MethodProcessingStarted => "method processing started",
            Self::MethodProcessingCompleted => "method processing completed",
            Self::MethodSkipped => "method skipped",
            Self::MethodExcluded => "method excluded",
            // Diagnostic
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    /// Returns true if this event represents a code transformation.
    #[must_use]
    pub fn is_transformation(&self) -> bool {
        matches!(
            self,
            Self::ConstantExtracted
                | Self::ConstantReplaced
                | Self::ScaffoldInjected
                | Self::BlockSplit
                | Self::ControlFlowFlattened
                | Self::JunkInserted
                | Self::NativeStubGenerated
                | Self::HandlersRepaired
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A single logged event.
#[derive(Debug, Clone)]
pub struct Event {
    /// The type of event.
    pub kind: EventKind,
    /// The method where the event occurred (if applicable).
    pub method: Option<Token>,
    /// Location within the method (instruction position).
    pub location: Option<usize>,
    /// Human-readable description.
    pub message: String,
    /// Pipeline stage that produced the event.
    pub stage: Option<&'static str>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.method {
            Some(method) => write!(f, "[{}] {}: {}", self.kind, method, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// Builder for creating events with a fluent API.
///
/// Created by [`EventLog::record`]. The event is added to the log when the
/// builder is dropped.
pub struct EventBuilder<'a> {
    log: &'a EventLog,
    kind: EventKind,
    method: Option<Token>,
    location: Option<usize>,
    message: Option<String>,
    stage: Option<&'static str>,
}

impl<'a> EventBuilder<'a> {
    fn new(log: &'a EventLog, kind: EventKind) -> Self {
        Self {
            log,
            kind,
            method: None,
            location: None,
            message: None,
            stage: None,
        }
    }

    /// Sets the method and location where the event occurred.
    pub fn at(mut self, method: Token, location: usize) -> Self {
        self.method = Some(method);
        self.location = Some(location);
        self
    }

    /// Sets only the method (for method-level events without specific location).
    pub fn method(mut self, method: Token) -> Self {
        self.method = Some(method);
        self
    }

    /// Sets a custom message describing the event.
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Associates this event with a pipeline stage.
    pub fn stage(mut self, stage: &'static str) -> Self {
        self.stage = Some(stage);
        self
    }
}

impl Drop for EventBuilder<'_> {
    fn drop(&mut self) {
        let message = self
            .message
            .take()
            .unwrap_or_else(|| self.kind.description().to_string());

        self.log.events.push(Event {
            kind: self.kind,
            method: self.method.take(),
            location: self.location.take(),
            message,
            stage: self.stage.take(),
        });
    }
}

/// Collection of events produced by the virtualization phase.
///
/// This type is thread-safe: events can be appended concurrently from
/// multiple threads using shared references (`&self`).
#[derive(Debug)]
pub struct EventLog {
    events: boxcar::Vec<Event>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventLog {
    fn clone(&self) -> Self {
        let new_log = Self::new();
        new_log.merge(self);
        new_log
    }
}

impl EventLog {
    /// Creates an empty event log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: boxcar::Vec::new(),
        }
    }

    /// Returns true if no events have been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.count() == 0
    }

    /// Returns the total number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.count()
    }

    /// Starts building a new event of the given kind.
    ///
    /// The event is added when the builder is dropped.
    pub fn record(&self, kind: EventKind) -> EventBuilder<'_> {
        EventBuilder::new(self, kind)
    }

    /// Appends copies of all events of `other`.
    pub fn merge(&self, other: &EventLog) {
        for (_, event) in &other.events {
            self.events.push(event.clone());
        }
    }

    /// Returns true if any event of the given kind exists.
    #[must_use]
    pub fn has(&self, kind: EventKind) -> bool {
        self.events.iter().any(|(_, e)| e.kind == kind)
    }

    /// Counts events of the given kind.
    #[must_use]
    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|(_, e)| e.kind == kind).count()
    }

    /// Returns an iterator over all events.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|(_, e)| e)
    }

    /// Returns an iterator over events of a specific kind.
    pub fn filter_kind(&self, kind: EventKind) -> impl Iterator<Item = &Event> + '_ {
        self.events
            .iter()
            .filter_map(move |(_, e)| if e.kind == kind { Some(e) } else { None })
    }

    /// Counts events grouped by kind.
    #[must_use]
    pub fn count_by_kind(&self) -> HashMap<EventKind, usize> {
        let mut counts = HashMap::new();
        for (_, event) in &self.events {
            *counts.entry(event.kind).or_insert(0) += 1;
        }
        counts
    }

    /// Returns the number of unique methods that received a transformation.
    #[must_use]
    pub fn methods_transformed(&self) -> usize {
        self.events
            .iter()
            .filter(|(_, e)| e.kind.is_transformation())
            .filter_map(|(_, e)| e.method)
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Statistics derived from an [`EventLog`].
#[derive(Debug, Clone, Default)]
pub struct DerivedStats {
    /// Number of methods that had any transformations.
    pub methods_transformed: usize,
    /// Number of methods left untransformed.
    pub methods_skipped: usize,
    /// Number of distinct constants moved into data tables.
    pub constants_extracted: usize,
    /// Number of literal sites rewritten.
    pub constants_replaced: usize,
    /// Number of scopes flattened into dispatch loops.
    pub scopes_flattened: usize,
    /// Number of native stubs generated.
    pub native_stubs: usize,
    /// Number of warnings.
    pub warnings: usize,
    /// Number of errors.
    pub errors: usize,
    /// Processing time.
    pub total_time: Duration,
}

impl DerivedStats {
    /// Computes statistics from an event log.
    #[must_use]
    pub fn from_log(log: &EventLog) -> Self {
        let counts = log.count_by_kind();
        let get = |kind: EventKind| counts.get(&kind).copied().unwrap_or(0);

        Self {
            methods_transformed: log.methods_transformed(),
            methods_skipped: get(EventKind::MethodSkipped),
            constants_extracted: get(EventKind::ConstantExtracted),
            constants_replaced: get(EventKind::ConstantReplaced),
            scopes_flattened: get(EventKind::ControlFlowFlattened),
            native_stubs: get(EventKind::NativeStubGenerated),
            warnings: get(EventKind::Warning),
            errors: get(EventKind::Error),
            total_time: Duration::ZERO,
        }
    }

    /// Sets the total processing time.
    #[must_use]
    pub fn with_time(mut self, time: Duration) -> Self {
        self.total_time = time;
        self
    }

    /// Generates a human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();

        if self.methods_transformed > 0 {
            parts.push(format!("{} methods", self.methods_transformed));
        }
        if self.constants_extracted > 0 {
            parts.push(format!(
                "{} constants ({} sites)",
                self.constants_extracted, self.constants_replaced
            ));
        }
        if self.scopes_flattened > 0 {
            parts.push(format!("{} scopes flattened", self.scopes_flattened));
        }
        if self.native_stubs > 0 {
            parts.push(format!("{} native stubs", self.native_stubs));
        }
        if self.methods_skipped > 0 {
            parts.push(format!("{} skipped", self.methods_skipped));
        }
        if self.errors > 0 {
            parts.push(format!("{} errors", self.errors));
        }
        if self.warnings > 0 {
            parts.push(format!("{} warnings", self.warnings));
        }

        let stats = if parts.is_empty() {
            "no transformations".to_string()
        } else {
            parts.join(", ")
        };

        if self.total_time.as_millis() > 0 {
            format!("{} in {:?}", stats, self.total_time)
        } else {
            stats
        }
    }
}

impl fmt::Display for DerivedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}
