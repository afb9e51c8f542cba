//! Configuration for local virtualization.
//!
//! Two layers exist. [`VirtualizationConfig`] holds engine-wide settings chosen by
//! whoever embeds the engine (table capacities, which literal kinds to extract, how
//! max-stack is finalized). [`Parameters`] holds the per-method protection options
//! as raw strings, exactly as a host protection pipeline supplies them; they are
//! resolved into a typed [`crate::virtualization::CfContext`] right before a method
//! is processed.

use std::{collections::HashMap, str::FromStr};

use bitflags::bitflags;
use strum::{Display, EnumIter, EnumString};

/// Parameter key selecting the dispatch style.
pub const PARAM_TYPE: &str = "type";
/// Parameter key selecting the predicate kind.
pub const PARAM_PREDICATE: &str = "predicate";
/// Parameter key holding the intensity percentage.
pub const PARAM_INTENSITY: &str = "intensity";
/// Parameter key holding the nesting depth.
pub const PARAM_DEPTH: &str = "depth";
/// Parameter key toggling junk code.
pub const PARAM_JUNK: &str = "junk";

/// Default intensity percentage.
pub const DEFAULT_INTENSITY: u32 = 60;
/// Default nesting depth.
pub const DEFAULT_DEPTH: u32 = 4;
/// Largest accepted nesting depth.
pub const MAX_DEPTH: u32 = 16;

/// How flattened scopes dispatch to their units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum DispatchStyle {
    /// One `switch` over all units of a scope
    #[default]
    #[strum(to_string = "switch")]
    Switch,
    /// A tree of unsigned range checks down to the configured depth, then narrow switches
    #[strum(to_string = "jump", serialize = "nested-jump", serialize = "nestedjump")]
    NestedJump,
}

/// How the dispatcher decodes the key pushed by a unit exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum PredicateKind {
    /// Inline arithmetic in IL
    #[default]
    #[strum(to_string = "normal", serialize = "arithmetic")]
    Normal,
    /// A call into a generated x86 stub
    #[strum(to_string = "x86", serialize = "native", serialize = "platform-specific")]
    Native,
}

impl PredicateKind {
    /// Returns `true` if the predicate puts unmanaged code into the module.
    #[must_use]
    pub fn requires_native_code(self) -> bool {
        matches!(self, PredicateKind::Native)
    }
}

/// Raw per-method protection parameters.
///
/// Keys are case-insensitive. Values are parsed on demand; anything that fails to
/// parse yields the caller's default.
///
/// # Examples
///
/// ```rust
/// use cilvirt::virtualization::{DispatchStyle, Parameters};
///
/// let params = Parameters::new()
///     .with("Type", "JUMP")
///     .with("intensity", "eighty");
///
/// assert_eq!(params.get("type", DispatchStyle::Switch), DispatchStyle::NestedJump);
/// assert_eq!(params.get("intensity", 60u32), 60);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    values: HashMap<String, String>,
}

impl Parameters {
    /// Creates an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the set with `key` set to `value`.
    #[must_use]
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    /// Sets `key` to `value`.
    pub fn set(&mut self, key: &str, value: &str) {
        self.values
            .insert(key.to_ascii_lowercase(), value.trim().to_string());
    }

    /// Removes `key`.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(&key.to_ascii_lowercase())
    }

    /// Returns the raw value of `key`.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parses `key`, falling back to `default` if it is absent or malformed.
    #[must_use]
    pub fn get<T: FromStr>(&self, key: &str, default: T) -> T {
        self.raw(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }

    /// Parses a boolean, accepting `true/false`, `yes/no`, `on/off` and `1/0`.
    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.raw(key).map(str::to_ascii_lowercase).as_deref() {
            Some("true" | "yes" | "on" | "1") => true,
            Some("false" | "no" | "off" | "0") => false,
            _ => default,
        }
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if no parameter is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

bitflags! {
    /// Literal kinds moved into the data table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LiteralKinds: u8 {
        /// `ldstr`
        const STRING = 0x01;
        /// `ldc.i4`
        const INT32 = 0x02;
        /// `ldc.i8`
        const INT64 = 0x04;
        /// `ldc.r4`
        const FLOAT32 = 0x08;
        /// `ldc.r8`
        const FLOAT64 = 0x10;
        /// All numeric literal kinds
        const NUMERIC = Self::INT32.bits() | Self::INT64.bits() | Self::FLOAT32.bits() | Self::FLOAT64.bits();
    }
}

impl Default for LiteralKinds {
    fn default() -> Self {
        LiteralKinds::STRING
    }
}

/// How many slots the data table is allocated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableCapacity {
    /// A fixed slot count, raised to the number of distinct constants if smaller
    Fixed(u32),
    /// Exactly as many slots as distinct constants
    Exact,
}

impl TableCapacity {
    /// Resolves the slot count for `required` distinct constants.
    #[must_use]
    pub fn resolve(self, required: u32) -> u32 {
        match self {
            TableCapacity::Fixed(capacity) => capacity.max(required),
            TableCapacity::Exact => required,
        }
    }
}

/// How the re-emitter finalizes the declared max-stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxStackPolicy {
    /// Recompute by stack depth analysis
    #[default]
    Exact,
    /// Declare a fixed bound and ask the writer to keep it
    Conservative(u16),
}

/// Engine-wide configuration for local virtualization.
#[derive(Debug, Clone)]
pub struct VirtualizationConfig {
    /// Slot count of the opcode table (default: 100).
    pub opcode_capacity: u32,

    /// Slot count policy of the data table (default: `Fixed(200)`).
    pub data_capacity: TableCapacity,

    /// Literal kinds moved into the data table (default: strings only).
    pub literal_kinds: LiteralKinds,

    /// Max-stack finalization (default: exact recomputation).
    pub max_stack: MaxStackPolicy,

    /// Wrap natural loops into their own scopes so they are flattened separately
    /// (default: true).
    pub detect_loops: bool,

    /// Module-wide seed for per-method random generators (default: 0).
    pub seed: u64,

    /// Process methods on the rayon thread pool (default: true).
    pub parallel: bool,
}

impl Default for VirtualizationConfig {
    fn default() -> Self {
        Self {
            opcode_capacity: 100,
            data_capacity: TableCapacity::Fixed(200),
            literal_kinds: LiteralKinds::default(),
            max_stack: MaxStackPolicy::Exact,
            detect_loops: true,
            seed: 0,
            parallel: true,
        }
    }
}

impl VirtualizationConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the module seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the literal kinds to extract.
    #[must_use]
    pub fn with_literal_kinds(mut self, kinds: LiteralKinds) -> Self {
        self.literal_kinds = kinds;
        self
    }

    /// Sets the data table capacity policy.
    #[must_use]
    pub fn with_data_capacity(mut self, capacity: TableCapacity) -> Self {
        self.data_capacity = capacity;
        self
    }

    /// Sets the max-stack policy.
    #[must_use]
    pub fn with_max_stack(mut self, policy: MaxStackPolicy) -> Self {
        self.max_stack = policy;
        self
    }

    /// Enables or disables loop scopes.
    #[must_use]
    pub fn with_loop_detection(mut self, enabled: bool) -> Self {
        self.detect_loops = enabled;
        self
    }

    /// Enables or disables parallel processing.
    #[must_use]
    pub fn with_parallel(mut self, enabled: bool) -> Self {
        self.parallel = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_style_parsing() {
        assert_eq!("switch".parse::<DispatchStyle>().ok(), Some(DispatchStyle::Switch));
        assert_eq!("Jump".parse::<DispatchStyle>().ok(), Some(DispatchStyle::NestedJump));
        assert_eq!(
            "nested-jump".parse::<DispatchStyle>().ok(),
            Some(DispatchStyle::NestedJump)
        );
        assert!("ladder".parse::<DispatchStyle>().is_err());
        assert_eq!(DispatchStyle::NestedJump.to_string(), "jump");
    }

    #[test]
    fn test_predicate_parsing() {
        assert_eq!("x86".parse::<PredicateKind>().ok(), Some(PredicateKind::Native));
        assert_eq!(
            "Platform-Specific".parse::<PredicateKind>().ok(),
            Some(PredicateKind::Native)
        );
        assert_eq!("NORMAL".parse::<PredicateKind>().ok(), Some(PredicateKind::Normal));
        assert!(PredicateKind::Native.requires_native_code());
        assert!(!PredicateKind::Normal.requires_native_code());
    }

    #[test]
    fn test_parameter_fallbacks() {
        let params = Parameters::new()
            .with("depth", "7")
            .with("junk", "Yes")
            .with("intensity", "-3");

        assert_eq!(params.get("depth", DEFAULT_DEPTH), 7);
        assert!(params.get_bool("junk", false));
        assert_eq!(params.get("intensity", DEFAULT_INTENSITY), DEFAULT_INTENSITY);
        assert_eq!(params.get("missing", 5u32), 5);
        assert!(!params.get_bool("missing", false));
    }

    #[test]
    fn test_table_capacity() {
        assert_eq!(TableCapacity::Fixed(200).resolve(3), 200);
        assert_eq!(TableCapacity::Fixed(2).resolve(3), 3);
        assert_eq!(TableCapacity::Exact.resolve(3), 3);
    }

    #[test]
    fn test_default_config() {
        let config = VirtualizationConfig::default();
        assert_eq!(config.opcode_capacity, 100);
        assert_eq!(config.data_capacity, TableCapacity::Fixed(200));
        assert_eq!(config.literal_kinds, LiteralKinds::STRING);
        assert_eq!(config.max_stack, MaxStackPolicy::Exact);
    }
}
