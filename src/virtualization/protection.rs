//! The protection as the host pipeline sees it.
//!
//! [`LocalVirtualizationProtection`] carries the identity strings the host uses
//! for configuration and display, builds the [`VirtualizationPhase`], and exposes
//! [`LocalVirtualizationService`] so other protections can opt methods out.

use std::sync::Arc;

use dashmap::DashMap;
use strum::{Display, EnumIter, EnumString};

use crate::{
    cil::Token,
    events::{EventKind, EventLog},
    virtualization::{
        cipher::{DynCipher, DynCipherService},
        phase::VirtualizationPhase,
        Parameters, VirtualizationConfig,
    },
};

/// Short id used in protection rules.
pub const PROTECTION_ID: &str = "local virt";

/// Fully qualified id; also the service id.
pub const FULL_ID: &str = "Ki.LocalVirtualization";

/// Preset levels a protection can be enabled at.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Display, EnumString, EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum ProtectionPreset {
    /// Not enabled by any preset
    #[default]
    None,
    /// Minimum preset
    Minimum,
    /// Normal preset
    Normal,
    /// Aggressive preset
    Aggressive,
    /// Maximum preset
    Maximum,
}

/// Per-method parameters for one protection context.
///
/// A method is targeted while it has an entry. Shared between the host, the
/// phase workers, and anything calling [`LocalVirtualizationService::exclude_method`].
#[derive(Debug, Default)]
pub struct ProtectionParameters {
    methods: DashMap<Token, Parameters>,
}

impl ProtectionParameters {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets `method` with `params`, replacing previous parameters.
    pub fn set(&self, method: Token, params: Parameters) {
        self.methods.insert(method, params);
    }

    /// The parameters of `method`, if it is targeted.
    #[must_use]
    pub fn get(&self, method: Token) -> Option<Parameters> {
        self.methods.get(&method).map(|entry| entry.value().clone())
    }

    /// Stops targeting `method`. Returns its parameters if it was targeted.
    pub fn remove(&self, method: Token) -> Option<Parameters> {
        self.methods.remove(&method).map(|(_, params)| params)
    }

    /// Whether `method` is targeted.
    #[must_use]
    pub fn contains(&self, method: Token) -> bool {
        self.methods.contains_key(&method)
    }

    /// Number of targeted methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no method is targeted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Service other protections use to keep methods out of local virtualization.
pub trait LocalVirtualizationService: Send + Sync {
    /// Removes `method` from the targets of `targets`.
    ///
    /// Has no effect on bodies that were already transformed.
    fn exclude_method(&self, targets: &ProtectionParameters, method: Token);
}

/// Local virtualization protection.
pub struct LocalVirtualizationProtection {
    config: VirtualizationConfig,
    cipher: Arc<dyn DynCipherService>,
    events: EventLog,
}

impl Default for LocalVirtualizationProtection {
    fn default() -> Self {
        Self::new(VirtualizationConfig::default())
    }
}

impl LocalVirtualizationProtection {
    /// Creates the protection with the default cipher service.
    #[must_use]
    pub fn new(config: VirtualizationConfig) -> Self {
        Self::with_cipher(config, Arc::new(DynCipher))
    }

    /// Creates the protection with a host-provided cipher service.
    #[must_use]
    pub fn with_cipher(config: VirtualizationConfig, cipher: Arc<dyn DynCipherService>) -> Self {
        LocalVirtualizationProtection {
            config,
            cipher,
            events: EventLog::new(),
        }
    }

    /// Short id used in protection rules.
    #[must_use]
    pub fn id(&self) -> &'static str {
        PROTECTION_ID
    }

    /// Fully qualified id.
    #[must_use]
    pub fn full_id(&self) -> &'static str {
        FULL_ID
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        "Local Virtualization Protection"
    }

    /// Description shown by the host.
    #[must_use]
    pub fn description(&self) -> &'static str {
        "This protection mangles the code in the methods so control flow and data are obfuscated."
    }

    /// Preset the protection is enabled at.
    #[must_use]
    pub fn preset(&self) -> ProtectionPreset {
        ProtectionPreset::Normal
    }

    /// Events recorded by the service side of the protection.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Builds the phase that performs the transformation.
    #[must_use]
    pub fn phase(&self) -> VirtualizationPhase {
        VirtualizationPhase::new(self.config.clone(), self.cipher.clone())
    }
}

impl LocalVirtualizationService for LocalVirtualizationProtection {
    fn exclude_method(&self, targets: &ProtectionParameters, method: Token) {
        if targets.remove(method).is_some() {
            self.events
                .record(EventKind::MethodExcluded)
                .method(method)
                .message(format!("excluded from {FULL_ID}"))
                .stage(PROTECTION_ID);
        }
    }
}
