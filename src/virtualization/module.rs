//! Module-level inputs and outputs of the virtualization phase.
//!
//! The engine never reads or writes metadata itself. The host describes the two
//! module facts the phase depends on through [`ModuleInfo`] and receives the one
//! module-level side effect through [`WriterOptions`].

use std::sync::RwLock;

use bitflags::bitflags;

use crate::Result;

bitflags! {
    /// `System.Diagnostics.DebuggableAttribute.DebuggingModes`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DebuggingModes: u32 {
        /// Track information for the debugger
        const DEFAULT = 0x0001;
        /// Disable the JIT optimizer
        const DISABLE_OPTIMIZATIONS = 0x0100;
        /// Ignore symbol store sequence points
        const IGNORE_SYMBOL_STORE_SEQUENCE_POINTS = 0x0002;
        /// Enable edit and continue
        const ENABLE_EDIT_AND_CONTINUE = 0x0004;
    }
}

bitflags! {
    /// COR20 header flags of the output image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ComImageFlags: u32 {
        /// The image contains only IL code
        const IL_ONLY = 0x0000_0001;
        /// The image must run as a 32-bit process
        const BIT32_REQUIRED = 0x0000_0002;
        /// The image is strong-name signed
        const STRONG_NAME_SIGNED = 0x0000_0008;
        /// The entry point is a native function
        const NATIVE_ENTRYPOINT = 0x0000_0010;
        /// Prefer 32-bit when running on a 64-bit platform
        const BIT32_PREFERRED = 0x0002_0000;
    }
}

/// A `DebuggableAttribute` as found on an assembly or module.
///
/// The attribute has two constructors and compilers emit either of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggableAttribute {
    /// `DebuggableAttribute(DebuggingModes)`
    Modes(DebuggingModes),
    /// `DebuggableAttribute(bool isJITTrackingEnabled, bool isJITOptimizerDisabled)`
    Flags {
        /// JIT tracking enabled
        jit_tracking: bool,
        /// JIT optimizer disabled
        optimizer_disabled: bool,
    },
}

impl DebuggableAttribute {
    /// Builds the attribute from its raw constructor arguments.
    ///
    /// Accepts the single-integer form and the two-boolean form; anything else
    /// yields `None`.
    #[must_use]
    pub fn from_args(args: &[AttributeArg]) -> Option<Self> {
        match args {
            [AttributeArg::Int(modes)] => {
                Some(DebuggableAttribute::Modes(DebuggingModes::from_bits_retain(*modes)))
            }
            [AttributeArg::Bool(tracking), AttributeArg::Bool(disabled)] => {
                Some(DebuggableAttribute::Flags {
                    jit_tracking: *tracking,
                    optimizer_disabled: *disabled,
                })
            }
            _ => None,
        }
    }

    /// Returns `true` if the attribute turns the JIT optimizer off.
    #[must_use]
    pub fn disables_optimizations(&self) -> bool {
        match self {
            DebuggableAttribute::Modes(modes) => {
                modes.contains(DebuggingModes::DISABLE_OPTIMIZATIONS)
            }
            DebuggableAttribute::Flags {
                optimizer_disabled, ..
            } => *optimizer_disabled,
        }
    }
}

/// A fixed custom attribute argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeArg {
    /// Integer or enum argument
    Int(u32),
    /// Boolean argument
    Bool(bool),
}

/// Facts about the module that owns the processed methods.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    /// `DebuggableAttribute` on the assembly manifest, if any
    pub assembly_debuggable: Option<DebuggableAttribute>,
    /// `DebuggableAttribute` on the module, if any
    pub module_debuggable: Option<DebuggableAttribute>,
}

impl ModuleInfo {
    /// Returns `true` if the assembly or the module disables JIT optimizations.
    ///
    /// Junk code is suppressed for such modules so that debug builds keep a
    /// readable dispatch structure.
    #[must_use]
    pub fn optimizations_disabled(&self) -> bool {
        [self.assembly_debuggable, self.module_debuggable]
            .iter()
            .flatten()
            .any(DebuggableAttribute::disables_optimizations)
    }
}

/// Writer options shared by all methods of a module.
///
/// Methods are processed in parallel; the flags sit behind a lock because any of
/// them may need to clear `IL_ONLY`.
#[derive(Debug)]
pub struct WriterOptions {
    flags: RwLock<ComImageFlags>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self::new(ComImageFlags::IL_ONLY)
    }
}

impl WriterOptions {
    /// Creates writer options with the given COR20 flags.
    #[must_use]
    pub fn new(flags: ComImageFlags) -> Self {
        WriterOptions {
            flags: RwLock::new(flags),
        }
    }

    /// Current COR20 flags.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn cor20_flags(&self) -> Result<ComImageFlags> {
        Ok(*read_lock!(self.flags))
    }

    /// Marks the image as containing unmanaged code.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn clear_il_only(&self) -> Result<()> {
        write_lock!(self.flags).remove(ComImageFlags::IL_ONLY);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debuggable_shapes() {
        let modes = DebuggableAttribute::from_args(&[AttributeArg::Int(0x0107)]).unwrap();
        assert!(modes.disables_optimizations());

        let modes = DebuggableAttribute::from_args(&[AttributeArg::Int(0x0002)]).unwrap();
        assert!(!modes.disables_optimizations());

        let flags =
            DebuggableAttribute::from_args(&[AttributeArg::Bool(true), AttributeArg::Bool(true)])
                .unwrap();
        assert!(flags.disables_optimizations());

        assert!(DebuggableAttribute::from_args(&[AttributeArg::Bool(true)]).is_none());
    }

    #[test]
    fn test_module_or_assembly() {
        let mut info = ModuleInfo::default();
        assert!(!info.optimizations_disabled());

        info.module_debuggable = Some(DebuggableAttribute::Flags {
            jit_tracking: true,
            optimizer_disabled: true,
        });
        assert!(info.optimizations_disabled());

        info.module_debuggable = None;
        info.assembly_debuggable = Some(DebuggableAttribute::Modes(DebuggingModes::DEFAULT));
        assert!(!info.optimizations_disabled());
    }

    #[test]
    fn test_clear_il_only() -> Result<()> {
        let writer = WriterOptions::new(ComImageFlags::IL_ONLY | ComImageFlags::BIT32_PREFERRED);
        writer.clear_il_only()?;
        assert_eq!(writer.cor20_flags()?, ComImageFlags::BIT32_PREFERRED);
        Ok(())
    }
}
