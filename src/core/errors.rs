use thiserror::Error;

use super::types::{PortIdentifier, PortIndex, SystemIndex};

/// Errors raised by context wiring and port access.
///
/// Every variant describes malformed wiring or a malformed access, never a
/// transient condition: a caller receiving one of these should propagate it
/// and stop, not retry. A port that is merely unconnected or a cache line
/// that has not been computed yet is reported as `None`, not as an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("input port {index} out of range: context has {count} input ports")]
    InputPortOutOfRange { index: PortIndex, count: usize },

    #[error("output port {index} out of range: context has {count} output ports")]
    OutputPortOutOfRange { index: PortIndex, count: usize },

    #[error("subsystem {index} out of range: diagram has {count} subsystems")]
    SubsystemOutOfRange { index: SystemIndex, count: usize },

    #[error("subsystem {index} has already been added")]
    SubsystemAlreadyAdded { index: SystemIndex },

    #[error("subsystem {index} has not been added")]
    SubsystemMissing { index: SystemIndex },

    #[error("connecting {src} -> {dest} would close a loop between subsystems")]
    WiringCycle {
        src: PortIdentifier,
        dest: PortIdentifier,
    },

    #[error("diagram context is sealed; allocation-only operations are no longer allowed")]
    Sealed,

    #[error("diagram context is still being built")]
    NotSealed,

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}
