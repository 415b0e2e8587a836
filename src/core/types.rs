use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Index of a subsystem inside one diagram context.
pub type SystemIndex = usize;

/// Index of an input or output port on one context.
pub type PortIndex = usize;

/// Address of a port inside one diagram context: the subsystem it belongs to
/// and the port index local to that subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortIdentifier {
    pub system: SystemIndex,
    pub port: PortIndex,
}

impl PortIdentifier {
    pub fn new(system: SystemIndex, port: PortIndex) -> Self {
        Self { system, port }
    }
}

impl From<(SystemIndex, PortIndex)> for PortIdentifier {
    fn from((system, port): (SystemIndex, PortIndex)) -> Self {
        Self::new(system, port)
    }
}

impl std::fmt::Display for PortIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.system, self.port)
    }
}

/// Identity of one context instance.
///
/// Issued fresh on construction and on every clone, so two contexts never
/// share an id even when one is a copy of the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
