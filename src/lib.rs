pub mod core;

// Re-export commonly used types
pub use crate::core::cache::{Cache, CacheTicket};
pub use crate::core::config::{ConcurrencyMode, ContextConfig};
pub use crate::core::context::{ContextBase, LeafContext};
pub use crate::core::diagram::{DiagramContext, Phase};
pub use crate::core::errors::ContextError;
pub use crate::core::ports::{InputPort, SystemOutput};
pub use crate::core::types::{PortIdentifier, PortIndex, SystemIndex};
pub use crate::core::values::{BasicVector, TypedValue};
