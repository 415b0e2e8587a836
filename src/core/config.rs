//! Configuration for contexts
//!
//! This module provides the shape a system declares for its leaf context at
//! setup time, and the concurrency setting diagram contexts use when cloning.

use serde::{Deserialize, Serialize};

/// Enumeration of supported concurrency modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConcurrencyMode {
    /// Subsystem contexts are cloned one after another on the calling thread
    #[default]
    Sequential,
    /// Subsystem contexts are cloned concurrently using Rayon
    Rayon,
}

/// Shape of a leaf context
///
/// Declares how many input and output ports the owning system has and how
/// its state is partitioned. Modal states carry arbitrary values and are
/// declared on the context itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Number of input ports
    pub input_ports: usize,
    /// Number of output ports
    pub output_ports: usize,
    /// Number of continuous state variables
    pub continuous_states: usize,
    /// Size of each discrete ("difference") state group
    pub difference_states: Vec<usize>,
}

impl ContextConfig {
    /// Create a configuration with no ports and no state
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of input ports
    pub fn with_input_ports(mut self, count: usize) -> Self {
        self.input_ports = count;
        self
    }

    /// Set the number of output ports
    pub fn with_output_ports(mut self, count: usize) -> Self {
        self.output_ports = count;
        self
    }

    /// Set the number of continuous state variables
    pub fn with_continuous_states(mut self, count: usize) -> Self {
        self.continuous_states = count;
        self
    }

    /// Append a discrete state group of `size` variables
    pub fn with_difference_state(mut self, size: usize) -> Self {
        self.difference_states.push(size);
        self
    }
}
