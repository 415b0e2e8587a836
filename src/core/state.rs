use serde::{Deserialize, Serialize};

use super::config::ContextConfig;
use super::types::SystemIndex;
use super::values::{BasicVector, TypedValue};

/// Information about the independent variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    /// The time, in seconds.
    pub time: f64,
}

/// State owned outright by a leaf context.
///
/// Partitioned into continuous variables, discrete ("difference") groups and
/// modal entries carrying arbitrary values.
#[derive(Debug, Clone, Default)]
pub struct State {
    continuous: BasicVector,
    difference: Vec<BasicVector>,
    modal: Vec<TypedValue>,
}

impl State {
    /// Zero-initialised state shaped by `config`, with no modal entries.
    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            continuous: BasicVector::zeros(config.continuous_states),
            difference: config
                .difference_states
                .iter()
                .map(|&size| BasicVector::zeros(size))
                .collect(),
            modal: Vec::new(),
        }
    }

    pub fn continuous(&self) -> &BasicVector {
        &self.continuous
    }

    pub fn continuous_mut(&mut self) -> &mut BasicVector {
        &mut self.continuous
    }

    pub fn difference(&self) -> &[BasicVector] {
        &self.difference
    }

    pub fn difference_mut(&mut self) -> &mut [BasicVector] {
        &mut self.difference
    }

    pub fn modal(&self) -> &[TypedValue] {
        &self.modal
    }

    pub fn modal_mut(&mut self) -> &mut [TypedValue] {
        &mut self.modal
    }

    pub(crate) fn push_modal(&mut self, value: TypedValue) -> usize {
        self.modal.push(value);
        self.modal.len() - 1
    }
}

/// One entry of a composite state view: which subsystem owns the element
/// and its index in that subsystem's own numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateSlot {
    pub system: SystemIndex,
    pub index: usize,
}

/// Non-owning view of the state of every subsystem in a diagram.
///
/// Holds no values, only slots. Continuous scalars and discrete groups are
/// concatenated in subsystem order; modal entries in (subsystem, local
/// index) order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompositeState {
    continuous: Vec<StateSlot>,
    difference: Vec<StateSlot>,
    modal: Vec<StateSlot>,
}

impl CompositeState {
    /// Append the partitions of the next subsystem.
    pub(crate) fn append(
        &mut self,
        system: SystemIndex,
        continuous: usize,
        difference: usize,
        modal: usize,
    ) {
        self.continuous
            .extend((0..continuous).map(|index| StateSlot { system, index }));
        self.difference
            .extend((0..difference).map(|index| StateSlot { system, index }));
        self.modal
            .extend((0..modal).map(|index| StateSlot { system, index }));
    }

    pub fn continuous_len(&self) -> usize {
        self.continuous.len()
    }

    pub fn difference_len(&self) -> usize {
        self.difference.len()
    }

    pub fn modal_len(&self) -> usize {
        self.modal.len()
    }

    pub fn continuous_slot(&self, index: usize) -> Option<StateSlot> {
        self.continuous.get(index).copied()
    }

    pub fn difference_slot(&self, index: usize) -> Option<StateSlot> {
        self.difference.get(index).copied()
    }

    pub fn modal_slot(&self, index: usize) -> Option<StateSlot> {
        self.modal.get(index).copied()
    }
}
