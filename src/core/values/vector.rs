use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// A dense vector of scalars, used for vector-valued ports and for the
/// continuous and discrete state partitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicVector {
    values: Vec<f64>,
}

impl BasicVector {
    /// A vector of `len` zeros.
    pub fn zeros(len: usize) -> Self {
        Self {
            values: vec![0.0; len],
        }
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Self {
            values: values.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut f64> {
        self.values.get_mut(index)
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// Overwrite every element from `values`. Lengths must match.
    pub fn set_from_slice(&mut self, values: &[f64]) {
        assert_eq!(
            self.values.len(),
            values.len(),
            "BasicVector::set_from_slice length mismatch"
        );
        self.values.copy_from_slice(values);
    }
}

impl From<Vec<f64>> for BasicVector {
    fn from(values: Vec<f64>) -> Self {
        Self { values }
    }
}

impl Index<usize> for BasicVector {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.values[index]
    }
}

impl IndexMut<usize> for BasicVector {
    fn index_mut(&mut self, index: usize) -> &mut f64 {
        &mut self.values[index]
    }
}
