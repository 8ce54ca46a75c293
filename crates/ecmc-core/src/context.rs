//! Immutable simulation context
//!
//! Every component that needs the dimension, the periodic box or the inverse
//! temperature receives a [`Context`] at construction. Nothing in the kernel
//! reads these values from ambient process state.

use serde::{Deserialize, Serialize};

use crate::{EcmcError, EcmcResult};

/// Hypercuboid with periodic boundaries plus the thermodynamic parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Context {
    system_lengths: Vec<f64>,
    beta: f64,
    /// Tree levels in the global state (1: point masses only).
    number_of_node_levels: usize,
    /// Leaves per composite root (1 without composite objects).
    number_of_nodes_per_root_node: usize,
}

impl Context {
    /// Create a hypercuboid context for point masses.
    pub fn hypercuboid(system_lengths: Vec<f64>, beta: f64) -> EcmcResult<Self> {
        Self::with_composites(system_lengths, beta, 1, 1)
    }

    /// Create a hypercubic context for point masses.
    pub fn hypercubic(dimension: usize, system_length: f64, beta: f64) -> EcmcResult<Self> {
        Self::hypercuboid(vec![system_length; dimension], beta)
    }

    /// Create a context whose global state contains composite objects.
    pub fn with_composites(
        system_lengths: Vec<f64>,
        beta: f64,
        number_of_node_levels: usize,
        number_of_nodes_per_root_node: usize,
    ) -> EcmcResult<Self> {
        if system_lengths.is_empty() {
            return Err(EcmcError::configuration(
                "the dimension of the context must be at least 1",
            ));
        }
        if system_lengths.iter().any(|length| !(*length > 0.0)) {
            return Err(EcmcError::configuration(format!(
                "all system lengths must be > 0.0, got {:?}",
                system_lengths
            )));
        }
        if !(beta > 0.0) {
            return Err(EcmcError::configuration(format!(
                "the inverse temperature beta must be > 0.0, got {}",
                beta
            )));
        }
        if number_of_node_levels == 0 || number_of_nodes_per_root_node == 0 {
            return Err(EcmcError::configuration(
                "the global state needs at least one node level and one node per root",
            ));
        }
        if number_of_node_levels == 1 && number_of_nodes_per_root_node != 1 {
            return Err(EcmcError::configuration(
                "point masses without composite objects have exactly one node per root",
            ));
        }
        Ok(Context {
            system_lengths,
            beta,
            number_of_node_levels,
            number_of_nodes_per_root_node,
        })
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.system_lengths.len()
    }

    #[inline]
    pub fn system_lengths(&self) -> &[f64] {
        &self.system_lengths
    }

    #[inline]
    pub fn system_length(&self, direction: usize) -> f64 {
        self.system_lengths[direction]
    }

    #[inline]
    pub fn beta(&self) -> f64 {
        self.beta
    }

    #[inline]
    pub fn number_of_node_levels(&self) -> usize {
        self.number_of_node_levels
    }

    #[inline]
    pub fn number_of_nodes_per_root_node(&self) -> usize {
        self.number_of_nodes_per_root_node
    }

    /// Wrap a single coordinate into `[0, L)`.
    #[inline]
    pub fn correct_position_entry(&self, entry: f64, direction: usize) -> f64 {
        let length = self.system_lengths[direction];
        let corrected = entry.rem_euclid(length);
        if corrected >= length {
            0.0
        } else {
            corrected
        }
    }

    pub fn correct_position(&self, position: &mut [f64]) {
        for (direction, entry) in position.iter_mut().enumerate() {
            *entry = self.correct_position_entry(*entry, direction);
        }
    }

    /// Wrap a separation into the nearest image, each entry in `[-L/2, L/2)`.
    pub fn correct_separation(&self, separation: &mut [f64]) {
        for (direction, entry) in separation.iter_mut().enumerate() {
            let length = self.system_lengths[direction];
            let half = length / 2.0;
            let mut corrected = (*entry + half).rem_euclid(length) - half;
            if corrected >= half {
                corrected -= length;
            }
            *entry = corrected;
        }
    }

    /// Nearest-image separation pointing from `from` to `to`.
    pub fn separation_vector(&self, from: &[f64], to: &[f64]) -> Vec<f64> {
        let mut separation: Vec<f64> = to.iter().zip(from).map(|(t, f)| t - f).collect();
        self.correct_separation(&mut separation);
        separation
    }
}
