//! Configuration for bound computation.

use serde::{Deserialize, Serialize};

/// Which side of a bound a backsubstitution pass computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Lower,
    Upper,
}

impl Side {
    #[inline]
    pub fn flip(self) -> Side {
        match self {
            Side::Lower => Side::Upper,
            Side::Upper => Side::Lower,
        }
    }
}

/// Lower-enclosure choice of the built-in ReLU relaxation for unstable neurons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReluLowerSlope {
    /// `y >= 0`.
    #[default]
    Zero,
    /// `y >= x` when `u > -l`, otherwise `y >= 0` (minimal-area choice).
    Area,
}

/// Configuration for the bound engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads for a layer pass.
    /// None means use rayon's default (typically number of cores).
    pub max_threads: Option<usize>,

    /// Minimum number of neurons before a layer pass goes parallel.
    /// Below this threshold the pass runs on the calling thread.
    pub min_neurons_for_parallel: usize,

    /// Lower enclosure used by the default ReLU relaxation.
    pub relu_lower: ReluLowerSlope,

    /// Walk the graph back to the input for every neuron. When false each
    /// neuron is only evaluated against its predecessors' bounds.
    pub backsubstitute: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_threads: None,
            min_neurons_for_parallel: 2,
            relu_lower: ReluLowerSlope::Zero,
            backsubstitute: true,
        }
    }
}
