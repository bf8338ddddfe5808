//! Symbolic bound propagation for feed-forward and convolutional networks.
//!
//! A [`Network`] is built one layer per operator. Every neuron stores a
//! lower and an upper affine expression over its layer's inputs (exact for
//! affine operators, a linear enclosure for activations), and each new layer
//! is immediately bounded by backsubstituting those expressions back to the
//! network input. All arithmetic uses directed rounding, so every bound is
//! sound in floating point.
//!
//! # Example
//! ```ignore
//! use delta_propagate::{Bound, Network};
//! use ndarray::arr2;
//!
//! let mut net = Network::from_input_box(&[Bound::new(0.0, 1.0), Bound::new(0.0, 1.0)])?;
//! let fc = net.add_fully_connected(arr2(&[[1.0, -1.0]]).view(), &[0.0], &[0])?;
//! let relu = net.add_relu(&[fc + 1])?;
//! let out = net.box_for_neuron(relu, 0)?;
//! ```
//!
//! Predecessor lists passed to the handlers use node ids: `0` is the
//! network input and `i + 1` is the layer returned as index `i`.

mod backsub;
pub mod expr;
pub mod layers;
pub mod network;
pub mod parallel;
pub mod query;
pub mod relaxation;
pub mod types;

pub use expr::LinExpr;
pub use layers::{ConvGeometry, Padding};
pub use network::{
    InputEnclosure, InputRegion, Layer, LayerKind, Network, Neuron, SpatialConstraints, INPUT_NODE,
};
pub use parallel::worker_count;
pub use relaxation::{ActivationRelaxation, Enclosure, ReluRelaxation};
pub use types::{EngineConfig, ReluLowerSlope, Side};

pub use delta_core::{Bound, DeltaError, Interval, Result};

#[cfg(test)]
mod tests;
