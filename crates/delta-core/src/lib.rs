//! Core types for δ-poly bound propagation.
//!
//! This crate provides the numeric foundation shared by the propagation
//! engine: software directed rounding, directed intervals, the caller-facing
//! [`Bound`] type and the error type.

pub mod interval;
pub mod rounding;

pub use interval::Interval;

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use thiserror::Error;

/// A bound on a scalar value: [lower, upper].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub lower: f64,
    pub upper: f64,
}

impl Bound {
    /// Create a new bound.
    #[inline]
    pub fn new(lower: f64, upper: f64) -> Self {
        debug_assert!(!(lower > upper), "Invalid bound: {lower} > {upper}");
        Self { lower, upper }
    }

    /// Create a concrete (point) bound.
    #[inline]
    pub fn concrete(value: f64) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }

    /// Check if this bound contains a value.
    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// Width of the bound interval.
    #[inline]
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// Check if bounds have exploded to infinity.
    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.lower.is_infinite() || self.upper.is_infinite()
    }

    /// Check that the bound is usable as an input region: no NaN, lower <= upper.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.lower.is_nan() && !self.upper.is_nan() && self.lower <= self.upper
    }
}

impl From<RangeInclusive<f64>> for Bound {
    fn from(range: RangeInclusive<f64>) -> Self {
        Self::new(*range.start(), *range.end())
    }
}

impl From<Interval> for Bound {
    fn from(itv: Interval) -> Self {
        Self {
            lower: itv.lower(),
            upper: itv.upper(),
        }
    }
}

impl From<Bound> for Interval {
    fn from(bound: Bound) -> Self {
        Interval::from_directed(-bound.lower, bound.upper)
    }
}

/// Errors reported by the propagation engine.
///
/// Every variant is a contract violation by the caller; the engine never
/// produces an unsound bound in place of an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeltaError {
    #[error("Layer {layer} does not exist ({num_layers} layers)")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    #[error("Neuron {neuron} does not exist in layer {layer} ({size} neurons)")]
    NeuronOutOfRange {
        layer: usize,
        neuron: usize,
        size: usize,
    },

    #[error("Predecessor {predecessor} is not an existing node ({num_nodes} nodes)")]
    PredecessorOutOfRange {
        predecessor: usize,
        num_nodes: usize,
    },

    #[error("{op} expects {expected} predecessor(s), got {got}")]
    Arity {
        op: &'static str,
        expected: String,
        got: usize,
    },

    #[error("{op}: shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Layer {layer} is not an activation layer")]
    NotActivation { layer: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to create thread pool: {0}")]
    ThreadPool(String),
}

impl DeltaError {
    /// Create a ShapeMismatch error. Identical shapes indicate a bug in the caller.
    #[track_caller]
    pub fn shape_mismatch(op: &'static str, expected: Vec<usize>, got: Vec<usize>) -> Self {
        debug_assert!(
            expected != got,
            "ShapeMismatch created with identical shapes: {expected:?}"
        );
        DeltaError::ShapeMismatch { op, expected, got }
    }
}

pub type Result<T> = std::result::Result<T, DeltaError>;
