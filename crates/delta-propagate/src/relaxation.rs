//! Linear enclosures of activation functions.
//!
//! An activation neuron is replaced by a lower and an upper affine
//! expression over its single pre-activation neuron. The coefficients are
//! chosen by a pluggable [`ActivationRelaxation`] policy from the incoming
//! neuron's current bound; the engine only relies on the enclosure being
//! sound over that bound.

use crate::expr::LinExpr;
use crate::types::ReluLowerSlope;
use delta_core::rounding::{add_down, add_up, div_down, div_up};
use delta_core::Interval;

/// Enclosure of one activation neuron.
#[derive(Debug, Clone, PartialEq)]
pub enum Enclosure {
    /// The activation is exactly affine on the incoming bound; lower and
    /// upper expression are shared.
    Linear { expr: LinExpr, bound: Interval },
    /// Distinct lower and upper expressions.
    Relaxed {
        lower: LinExpr,
        upper: LinExpr,
        bound: Interval,
    },
}

impl Enclosure {
    /// Concrete bound of the activation output.
    pub fn bound(&self) -> Interval {
        match self {
            Enclosure::Linear { bound, .. } | Enclosure::Relaxed { bound, .. } => *bound,
        }
    }
}

/// Policy producing sound linear enclosures of an activation function.
pub trait ActivationRelaxation: Send + Sync + std::fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Enclosure for output neuron `index`, whose pre-activation value lies
    /// in `input`. The returned expressions must reference only dimension
    /// `index` of the predecessor.
    fn enclose(&self, index: usize, input: Interval) -> Enclosure;

    /// Concrete evaluation of the activation, used by tests and callers that
    /// sample the network.
    fn eval(&self, x: f64) -> f64;
}

/// Triangle relaxation of ReLU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReluRelaxation {
    pub lower: ReluLowerSlope,
}

impl ReluRelaxation {
    pub fn new(lower: ReluLowerSlope) -> Self {
        Self { lower }
    }
}

impl ActivationRelaxation for ReluRelaxation {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn enclose(&self, index: usize, input: Interval) -> Enclosure {
        let l = input.lower();
        let u = input.upper();

        if l >= 0.0 {
            return Enclosure::Linear {
                expr: LinExpr::unit(index, 1.0),
                bound: input,
            };
        }
        if u <= 0.0 {
            return Enclosure::Linear {
                expr: LinExpr::unit(index, 0.0),
                bound: Interval::zero(),
            };
        }

        let bound = Interval::new(0.0, u);
        let lower = match self.lower {
            ReluLowerSlope::Area if u > -l => LinExpr::unit(index, 1.0),
            _ => LinExpr::unit(index, 0.0),
        };

        let upper = if l.is_infinite() {
            // No finite secant; the output never exceeds max(0, u).
            let mut expr = LinExpr::unit(index, 0.0);
            expr.set_cst(Interval::point(u));
            expr
        } else if u.is_infinite() {
            // y <= x - l holds for every x >= l.
            let mut expr = LinExpr::unit(index, 1.0);
            expr.set_cst(Interval::point(-l));
            expr
        } else {
            // Secant through (l, 0) and (u, u): slope u / (u - l), intercept
            // -slope * l. Both are kept as intervals enclosing the exact
            // values, so the expression contains the exact secant.
            let width_up = add_up(u, input.inf);
            let width_down = add_down(u, input.inf);
            let slope = Interval::new(div_down(u, width_up), div_up(u, width_down));
            let mut expr = LinExpr::sparse(vec![slope], vec![index], Interval::zero());
            expr.set_cst(slope * Interval::point(input.inf));
            expr
        };

        Enclosure::Relaxed {
            lower,
            upper,
            bound,
        }
    }

    fn eval(&self, x: f64) -> f64 {
        x.max(0.0)
    }
}
