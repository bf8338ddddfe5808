//! Directed intervals.
//!
//! An [`Interval`] stores the pair `(−lower, upper)`. Both fields are
//! upward-oriented magnitudes, so every operation only ever needs rounding
//! toward +∞: the lower side is computed as a negated quantity rounded up and
//! the upper side directly rounded up. A value is never rounded once and then
//! negated to obtain the other side.

use crate::rounding::{add_up, mul_up};
use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Neg};

/// Directed interval `[-inf, sup]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    /// Negated lower bound.
    pub inf: f64,
    /// Upper bound.
    pub sup: f64,
}

impl Interval {
    /// Interval from its natural `[lower, upper]` form.
    #[inline]
    pub fn new(lower: f64, upper: f64) -> Self {
        debug_assert!(
            !(lower > upper),
            "Invalid interval: [{lower}, {upper}]"
        );
        Self {
            inf: -lower,
            sup: upper,
        }
    }

    /// Interval from its stored directed form.
    #[inline]
    pub const fn from_directed(inf: f64, sup: f64) -> Self {
        Self { inf, sup }
    }

    /// Degenerate interval `[c, c]`.
    #[inline]
    pub fn point(c: f64) -> Self {
        Self { inf: -c, sup: c }
    }

    #[inline]
    pub const fn zero() -> Self {
        Self { inf: 0.0, sup: 0.0 }
    }

    /// `[-∞, +∞]`.
    #[inline]
    pub const fn top() -> Self {
        Self {
            inf: f64::INFINITY,
            sup: f64::INFINITY,
        }
    }

    #[inline]
    pub fn lower(&self) -> f64 {
        -self.inf
    }

    #[inline]
    pub fn upper(&self) -> f64 {
        self.sup
    }

    /// True when both sides are exactly zero.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.inf == 0.0 && self.sup == 0.0
    }

    /// True when every value in the interval is `>= 0`.
    #[inline]
    pub fn is_nonneg(&self) -> bool {
        self.inf <= 0.0
    }

    /// True when every value in the interval is `<= 0`.
    #[inline]
    pub fn is_nonpos(&self) -> bool {
        self.sup <= 0.0
    }

    /// True when either side is infinite.
    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.inf.is_infinite() || self.sup.is_infinite()
    }

    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        -self.inf <= value && value <= self.sup
    }

    /// True when `other` lies inside `self`.
    #[inline]
    pub fn encloses(&self, other: &Interval) -> bool {
        other.inf <= self.inf && other.sup <= self.sup
    }

    /// Upper bound on the width, rounded up.
    #[inline]
    pub fn width(&self) -> f64 {
        add_up(self.sup, self.inf)
    }

    /// Intersection. The result may be empty (`lower > upper`) when the
    /// operands are disjoint; callers comparing sound bounds of the same
    /// quantity never see that case.
    #[inline]
    pub fn meet(&self, other: &Interval) -> Interval {
        Interval {
            inf: self.inf.min(other.inf),
            sup: self.sup.min(other.sup),
        }
    }

    /// Convex hull.
    #[inline]
    pub fn join(&self, other: &Interval) -> Interval {
        Interval {
            inf: self.inf.max(other.inf),
            sup: self.sup.max(other.sup),
        }
    }

    /// Product with a scalar.
    #[inline]
    pub fn scale(&self, c: f64) -> Interval {
        *self * Interval::point(c)
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::zero()
    }
}

impl Neg for Interval {
    type Output = Interval;

    #[inline]
    fn neg(self) -> Interval {
        Interval {
            inf: self.sup,
            sup: self.inf,
        }
    }
}

impl Add for Interval {
    type Output = Interval;

    #[inline]
    fn add(self, rhs: Interval) -> Interval {
        Interval {
            inf: add_up(self.inf, rhs.inf),
            sup: add_up(self.sup, rhs.sup),
        }
    }
}

impl std::ops::AddAssign for Interval {
    #[inline]
    fn add_assign(&mut self, rhs: Interval) {
        *self = *self + rhs;
    }
}

impl Mul for Interval {
    type Output = Interval;

    /// Interval product. Each of the four endpoint products is rounded up
    /// twice independently: once as `-(x·y)` for the lower side, once as
    /// `x·y` for the upper side.
    #[inline]
    fn mul(self, rhs: Interval) -> Interval {
        let (al, au) = (-self.inf, self.sup);
        let (bl, bu) = (-rhs.inf, rhs.sup);

        if self.is_zero() || rhs.is_zero() {
            return Interval::zero();
        }

        let sup = mul_up(al, bl)
            .max(mul_up(al, bu))
            .max(mul_up(au, bl))
            .max(mul_up(au, bu));
        let inf = mul_up(self.inf, bl)
            .max(mul_up(self.inf, bu))
            .max(mul_up(-au, bl))
            .max(mul_up(-au, bu));
        Interval { inf, sup }
    }
}
