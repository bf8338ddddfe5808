//! Directed rounding toward +∞ in software.
//!
//! Every primitive computes the round-to-nearest result and then inspects the
//! exact rounding error (TwoSum for addition, an FMA residual for
//! multiplication and division). When the nearest result lies below the
//! exact value the result is stepped one ulp up, which is exactly what an FPU
//! in round-toward-positive mode would have produced. No floating-point
//! environment state is read or written, so these functions are safe to call
//! from any number of threads.
//!
//! Conventions shared by all primitives:
//! - `0 · x = 0` for every `x`, including infinities. A zero coefficient means
//!   "no contribution" in bound arithmetic.
//! - `+∞ + (−∞) = +∞`. Results are upward-oriented magnitudes, so the
//!   conservative answer is `+∞`.
//! - A finite computation never rounds to `−∞`; it saturates at `−f64::MAX`.

/// Smallest `f64` strictly greater than `x`.
#[inline]
pub fn next_up(x: f64) -> f64 {
    if x.is_nan() || x == f64::INFINITY {
        return x;
    }
    if x == 0.0 {
        // Covers both +0.0 and -0.0.
        return f64::from_bits(1);
    }
    let bits = x.to_bits();
    if x > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

/// Largest `f64` strictly smaller than `x`.
#[inline]
pub fn next_down(x: f64) -> f64 {
    -next_up(-x)
}

/// `a + b` rounded toward +∞.
#[inline]
pub fn add_up(a: f64, b: f64) -> f64 {
    let s = a + b;
    if s.is_nan() {
        if a.is_infinite() || b.is_infinite() {
            return f64::INFINITY;
        }
        return s;
    }
    if s.is_infinite() {
        if s < 0.0 && a.is_finite() && b.is_finite() {
            return -f64::MAX;
        }
        return s;
    }
    // TwoSum: err is the exact value of (a + b) - s.
    let bb = s - a;
    let err = (a - (s - bb)) + (b - bb);
    if err > 0.0 {
        next_up(s)
    } else {
        s
    }
}

/// `a - b` rounded toward +∞.
#[inline]
pub fn sub_up(a: f64, b: f64) -> f64 {
    add_up(a, -b)
}

/// `a · b` rounded toward +∞.
#[inline]
pub fn mul_up(a: f64, b: f64) -> f64 {
    if a == 0.0 || b == 0.0 {
        return 0.0;
    }
    let p = a * b;
    if p.is_nan() {
        return p;
    }
    if p.is_infinite() {
        if p < 0.0 && a.is_finite() && b.is_finite() {
            return -f64::MAX;
        }
        return p;
    }
    if p.abs() < f64::MIN_POSITIVE {
        // The residual is not exact in the subnormal range.
        return next_up(p);
    }
    let err = a.mul_add(b, -p);
    if err > 0.0 {
        next_up(p)
    } else {
        p
    }
}

/// `a / b` rounded toward +∞.
///
/// Division by zero yields `+∞` unless the numerator is also zero, in which
/// case the quotient is taken as zero.
#[inline]
pub fn div_up(a: f64, b: f64) -> f64 {
    if a == 0.0 {
        return 0.0;
    }
    if b == 0.0 || b.is_nan() || a.is_nan() {
        return f64::INFINITY;
    }
    let q = a / b;
    if q.is_nan() {
        // ±∞ / ±∞
        return f64::INFINITY;
    }
    if q.is_infinite() {
        if q < 0.0 && a.is_finite() {
            return -f64::MAX;
        }
        return q;
    }
    if q.abs() < f64::MIN_POSITIVE {
        return next_up(q);
    }
    // r = a - q·b exactly; the exact quotient is q + r / b.
    let r = (-q).mul_add(b, a);
    if r != 0.0 && ((r > 0.0) == (b > 0.0)) {
        next_up(q)
    } else {
        q
    }
}

/// `a + b` rounded toward −∞.
#[inline]
pub fn add_down(a: f64, b: f64) -> f64 {
    -add_up(-a, -b)
}

/// `a · b` rounded toward −∞.
#[inline]
pub fn mul_down(a: f64, b: f64) -> f64 {
    -mul_up(-a, b)
}

/// `a / b` rounded toward −∞.
#[inline]
pub fn div_down(a: f64, b: f64) -> f64 {
    -div_up(-a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_next_up_edges() {
        assert_eq!(next_up(0.0), f64::from_bits(1));
        assert_eq!(next_up(-0.0), f64::from_bits(1));
        assert_eq!(next_up(f64::INFINITY), f64::INFINITY);
        assert_eq!(next_up(f64::NEG_INFINITY), -f64::MAX);
        assert_eq!(next_up(-f64::from_bits(1)), -0.0);
        assert!(next_up(1.0) > 1.0);
        assert_eq!(next_down(1.0), 1.0 - f64::EPSILON / 2.0);
    }

    #[test]
    fn test_exact_results_are_not_bumped() {
        assert_eq!(add_up(1.0, 2.0), 3.0);
        assert_eq!(mul_up(3.0, -4.0), -12.0);
        assert_eq!(div_up(1.0, 4.0), 0.25);
        assert_eq!(sub_up(1.0, 1.0), 0.0);
    }

    #[test]
    fn test_inexact_results_round_up() {
        let tiny = 2f64.powi(-60);
        assert!(add_up(1.0, tiny) > 1.0);
        assert_eq!(add_down(1.0, tiny), 1.0);
        let third_up = div_up(1.0, 3.0);
        let third_down = div_down(1.0, 3.0);
        assert!(third_down < third_up);
        assert_eq!(next_up(third_down), third_up);
    }

    #[test]
    fn test_zero_times_infinity_is_zero() {
        assert_eq!(mul_up(0.0, f64::INFINITY), 0.0);
        assert_eq!(mul_up(f64::NEG_INFINITY, 0.0), 0.0);
    }

    #[test]
    fn test_opposite_infinities_add_to_plus_infinity() {
        assert_eq!(add_up(f64::INFINITY, f64::NEG_INFINITY), f64::INFINITY);
        assert_eq!(add_up(f64::NEG_INFINITY, 1.0), f64::NEG_INFINITY);
    }

    #[test]
    fn test_finite_overflow_toward_minus_infinity_saturates() {
        assert_eq!(add_up(-f64::MAX, -f64::MAX), -f64::MAX);
        assert_eq!(mul_up(-f64::MAX, 2.0), -f64::MAX);
        assert_eq!(add_up(f64::MAX, f64::MAX), f64::INFINITY);
    }

    proptest! {
        #[test]
        fn prop_add_up_brackets_exact_sum(a in -1e12f64..1e12, b in -1e12f64..1e12) {
            let up = add_up(a, b);
            let down = add_down(a, b);
            prop_assert!(down <= up);
            // The nearest sum lies in [down, up] and they are at most one ulp apart.
            let s = a + b;
            prop_assert!(down <= s && s <= up);
            prop_assert!(up == down || next_up(down) == up);
        }

        #[test]
        fn prop_mul_up_brackets_exact_product(a in -1e6f64..1e6, b in -1e6f64..1e6) {
            let up = mul_up(a, b);
            let down = mul_down(a, b);
            prop_assert!(down <= a * b && a * b <= up);
            prop_assert!(up == down || next_up(down) == up);
        }

        #[test]
        fn prop_div_up_brackets_exact_quotient(a in -1e6f64..1e6, b in 1e-3f64..1e6) {
            let up = div_up(a, b);
            let down = div_down(a, b);
            prop_assert!(down <= a / b && a / b <= up);
            prop_assert!(up == down || next_up(down) == up);
        }
    }
}
