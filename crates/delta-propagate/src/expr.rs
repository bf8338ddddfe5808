//! Affine expressions with interval coefficients.
//!
//! A [`LinExpr`] represents `Σ coeff_i · x_{dim_i} + cst` where every
//! coefficient and the constant are directed [`Interval`]s. Two layouts exist:
//! - dense: `dim_i = i`, one slot per dimension of the anchor;
//! - sparse: an explicit index list, kept strictly increasing and
//!   duplicate-free so that two expressions can be merged in linear time.
//!
//! All arithmetic goes through the directed-rounding `Interval` operations,
//! so every result is a sound over-approximation.

use delta_core::Interval;

/// Affine form over the neurons of one anchor node.
#[derive(Debug, Clone, PartialEq)]
pub struct LinExpr {
    coeff: Vec<Interval>,
    /// `None` for dense expressions.
    dim: Option<Vec<usize>>,
    cst: Interval,
}

impl LinExpr {
    /// Expression with no terms.
    pub fn constant(cst: Interval) -> Self {
        Self {
            coeff: Vec::new(),
            dim: Some(Vec::new()),
            cst,
        }
    }

    /// Dense expression from scalar weights.
    pub fn dense(weights: &[f64], cst: f64) -> Self {
        Self {
            coeff: weights.iter().map(|&w| Interval::point(w)).collect(),
            dim: None,
            cst: Interval::point(cst),
        }
    }

    /// Dense expression from interval coefficients.
    pub fn dense_intervals(coeff: Vec<Interval>, cst: Interval) -> Self {
        Self {
            coeff,
            dim: None,
            cst,
        }
    }

    /// Sparse expression. The index list is sorted and duplicate indices are
    /// summed, so the result is canonical whatever order the caller used.
    pub fn sparse(coeff: Vec<Interval>, dim: Vec<usize>, cst: Interval) -> Self {
        assert_eq!(
            coeff.len(),
            dim.len(),
            "sparse expression needs one index per coefficient"
        );
        let mut expr = Self {
            coeff,
            dim: Some(dim),
            cst,
        };
        expr.canonicalize();
        expr
    }

    /// Sparse expression from scalar coefficients.
    pub fn sparse_scalars(coeff: &[f64], dim: &[usize], cst: f64) -> Self {
        Self::sparse(
            coeff.iter().map(|&c| Interval::point(c)).collect(),
            dim.to_vec(),
            Interval::point(cst),
        )
    }

    /// `coeff · x_dim`.
    pub fn unit(dim: usize, coeff: f64) -> Self {
        Self {
            coeff: vec![Interval::point(coeff)],
            dim: Some(vec![dim]),
            cst: Interval::zero(),
        }
    }

    /// Build from already sorted, duplicate-free `(index, coefficient)` pairs.
    pub(crate) fn from_sorted_terms(terms: Vec<(usize, Interval)>, cst: Interval) -> Self {
        debug_assert!(terms.windows(2).all(|w| w[0].0 < w[1].0));
        let (dim, coeff) = terms.into_iter().unzip();
        Self {
            coeff,
            dim: Some(dim),
            cst,
        }
    }

    fn canonicalize(&mut self) {
        let Some(dim) = self.dim.as_mut() else {
            return;
        };
        if dim.windows(2).all(|w| w[0] < w[1]) {
            return;
        }
        let mut terms: Vec<(usize, Interval)> =
            dim.drain(..).zip(self.coeff.drain(..)).collect();
        terms.sort_by_key(|&(d, _)| d);
        for (d, c) in terms {
            if dim.last() == Some(&d) {
                if let Some(slot) = self.coeff.last_mut() {
                    *slot += c;
                }
            } else {
                dim.push(d);
                self.coeff.push(c);
            }
        }
    }

    /// Number of coefficient slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.coeff.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.coeff.is_empty()
    }

    #[inline]
    pub fn is_dense(&self) -> bool {
        self.dim.is_none()
    }

    #[inline]
    pub fn cst(&self) -> Interval {
        self.cst
    }

    #[inline]
    pub fn set_cst(&mut self, cst: Interval) {
        self.cst = cst;
    }

    #[inline]
    pub fn coeffs(&self) -> &[Interval] {
        &self.coeff
    }

    /// Index list of a sparse expression.
    #[inline]
    pub fn dims(&self) -> Option<&[usize]> {
        self.dim.as_deref()
    }

    /// Index of the `i`-th slot.
    #[inline]
    pub fn dim_at(&self, i: usize) -> usize {
        match &self.dim {
            Some(dim) => dim[i],
            None => i,
        }
    }

    /// `(index, coefficient)` for every slot, in increasing index order.
    pub fn terms(&self) -> impl Iterator<Item = (usize, Interval)> + '_ {
        self.coeff
            .iter()
            .enumerate()
            .map(move |(i, &c)| (self.dim_at(i), c))
    }

    /// Largest index referenced, if any.
    pub fn max_dim(&self) -> Option<usize> {
        match &self.dim {
            Some(dim) => dim.last().copied(),
            None => self.coeff.len().checked_sub(1),
        }
    }

    /// Sparse index list strictly increasing.
    pub fn is_canonical(&self) -> bool {
        self.dim
            .as_ref()
            .map_or(true, |dim| dim.windows(2).all(|w| w[0] < w[1]))
    }

    pub fn neg(&self) -> LinExpr {
        LinExpr {
            coeff: self.coeff.iter().map(|&c| -c).collect(),
            dim: self.dim.clone(),
            cst: -self.cst,
        }
    }

    /// `c · self`.
    pub fn scale(&self, c: Interval) -> LinExpr {
        LinExpr {
            coeff: self.coeff.iter().map(|&a| a * c).collect(),
            dim: self.dim.clone(),
            cst: self.cst * c,
        }
    }

    /// Add `c` to the constant.
    #[inline]
    pub fn shift(&mut self, c: Interval) {
        self.cst += c;
    }

    /// Sum of two expressions over the same anchor.
    ///
    /// Sparse + sparse merges the index lists; any dense operand makes the
    /// result dense.
    pub fn add(&self, other: &LinExpr) -> LinExpr {
        let cst = self.cst + other.cst;
        match (&self.dim, &other.dim) {
            (Some(da), Some(db)) => {
                debug_assert!(self.is_canonical() && other.is_canonical());
                let mut dim = Vec::with_capacity(da.len() + db.len());
                let mut coeff = Vec::with_capacity(da.len() + db.len());
                let (mut i, mut j) = (0, 0);
                while i < da.len() && j < db.len() {
                    if da[i] < db[j] {
                        dim.push(da[i]);
                        coeff.push(self.coeff[i]);
                        i += 1;
                    } else if db[j] < da[i] {
                        dim.push(db[j]);
                        coeff.push(other.coeff[j]);
                        j += 1;
                    } else {
                        dim.push(da[i]);
                        coeff.push(self.coeff[i] + other.coeff[j]);
                        i += 1;
                        j += 1;
                    }
                }
                dim.extend_from_slice(&da[i..]);
                coeff.extend_from_slice(&self.coeff[i..]);
                dim.extend_from_slice(&db[j..]);
                coeff.extend_from_slice(&other.coeff[j..]);
                LinExpr {
                    coeff,
                    dim: Some(dim),
                    cst,
                }
            }
            _ => {
                let width = self
                    .max_dim()
                    .max(other.max_dim())
                    .map_or(0, |d| d + 1);
                let mut coeff = vec![Interval::zero(); width];
                for (d, c) in self.terms().chain(other.terms()) {
                    coeff[d] += c;
                }
                LinExpr {
                    coeff,
                    dim: None,
                    cst,
                }
            }
        }
    }

    /// Evaluate against the bound of every dimension.
    pub fn eval_with(&self, bound: impl Fn(usize) -> Interval) -> Interval {
        let mut acc = self.cst;
        for (d, c) in self.terms() {
            if c.is_zero() {
                continue;
            }
            acc += c * bound(d);
        }
        acc
    }

    /// Evaluate against a box. Panics if an index is outside the box.
    pub fn eval(&self, bounds: &[Interval]) -> Interval {
        self.eval_with(|d| bounds[d])
    }
}
