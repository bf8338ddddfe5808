//! Backsubstitution engine.
//!
//! A bound expression is held as a [`Frontier`]: one affine expression per
//! anchor node plus a shared constant. Starting from an expression over some
//! layer's inputs, the engine repeatedly takes the anchor with the highest
//! node id and rewrites it through that layer's stored expressions:
//!
//! 1. every term `c · y_k` with `c == 0` is dropped;
//! 2. otherwise `y_k` is replaced by the neuron's lower or upper expression,
//!    chosen by the sign of `c` and the side being bounded (a neuron whose
//!    lower and upper expression are the same object is substituted
//!    directly); a coefficient whose interval straddles zero contributes
//!    `c · [lb_k, ub_k]` to the constant instead;
//! 3. the substituted sum lives in the layer's input space and is split
//!    back into per-predecessor expressions with the layer's offset table,
//!    then merged into the frontier.
//!
//! Because predecessors always have smaller ids, taking the highest anchor
//! first means each node is rewritten once per pass, and branches of a
//! residual block are merged at their common ancestor before it is
//! substituted. After every step the frontier is also evaluated against the
//! concrete bounds of its anchors and the tightest candidate is kept.

use crate::expr::LinExpr;
use crate::network::{locate_in, node_bound, InputRegion, Layer, Neuron, INPUT_NODE};
use crate::types::Side;
use delta_core::Interval;
use std::collections::BTreeMap;
use tracing::trace;

/// A bound expression spread over several anchor nodes.
#[derive(Debug, Clone, Default)]
pub(crate) struct Frontier {
    anchors: BTreeMap<usize, LinExpr>,
    cst: Interval,
}

impl Frontier {
    /// Frontier holding `expr` over the neurons of `node`.
    pub(crate) fn anchored(node: usize, expr: &LinExpr) -> Frontier {
        let mut frontier = Frontier::default();
        frontier.insert(node, expr.clone());
        frontier
    }

    /// Frontier for an expression over a layer's input space.
    pub(crate) fn over_inputs(predecessors: &[usize], offsets: &[usize], expr: &LinExpr) -> Frontier {
        let mut frontier = Frontier::default();
        split_into(predecessors, offsets, expr.clone(), &mut frontier);
        frontier
    }

    fn insert(&mut self, node: usize, mut expr: LinExpr) {
        self.cst += expr.cst();
        expr.set_cst(Interval::zero());
        match self.anchors.remove(&node) {
            Some(existing) => {
                self.anchors.insert(node, existing.add(&expr));
            }
            None => {
                self.anchors.insert(node, expr);
            }
        }
    }

    /// The input-anchored part with the constant folded in.
    fn into_input_expr(mut self) -> LinExpr {
        let mut expr = self
            .anchors
            .remove(&INPUT_NODE)
            .unwrap_or_else(|| LinExpr::constant(Interval::zero()));
        debug_assert!(self.anchors.is_empty());
        expr.set_cst(self.cst);
        expr
    }
}

/// Split an expression over a layer's input space into one expression per
/// predecessor and merge them into `frontier`.
fn split_into(predecessors: &[usize], offsets: &[usize], expr: LinExpr, frontier: &mut Frontier) {
    if predecessors.len() == 1 {
        frontier.insert(predecessors[0], expr);
        return;
    }

    frontier.cst += expr.cst();
    if expr.is_dense() {
        let coeffs = expr.coeffs();
        for (slot, &pred) in predecessors.iter().enumerate() {
            let start = offsets[slot].min(coeffs.len());
            let end = offsets[slot + 1].min(coeffs.len());
            if start < end {
                frontier.insert(
                    pred,
                    LinExpr::dense_intervals(coeffs[start..end].to_vec(), Interval::zero()),
                );
            }
        }
        return;
    }

    let mut groups: Vec<Vec<(usize, Interval)>> = vec![Vec::new(); predecessors.len()];
    for (k, c) in expr.terms() {
        if c.is_zero() {
            continue;
        }
        let (slot, local) = locate_in(offsets, k);
        groups[slot].push((local, c));
    }
    for (slot, terms) in groups.into_iter().enumerate() {
        if !terms.is_empty() {
            frontier.insert(
                predecessors[slot],
                LinExpr::from_sorted_terms(terms, Interval::zero()),
            );
        }
    }
}

/// Sum of scaled expressions over one input space.
///
/// Terms are collected as `(index, coefficient)` pairs and sorted once at
/// the end; when the pair list grows past the width of the space, or a
/// dense expression arrives, it switches to a dense coefficient vector.
struct Accumulator {
    width: usize,
    pairs: Vec<(usize, Interval)>,
    dense: Option<Vec<Interval>>,
    cst: Interval,
}

impl Accumulator {
    fn new(width: usize, cst: Interval) -> Self {
        Self {
            width,
            pairs: Vec::new(),
            dense: None,
            cst,
        }
    }

    fn densify(&mut self) {
        let mut dense = vec![Interval::zero(); self.width];
        for (k, c) in self.pairs.drain(..) {
            dense[k] += c;
        }
        self.dense = Some(dense);
    }

    /// `self += c · expr`.
    fn add_scaled(&mut self, c: Interval, expr: &LinExpr) {
        self.cst += c * expr.cst();
        if expr.is_dense() && self.dense.is_none() {
            self.densify();
        }
        match &mut self.dense {
            Some(dense) => {
                for (k, a) in expr.terms() {
                    if !a.is_zero() {
                        dense[k] += a * c;
                    }
                }
            }
            None => {
                if expr.len() == 1 {
                    // Single-term expressions (activations, identities) are
                    // one scale step.
                    let a = expr.coeffs()[0];
                    if !a.is_zero() {
                        self.pairs.push((expr.dim_at(0), a * c));
                    }
                } else {
                    self.pairs.extend(
                        expr.terms()
                            .filter(|(_, a)| !a.is_zero())
                            .map(|(k, a)| (k, a * c)),
                    );
                }
                if self.pairs.len() > self.width.max(16) {
                    self.densify();
                }
            }
        }
    }

    fn finish(mut self) -> LinExpr {
        if let Some(dense) = self.dense {
            return LinExpr::dense_intervals(dense, self.cst);
        }
        self.pairs.sort_by_key(|&(k, _)| k);
        let mut terms: Vec<(usize, Interval)> = Vec::with_capacity(self.pairs.len());
        for (k, c) in self.pairs {
            match terms.last_mut() {
                Some((last, acc)) if *last == k => *acc += c,
                _ => terms.push((k, c)),
            }
        }
        LinExpr::from_sorted_terms(terms, self.cst)
    }
}

/// Expression to substitute for `c · y` when bounding `side`, or `None`
/// when the neuron's concrete bound must be used.
#[inline]
fn pick(neuron: &Neuron, c: Interval, side: Side) -> Option<&LinExpr> {
    if neuron.is_linear() {
        return neuron.lexpr.as_deref();
    }
    let want = if c.is_nonneg() {
        side
    } else if c.is_nonpos() {
        side.flip()
    } else {
        return None;
    };
    match want {
        Side::Lower => neuron.lexpr.as_deref(),
        Side::Upper => neuron.uexpr.as_deref(),
    }
}

/// Result of one backsubstitution run.
#[derive(Debug, Clone)]
pub(crate) struct Outcome {
    /// Lower bound for `Side::Lower`, upper bound for `Side::Upper`.
    pub bound: f64,
    /// Final expression over the network input, when the run reached it.
    pub input_expr: Option<LinExpr>,
}

/// Read-only view of the graph used for one pass.
///
/// `layers` is the prefix of the layer list the run may touch; a frontier
/// must only anchor nodes inside it.
#[derive(Clone, Copy)]
pub(crate) struct Backsubstitution<'a> {
    pub input: &'a InputRegion,
    pub layers: &'a [Layer],
}

impl<'a> Backsubstitution<'a> {
    pub(crate) fn new(input: &'a InputRegion, layers: &'a [Layer]) -> Self {
        Self { input, layers }
    }

    fn frontier_bound(&self, frontier: &Frontier) -> Interval {
        let mut acc = frontier.cst;
        for (&node, expr) in &frontier.anchors {
            acc += expr.eval_with(|k| node_bound(self.input, self.layers, node, k));
        }
        acc
    }

    #[inline]
    fn tighter(side: Side, best: f64, candidate: Interval) -> f64 {
        match side {
            Side::Lower => best.max(candidate.lower()),
            Side::Upper => best.min(candidate.upper()),
        }
    }

    /// Rewrite `expr`, anchored at `node`, in terms of the node's
    /// predecessors.
    fn substitute(&self, node: usize, expr: &LinExpr, side: Side, frontier: &mut Frontier) {
        let layer = &self.layers[node - 1];
        let mut acc = Accumulator::new(layer.input_width(), expr.cst());
        for (k, c) in expr.terms() {
            if c.is_zero() {
                continue;
            }
            let neuron = &layer.neurons[k];
            match pick(neuron, c, side) {
                Some(replacement) => acc.add_scaled(c, replacement),
                None => acc.cst += c * neuron.bound,
            }
        }
        split_into(&layer.predecessors, &layer.offsets, acc.finish(), frontier);
    }

    /// Bound the frontier on `side`, substituting every anchor with id
    /// greater than `stop`. With `stop == INPUT_NODE` the run ends at the
    /// network input, where the symbolic input enclosure is applied if
    /// present.
    pub(crate) fn run(&self, mut frontier: Frontier, side: Side, stop: usize) -> Outcome {
        let mut best = match side {
            Side::Lower => f64::NEG_INFINITY,
            Side::Upper => f64::INFINITY,
        };
        best = Self::tighter(side, best, self.frontier_bound(&frontier));

        while let Some((node, expr)) = frontier.anchors.pop_last() {
            if node <= stop {
                frontier.anchors.insert(node, expr);
                break;
            }
            self.substitute(node, &expr, side, &mut frontier);
            let candidate = self.frontier_bound(&frontier);
            best = Self::tighter(side, best, candidate);
            trace!(
                "backsubstituted node {} ({:?}): candidate [{}, {}], best {}",
                node,
                side,
                candidate.lower(),
                candidate.upper(),
                best
            );
        }

        if stop != INPUT_NODE {
            return Outcome {
                bound: best,
                input_expr: None,
            };
        }

        let input_expr = frontier.into_input_expr();
        if let Some(enclosure) = &self.input.enclosure {
            let latent = self.through_enclosure(&input_expr, side);
            best = Self::tighter(side, best, latent.eval(&enclosure.latent));
        }
        Outcome {
            bound: best,
            input_expr: Some(input_expr),
        }
    }

    /// Substitute an expression over input pixels through the symbolic
    /// input enclosure, giving an expression over the latent box. Without an
    /// enclosure the expression is returned unchanged.
    pub(crate) fn through_enclosure(&self, expr: &LinExpr, side: Side) -> LinExpr {
        let Some(enclosure) = &self.input.enclosure else {
            return expr.clone();
        };
        let mut acc = Accumulator::new(enclosure.latent.len(), expr.cst());
        for (k, c) in expr.terms() {
            if c.is_zero() {
                continue;
            }
            let want = if c.is_nonneg() {
                side
            } else if c.is_nonpos() {
                side.flip()
            } else {
                acc.cst += c * self.input.bounds[k];
                continue;
            };
            let replacement = match want {
                Side::Lower => &enclosure.lower[k],
                Side::Upper => &enclosure.upper[k],
            };
            acc.add_scaled(c, replacement);
        }
        acc.finish()
    }
}
