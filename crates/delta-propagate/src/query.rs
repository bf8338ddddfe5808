//! Query and mutation API.
//!
//! Layers are addressed by their 0-based position in the layer list (the
//! network input is not a layer). Every index is validated; a rejected call
//! logs a warning and returns an error without touching the state.

use crate::backsub::{Backsubstitution, Frontier};
use crate::expr::LinExpr;
use crate::network::{rejected, LayerKind, Network, Neuron, INPUT_NODE};
use crate::parallel;
use crate::types::Side;
use delta_core::{Bound, DeltaError, Interval, Result};
use tracing::{debug, info};

fn input_bounds(bounds: &[Bound], expected: usize) -> Result<Vec<Interval>> {
    if bounds.len() != expected {
        return Err(rejected(DeltaError::shape_mismatch(
            "input box",
            vec![expected],
            vec![bounds.len()],
        )));
    }
    bounds
        .iter()
        .enumerate()
        .map(|(i, b)| {
            if b.is_valid() {
                Ok(Interval::from(*b))
            } else {
                Err(rejected(DeltaError::InvalidInput(format!(
                    "bound {i} is not an interval: [{}, {}]",
                    b.lower, b.upper
                ))))
            }
        })
        .collect()
}

impl Network {
    /// Number of neurons in `layer`.
    pub fn num_neurons(&self, layer: usize) -> Result<usize> {
        Ok(self.layer(layer)?.len())
    }

    /// Neuron `neuron` of `layer`.
    pub fn neuron(&self, layer: usize, neuron: usize) -> Result<&Neuron> {
        let l = self.layer(layer)?;
        l.neurons.get(neuron).ok_or_else(|| {
            rejected(DeltaError::NeuronOutOfRange {
                layer,
                neuron,
                size: l.len(),
            })
        })
    }

    fn neuron_mut(&mut self, layer: usize, neuron: usize) -> Result<&mut Neuron> {
        let l = self.layer_mut(layer)?;
        let size = l.len();
        l.neurons
            .get_mut(neuron)
            .ok_or_else(|| rejected(DeltaError::NeuronOutOfRange { layer, neuron, size }))
    }

    /// Concrete bound of one neuron.
    pub fn box_for_neuron(&self, layer: usize, neuron: usize) -> Result<Bound> {
        Ok(self.neuron(layer, neuron)?.bound().into())
    }

    /// Concrete bounds of every neuron of `layer`.
    pub fn box_for_layer(&self, layer: usize) -> Result<Vec<Bound>> {
        Ok(self
            .layer(layer)?
            .neurons
            .iter()
            .map(|n| n.bound().into())
            .collect())
    }

    /// Index of the last layer.
    pub fn output_layer(&self) -> Result<usize> {
        self.layers.len().checked_sub(1).ok_or_else(|| {
            rejected(DeltaError::InvalidInput(
                "network has no layers".to_string(),
            ))
        })
    }

    fn activation_layer(&self, layer: usize) -> Result<()> {
        if self.layer(layer)?.is_activation() {
            Ok(())
        } else {
            Err(rejected(DeltaError::NotActivation { layer }))
        }
    }

    /// Input-space expressions of every neuron of `layer` from the last
    /// bound pass.
    ///
    /// For activation layers the expression is composed from the
    /// predecessor's expression by one scale/shift step with the neuron's
    /// own coefficient. Neurons without a stored expression (bounded without
    /// backsubstitution, or layers that copy their bounds) are
    /// backsubstituted on demand.
    pub fn backsubstituted_exprs_for_layer(&self, layer: usize, side: Side) -> Result<Vec<LinExpr>> {
        let l = self.layer(layer)?;
        let engine = Backsubstitution::new(&self.input, &self.layers);

        if l.is_activation() {
            let pred = l.predecessors[0];
            return Ok(l
                .neurons
                .iter()
                .enumerate()
                .map(|(i, neuron)| self.compose_activation(&engine, pred, i, neuron, side))
                .collect());
        }

        Ok((0..l.len())
            .map(|i| self.input_expr_for(&engine, layer, i, side))
            .collect())
    }

    /// Scratch expression of a node's neuron, computing it when absent.
    fn input_expr_for(
        &self,
        engine: &Backsubstitution<'_>,
        layer: usize,
        i: usize,
        side: Side,
    ) -> LinExpr {
        let l = &self.layers[layer];
        let neuron = &l.neurons[i];
        if let Some(expr) = neuron.backsubstituted(side) {
            return expr.clone();
        }
        let expr = match side {
            Side::Lower => neuron.lexpr.as_deref(),
            Side::Upper => neuron.uexpr.as_deref(),
        };
        let Some(expr) = expr else {
            return LinExpr::constant(neuron.bound());
        };
        let frontier = Frontier::over_inputs(&l.predecessors, &l.offsets, expr);
        engine
            .run(frontier, side, INPUT_NODE)
            .input_expr
            .unwrap_or_else(|| LinExpr::constant(neuron.bound()))
    }

    fn compose_activation(
        &self,
        engine: &Backsubstitution<'_>,
        pred: usize,
        i: usize,
        neuron: &Neuron,
        side: Side,
    ) -> LinExpr {
        let expr = match side {
            Side::Lower => neuron.lexpr.as_deref(),
            Side::Upper => neuron.uexpr.as_deref(),
        };
        let Some(expr) = expr else {
            return LinExpr::constant(neuron.bound());
        };
        let coeff = expr
            .terms()
            .find(|&(d, _)| d == i)
            .map_or(Interval::zero(), |(_, c)| c);
        if coeff.is_zero() {
            return LinExpr::constant(expr.cst());
        }
        let pred_side = if coeff.is_nonneg() {
            side
        } else if coeff.is_nonpos() {
            side.flip()
        } else {
            return LinExpr::constant(coeff * self.node_bound(pred, i) + expr.cst());
        };
        let pred_expr = if pred == INPUT_NODE {
            LinExpr::unit(i, 1.0)
        } else {
            self.input_expr_for(engine, pred - 1, i, pred_side)
        };
        let mut composed = pred_expr.scale(coeff);
        composed.shift(expr.cst());
        composed
    }

    /// Expression of an output neuron over the network input, with the
    /// symbolic input enclosure substituted when present. The result is over
    /// the latent box in that case, and over input pixels otherwise.
    pub fn output_expr(&self, neuron: usize, side: Side) -> Result<LinExpr> {
        let layer = self.output_layer()?;
        self.neuron(layer, neuron)?;
        let engine = Backsubstitution::new(&self.input, &self.layers);
        let expr = self.input_expr_for(&engine, layer, neuron, side);
        Ok(engine.through_enclosure(&expr, side))
    }

    fn output_difference(&self, y: usize, x: usize) -> Result<f64> {
        let layer = self.output_layer()?;
        self.neuron(layer, y)?;
        self.neuron(layer, x)?;
        let expr = LinExpr::sparse_scalars(&[1.0, -1.0], &[y, x], 0.0);
        let engine = Backsubstitution::new(&self.input, &self.layers);
        let stop = if self.config.backsubstitute {
            INPUT_NODE
        } else {
            usize::MAX
        };
        Ok(engine
            .run(Frontier::anchored(layer + 1, &expr), Side::Lower, stop)
            .bound)
    }

    /// True when output `y` is provably greater than output `x` over the
    /// whole input region.
    pub fn is_greater(&self, y: usize, x: usize) -> Result<bool> {
        let lb = self.output_difference(y, x)?;
        debug!("is_greater({}, {}): lower bound of difference {}", y, x, lb);
        Ok(lb > 0.0)
    }

    /// Lower bound of `y - x` over the output layer.
    pub fn label_deviation_lb(&self, y: usize, x: usize) -> Result<f64> {
        self.output_difference(y, x)
    }

    /// Upper bound of each expression over the neurons of `layer`, computed
    /// in parallel.
    pub fn upper_bounds_for_exprs(&self, layer: usize, exprs: &[LinExpr]) -> Result<Vec<f64>> {
        let width = self.layer(layer)?.len();
        if let Some(bad) = exprs.iter().find(|e| e.max_dim().is_some_and(|d| d >= width)) {
            return Err(rejected(DeltaError::InvalidInput(format!(
                "expression references neuron {} of a {width}-neuron layer",
                bad.max_dim().unwrap_or_default()
            ))));
        }
        parallel::upper_bounds_for_exprs(&self.input, &self.layers, &self.config, layer + 1, exprs)
    }

    /// Replace the input box.
    ///
    /// A box inside the current one keeps every computed bound (they remain
    /// sound, and a following [`run_bound_pass`](Self::run_bound_pass) only
    /// tightens them). Any other box clears all neuron bounds and relaxes
    /// every unpinned activation neuron over an unbounded input, so queries
    /// stay sound until the next bound pass.
    pub fn set_input_box(&mut self, bounds: &[Bound]) -> Result<()> {
        let bounds = input_bounds(bounds, self.input.num_pixels())?;
        let shrinks = self
            .input
            .bounds
            .iter()
            .zip(&bounds)
            .all(|(old, new)| old.encloses(new));
        self.input.bounds = bounds;
        if !shrinks {
            debug!("Input box widened; clearing neuron bounds");
            self.clear_layer_bounds();
        }
        Ok(())
    }

    /// Reset every neuron bound and rebuild activation enclosures against the
    /// reset bounds. Enclosures derived from the old bounds would no longer
    /// be sound once the input box grows.
    fn clear_layer_bounds(&mut self) {
        for layer in &mut self.layers {
            for neuron in &mut layer.neurons {
                neuron.reset_bound();
            }
        }
        for idx in 0..self.layers.len() {
            self.relax_activation_layer(idx);
        }
    }

    /// Reset every neuron bound to `[-∞, +∞]` and the input box to the one
    /// the network was created with. Activation neurons keep only what
    /// their enclosure over the reset predecessor bounds implies (for ReLU,
    /// `[0, +∞]`).
    pub fn clear_neuron_bounds(&mut self) {
        self.input.bounds = self.input.original.clone();
        self.clear_layer_bounds();
    }

    /// Recompute every layer in order. Activation enclosures are rebuilt from
    /// the refreshed predecessor bounds, except for neurons whose enclosure
    /// was set explicitly.
    pub fn run_bound_pass(&mut self) -> Result<()> {
        info!("Bound pass over {} layers", self.layers.len());
        for idx in 0..self.layers.len() {
            match self.layers[idx].kind {
                LayerKind::Affine | LayerKind::Residual => self.update_layer_bounds(idx)?,
                LayerKind::Activation { .. } => {
                    self.relax_activation_layer(idx);
                    self.update_layer_bounds(idx)?;
                }
                LayerKind::Concat { .. } | LayerKind::Tile { .. } => {
                    self.copy_predecessor_bounds(idx)
                }
            }
        }
        Ok(())
    }

    /// Intersect externally computed bounds into the state and re-run the
    /// bound pass. `input` refines the input box; each `(layer, bounds)`
    /// entry refines every neuron of that layer. Nothing is modified if any
    /// entry is malformed or disjoint from the current bound.
    pub fn refine_bounds_from_solver(
        &mut self,
        input: &[Bound],
        layers: &[(usize, Vec<Bound>)],
    ) -> Result<()> {
        let input = input_bounds(input, self.input.num_pixels())?;
        let mut refined = Vec::with_capacity(layers.len());
        for (layer, bounds) in layers {
            let width = self.num_neurons(*layer)?;
            refined.push((*layer, input_bounds(bounds, width)?));
        }

        let disjoint = |old: &Interval, new: &Interval| {
            let met = old.meet(new);
            met.lower() > met.upper()
        };
        if input.iter().zip(&self.input.bounds).any(|(n, o)| disjoint(o, n)) {
            return Err(rejected(DeltaError::InvalidInput(
                "solver input bounds are disjoint from the input box".to_string(),
            )));
        }
        for (layer, bounds) in &refined {
            let neurons = &self.layers[*layer].neurons;
            if let Some(j) = (0..bounds.len()).find(|&j| disjoint(&neurons[j].bound, &bounds[j])) {
                return Err(rejected(DeltaError::InvalidInput(format!(
                    "solver bound for neuron {j} of layer {layer} is disjoint from its current bound"
                ))));
            }
        }

        for (old, new) in self.input.bounds.iter_mut().zip(&input) {
            *old = old.meet(new);
        }
        let mut stabilised = 0;
        for (layer, bounds) in refined {
            for (neuron, new) in self.layers[layer].neurons.iter_mut().zip(&bounds) {
                let was_unstable = neuron.bound.lower() < 0.0 && neuron.bound.upper() > 0.0;
                neuron.bound = neuron.bound.meet(new);
                if was_unstable && (neuron.bound.lower() >= 0.0 || neuron.bound.upper() <= 0.0) {
                    stabilised += 1;
                }
            }
        }
        info!("Solver refinement stabilised {} neurons", stabilised);
        self.run_bound_pass()
    }

    /// Overwrite one neuron's bound.
    pub fn update_bounds_for_neuron(&mut self, layer: usize, neuron: usize, bound: Bound) -> Result<()> {
        if !bound.is_valid() {
            return Err(rejected(DeltaError::InvalidInput(format!(
                "bound is not an interval: [{}, {}]",
                bound.lower, bound.upper
            ))));
        }
        self.neuron_mut(layer, neuron)?.bound = bound.into();
        Ok(())
    }

    /// Force an activation neuron to the constant zero.
    pub fn set_activation_neuron_to_zero(&mut self, layer: usize, neuron: usize) -> Result<()> {
        self.activation_layer(layer)?;
        let n = self.neuron_mut(layer, neuron)?;
        n.set_linear(LinExpr::unit(neuron, 0.0));
        n.bound = Interval::zero();
        n.pinned = true;
        Ok(())
    }

    /// Replace the lower enclosure of an activation neuron.
    pub fn update_activation_lower_expr(&mut self, layer: usize, neuron: usize, expr: LinExpr) -> Result<()> {
        self.update_activation_expr(layer, neuron, expr, Side::Lower)
    }

    /// Replace the upper enclosure of an activation neuron.
    pub fn update_activation_upper_expr(&mut self, layer: usize, neuron: usize, expr: LinExpr) -> Result<()> {
        self.update_activation_expr(layer, neuron, expr, Side::Upper)
    }

    fn update_activation_expr(&mut self, layer: usize, neuron: usize, expr: LinExpr, side: Side) -> Result<()> {
        self.activation_layer(layer)?;
        let width = self.layers[layer].input_width();
        if expr.max_dim().is_some_and(|d| d >= width) {
            return Err(rejected(DeltaError::InvalidInput(format!(
                "enclosure references input {} of {width}",
                expr.max_dim().unwrap_or_default()
            ))));
        }
        let n = self.neuron_mut(layer, neuron)?;
        match side {
            Side::Lower => n.lexpr = Some(expr.into()),
            Side::Upper => n.uexpr = Some(expr.into()),
        }
        n.pinned = true;
        Ok(())
    }

    /// Concrete forward evaluation of the network at an input point.
    /// Returns the values of every layer, in layer order.
    ///
    /// Affine layers use the midpoint of their stored expression evaluated
    /// at the point; activation layers apply their policy's activation
    /// function to the predecessor value.
    pub fn forward(&self, point: &[f64]) -> Result<Vec<Vec<f64>>> {
        if point.len() != self.input.num_pixels() {
            return Err(rejected(DeltaError::shape_mismatch(
                "forward input",
                vec![self.input.num_pixels()],
                vec![point.len()],
            )));
        }
        let mut values: Vec<Vec<f64>> = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let inputs: Vec<Interval> = layer
                .predecessors
                .iter()
                .flat_map(|&pred| {
                    let node: &[f64] = if pred == INPUT_NODE {
                        point
                    } else {
                        &values[pred - 1]
                    };
                    node.iter().map(|&v| Interval::point(v))
                })
                .collect();
            let out = match &layer.kind {
                LayerKind::Activation { relaxation } => inputs
                    .iter()
                    .map(|v| relaxation.eval(v.upper()))
                    .collect(),
                _ => layer
                    .neurons
                    .iter()
                    .map(|n| {
                        let at = n
                            .lexpr
                            .as_deref()
                            .map_or(Interval::zero(), |e| e.eval(&inputs));
                        0.5 * at.lower() + 0.5 * at.upper()
                    })
                    .collect(),
            };
            values.push(out);
        }
        Ok(values)
    }
}
