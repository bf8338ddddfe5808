//! Layer construction handlers.
//!
//! Each handler appends one layer for one operator. Affine operators store
//! their exact linear semantics as a single expression shared by the lower
//! and upper slot; activation layers store the enclosure chosen by the
//! network's relaxation policy. After appending, the handler runs the bound
//! driver on the new layer, except for concatenation and tiling, which copy
//! their predecessors' bounds.
//!
//! Image tensors are laid out HWC: element `(x, y, z)` of an `h × w × c`
//! tensor is neuron `x·w·c + y·c + z`.

use crate::expr::LinExpr;
use crate::network::{rejected, LayerKind, Network};
use crate::parallel;
use crate::relaxation::{ActivationRelaxation, Enclosure, ReluRelaxation};
use delta_core::{DeltaError, Interval, Result};
use ndarray::{ArrayView2, ArrayView4};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Zero padding around the two spatial axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Padding {
    pub top: usize,
    pub left: usize,
    pub bottom: usize,
    pub right: usize,
}

impl Padding {
    pub fn uniform(p: usize) -> Self {
        Self {
            top: p,
            left: p,
            bottom: p,
            right: p,
        }
    }
}

/// Geometry of a 2-D convolution over an HWC input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    /// `[height, width, channels]` of the input.
    pub input: [usize; 3],
    pub strides: [usize; 2],
    pub padding: Padding,
}

impl ConvGeometry {
    /// `[height, width]` of the output for a `fh × fw` filter, or `None` if
    /// the padded input is smaller than the filter or a stride is zero.
    pub fn output_hw(&self, filter: [usize; 2]) -> Option<[usize; 2]> {
        let padded_h = self.input[0] + self.padding.top + self.padding.bottom;
        let padded_w = self.input[1] + self.padding.left + self.padding.right;
        if self.strides[0] == 0 || self.strides[1] == 0 {
            return None;
        }
        if padded_h < filter[0] || padded_w < filter[1] {
            return None;
        }
        Some([
            (padded_h - filter[0]) / self.strides[0] + 1,
            (padded_w - filter[1]) / self.strides[1] + 1,
        ])
    }
}

/// Sparse expression over the non-zero weights of `terms`.
fn nonzero_terms(terms: impl IntoIterator<Item = (usize, f64)>, cst: f64) -> LinExpr {
    let (dims, coeffs): (Vec<usize>, Vec<f64>) =
        terms.into_iter().filter(|&(_, w)| w != 0.0).unzip();
    LinExpr::sparse_scalars(&coeffs, &dims, cst)
}

impl Network {
    /// Predecessor node and width of a single-predecessor operator.
    fn single_input(&self, op: &'static str, predecessors: &[usize]) -> Result<(usize, usize)> {
        if predecessors.len() != 1 {
            return Err(rejected(DeltaError::Arity {
                op,
                expected: "1".to_string(),
                got: predecessors.len(),
            }));
        }
        let pred = predecessors[0];
        Ok((pred, self.node_width(pred)?))
    }

    fn expect_width(op: &'static str, expected: usize, got: usize) -> Result<()> {
        if expected == got {
            Ok(())
        } else {
            Err(rejected(DeltaError::shape_mismatch(
                op,
                vec![expected],
                vec![got],
            )))
        }
    }

    /// Run the bound driver on `layer`.
    pub(crate) fn update_layer_bounds(&mut self, layer: usize) -> Result<()> {
        parallel::compute_layer_bounds(&self.input, &mut self.layers, &self.config, layer)
    }

    /// Intersect every neuron's bound with the bound of the single input
    /// neuron its expression selects. Used by layers that only reorder or
    /// repeat their inputs.
    pub(crate) fn copy_predecessor_bounds(&mut self, idx: usize) {
        let layer = &self.layers[idx];
        let bounds: Vec<Interval> = layer
            .neurons
            .iter()
            .map(|neuron| {
                let Some(k) = neuron.lexpr.as_deref().and_then(LinExpr::max_dim) else {
                    return Interval::top();
                };
                let (slot, local) = layer.locate(k);
                self.node_bound(layer.predecessors[slot], local)
            })
            .collect();
        for (neuron, bound) in self.layers[idx].neurons.iter_mut().zip(bounds) {
            neuron.bound = neuron.bound.meet(&bound);
        }
    }

    /// Append an affine layer whose neuron `i` is exactly `exprs[i]`.
    fn push_affine(
        &mut self,
        op: &'static str,
        exprs: Vec<LinExpr>,
        predecessors: &[usize],
    ) -> Result<usize> {
        let idx = self.add_layer(exprs.len(), LayerKind::Affine, predecessors)?;
        info!(
            "Layer {}: {} with {} neurons over {:?}",
            idx,
            op,
            exprs.len(),
            predecessors
        );
        for (neuron, expr) in self.layers[idx].neurons.iter_mut().zip(exprs) {
            neuron.set_linear(expr);
        }
        self.update_layer_bounds(idx)?;
        Ok(idx)
    }

    /// Fully connected layer: neuron `i` is `Σ_j weights[i][j] · x_j + bias[i]`.
    pub fn add_fully_connected(
        &mut self,
        weights: ArrayView2<'_, f64>,
        bias: &[f64],
        predecessors: &[usize],
    ) -> Result<usize> {
        let (_, width) = self.single_input("fully_connected", predecessors)?;
        let (rows, cols) = weights.dim();
        Self::expect_width("fully_connected weights", width, cols)?;
        Self::expect_width("fully_connected bias", rows, bias.len())?;
        let exprs = weights
            .rows()
            .into_iter()
            .zip(bias)
            .map(|(row, &b)| {
                let row: Vec<f64> = row.iter().copied().collect();
                LinExpr::dense(&row, b)
            })
            .collect();
        self.push_affine("fully_connected", exprs, predecessors)
    }

    /// Fully connected layer stored sparsely: zero weights are dropped.
    pub fn add_sparse_fully_connected(
        &mut self,
        weights: ArrayView2<'_, f64>,
        bias: &[f64],
        predecessors: &[usize],
    ) -> Result<usize> {
        let (_, width) = self.single_input("sparse_fully_connected", predecessors)?;
        let (rows, cols) = weights.dim();
        Self::expect_width("sparse_fully_connected weights", width, cols)?;
        Self::expect_width("sparse_fully_connected bias", rows, bias.len())?;
        let exprs = weights
            .rows()
            .into_iter()
            .zip(bias)
            .map(|(row, &b)| nonzero_terms(row.iter().copied().enumerate(), b))
            .collect();
        self.push_affine("sparse_fully_connected", exprs, predecessors)
    }

    /// `W · X` where the predecessor holds a row-major
    /// `weights.ncols() × num_out_cols` matrix `X`. Output neuron
    /// `i·num_out_cols + j` is `Σ_k W[i][k] · X[k][j]`, zero weights dropped.
    pub fn add_right_multiply(
        &mut self,
        weights: ArrayView2<'_, f64>,
        num_out_cols: usize,
        predecessors: &[usize],
    ) -> Result<usize> {
        let (_, width) = self.single_input("right_multiply", predecessors)?;
        let (rows, inner) = weights.dim();
        Self::expect_width("right_multiply operand", inner * num_out_cols, width)?;
        let mut exprs = Vec::with_capacity(rows * num_out_cols);
        for i in 0..rows {
            for j in 0..num_out_cols {
                let terms = (0..inner).map(|k| (k * num_out_cols + j, weights[[i, k]]));
                exprs.push(nonzero_terms(terms, 0.0));
            }
        }
        self.push_affine("right_multiply", exprs, predecessors)
    }

    /// Scale row `i` of a row-major `bias.len() × num_cols` predecessor by
    /// `bias[i]`.
    pub fn add_row_bias_multiply(
        &mut self,
        bias: &[f64],
        num_cols: usize,
        predecessors: &[usize],
    ) -> Result<usize> {
        let (_, width) = self.single_input("row_bias_multiply", predecessors)?;
        Self::expect_width("row_bias_multiply operand", bias.len() * num_cols, width)?;
        let exprs = bias
            .iter()
            .enumerate()
            .flat_map(|(i, &b)| (0..num_cols).map(move |j| LinExpr::unit(i * num_cols + j, b)))
            .collect();
        self.push_affine("row_bias_multiply", exprs, predecessors)
    }

    /// Elementwise product with a constant vector: neuron `i` is
    /// `factors[i] · x_i`.
    pub fn add_elementwise_mul(&mut self, factors: &[f64], predecessors: &[usize]) -> Result<usize> {
        let (_, width) = self.single_input("mul", predecessors)?;
        Self::expect_width("mul factors", width, factors.len())?;
        let exprs = factors
            .iter()
            .enumerate()
            .map(|(i, &f)| LinExpr::unit(i, f))
            .collect();
        self.push_affine("mul", exprs, predecessors)
    }

    /// Elementwise subtraction with a constant vector. With `is_minuend` the
    /// constant is the minuend (`cst[i] - x_i`); otherwise it is subtracted
    /// (`x_i - cst[i]`).
    pub fn add_sub(&mut self, cst: &[f64], is_minuend: bool, predecessors: &[usize]) -> Result<usize> {
        let (_, width) = self.single_input("sub", predecessors)?;
        Self::expect_width("sub constants", width, cst.len())?;
        let exprs = cst
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let (coeff, shift) = if is_minuend { (-1.0, c) } else { (1.0, -c) };
                let mut expr = LinExpr::unit(i, coeff);
                expr.set_cst(Interval::point(shift));
                expr
            })
            .collect();
        self.push_affine("sub", exprs, predecessors)
    }

    /// 2-D convolution. `filters` has shape `[fh, fw, in_c, out_c]`; output
    /// neuron `(ox, oy, oz)` sums `filters[xs, ys, iz, oz] · x[(ix, iy, iz)]`
    /// with `ix = ox·stride₀ + xs − pad_top` and `iy = oy·stride₁ + ys −
    /// pad_left`, skipping taps that fall into the padding or carry a zero
    /// weight.
    pub fn add_convolution(
        &mut self,
        filters: ArrayView4<'_, f64>,
        bias: Option<&[f64]>,
        geometry: ConvGeometry,
        predecessors: &[usize],
    ) -> Result<usize> {
        let (_, width) = self.single_input("conv", predecessors)?;
        let [h, w, c] = geometry.input;
        let (fh, fw, in_c, out_c) = filters.dim();
        Self::expect_width("conv input", h * w * c, width)?;
        Self::expect_width("conv filter channels", c, in_c)?;
        if let Some(bias) = bias {
            Self::expect_width("conv bias", out_c, bias.len())?;
        }
        let [oh, ow] = geometry.output_hw([fh, fw]).ok_or_else(|| {
            rejected(DeltaError::InvalidInput(format!(
                "conv: filter {fh}x{fw} with strides {:?} does not fit padded input {:?}",
                geometry.strides, geometry.input
            )))
        })?;

        let pad_top = geometry.padding.top as isize;
        let pad_left = geometry.padding.left as isize;
        let mut exprs = Vec::with_capacity(oh * ow * out_c);
        for ox in 0..oh {
            for oy in 0..ow {
                for oz in 0..out_c {
                    let mut terms = Vec::with_capacity(in_c * fh * fw);
                    for xs in 0..fh {
                        let ix = (ox * geometry.strides[0] + xs) as isize - pad_top;
                        if ix < 0 || ix >= h as isize {
                            continue;
                        }
                        for ys in 0..fw {
                            let iy = (oy * geometry.strides[1] + ys) as isize - pad_left;
                            if iy < 0 || iy >= w as isize {
                                continue;
                            }
                            for iz in 0..in_c {
                                let k = ix as usize * w * c + iy as usize * c + iz;
                                terms.push((k, filters[[xs, ys, iz, oz]]));
                            }
                        }
                    }
                    let b = bias.map_or(0.0, |b| b[oz]);
                    exprs.push(nonzero_terms(terms, b));
                }
            }
        }
        self.push_affine("conv", exprs, predecessors)
    }

    /// Zero padding of an HWC tensor. Padded positions are the constant 0.
    pub fn add_padding(
        &mut self,
        input: [usize; 3],
        padding: Padding,
        predecessors: &[usize],
    ) -> Result<usize> {
        let (_, width) = self.single_input("padding", predecessors)?;
        let [h, w, c] = input;
        Self::expect_width("padding input", h * w * c, width)?;
        let oh = h + padding.top + padding.bottom;
        let ow = w + padding.left + padding.right;

        let mut exprs = Vec::with_capacity(oh * ow * c);
        for ox in 0..oh {
            for oy in 0..ow {
                let inside = ox >= padding.top
                    && ox - padding.top < h
                    && oy >= padding.left
                    && oy - padding.left < w;
                for oz in 0..c {
                    if inside {
                        let ix = ox - padding.top;
                        let iy = oy - padding.left;
                        exprs.push(LinExpr::unit(ix * w * c + iy * c + oz, 1.0));
                    } else {
                        exprs.push(LinExpr::constant(Interval::zero()));
                    }
                }
            }
        }
        self.push_affine("padding", exprs, predecessors)
    }

    /// Elementwise sum of two predecessors of equal width.
    pub fn add_residual(&mut self, predecessors: &[usize]) -> Result<usize> {
        if predecessors.len() != 2 {
            return Err(rejected(DeltaError::Arity {
                op: "residual",
                expected: "2".to_string(),
                got: predecessors.len(),
            }));
        }
        let m = self.node_width(predecessors[0])?;
        let n = self.node_width(predecessors[1])?;
        Self::expect_width("residual operands", m, n)?;

        let idx = self.add_layer(m, LayerKind::Residual, predecessors)?;
        info!(
            "Layer {}: residual with {} neurons over {:?}",
            idx, m, predecessors
        );
        for (i, neuron) in self.layers[idx].neurons.iter_mut().enumerate() {
            neuron.set_linear(LinExpr::sparse_scalars(&[1.0, 1.0], &[i, m + i], 0.0));
        }
        self.update_layer_bounds(idx)?;
        Ok(idx)
    }

    /// Stack predecessors in order. `channels[p]` is predecessor `p`'s
    /// channel count and must divide its width (a non-empty predecessor has
    /// at least one channel). Output neuron `offset_p + j` is predecessor
    /// `p`'s neuron `j`, with its bound copied.
    pub fn add_concatenation(&mut self, predecessors: &[usize], channels: &[usize]) -> Result<usize> {
        if channels.len() != predecessors.len() {
            return Err(rejected(DeltaError::shape_mismatch(
                "concat channels",
                vec![predecessors.len()],
                vec![channels.len()],
            )));
        }
        let mut width = 0;
        for (&pred, &c) in predecessors.iter().zip(channels) {
            let n = self.node_width(pred)?;
            if n > 0 && (c == 0 || n % c != 0) {
                return Err(rejected(DeltaError::InvalidInput(format!(
                    "concat: {c} channels do not divide the {n} neurons of node {pred}"
                ))));
            }
            width += n;
        }

        let idx = self.add_layer(
            width,
            LayerKind::Concat {
                channels: channels.to_vec(),
            },
            predecessors,
        )?;
        info!(
            "Layer {}: concat with {} neurons over {:?}",
            idx, width, predecessors
        );
        for (k, neuron) in self.layers[idx].neurons.iter_mut().enumerate() {
            neuron.set_linear(LinExpr::unit(k, 1.0));
        }
        self.copy_predecessor_bounds(idx);
        Ok(idx)
    }

    /// Repeat the predecessor `repeat` times. Output neuron `k` is input
    /// neuron `k mod n`, with its bound copied.
    pub fn add_tiling(&mut self, predecessors: &[usize], repeat: usize) -> Result<usize> {
        let (_, n) = self.single_input("tile", predecessors)?;
        let idx = self.add_layer(n * repeat, LayerKind::Tile { repeat }, predecessors)?;
        info!(
            "Layer {}: tile x{} with {} neurons over {:?}",
            idx,
            repeat,
            n * repeat,
            predecessors
        );
        for (k, neuron) in self.layers[idx].neurons.iter_mut().enumerate() {
            neuron.set_linear(LinExpr::unit(k % n, 1.0));
        }
        self.copy_predecessor_bounds(idx);
        Ok(idx)
    }

    /// Activation layer using the network's current relaxation policy.
    pub fn add_activation(&mut self, predecessors: &[usize]) -> Result<usize> {
        let relaxation = Arc::clone(&self.relaxation);
        self.add_activation_with(relaxation, predecessors)
    }

    /// Activation layer with an explicit relaxation policy.
    pub fn add_activation_with(
        &mut self,
        relaxation: Arc<dyn ActivationRelaxation>,
        predecessors: &[usize],
    ) -> Result<usize> {
        let (_, n) = self.single_input("activation", predecessors)?;
        let idx = self.add_layer(
            n,
            LayerKind::Activation {
                relaxation: Arc::clone(&relaxation),
            },
            predecessors,
        )?;
        info!(
            "Layer {}: {} activation with {} neurons over {:?}",
            idx,
            relaxation.name(),
            n,
            predecessors
        );
        self.relax_activation_layer(idx);
        self.update_layer_bounds(idx)?;
        Ok(idx)
    }

    /// (Re)compute the enclosure of every unpinned neuron of an activation
    /// layer from its predecessor's current bounds.
    pub(crate) fn relax_activation_layer(&mut self, idx: usize) {
        let layer = &self.layers[idx];
        let LayerKind::Activation { relaxation } = &layer.kind else {
            return;
        };
        let relaxation = Arc::clone(relaxation);
        let pred = layer.predecessors[0];
        let inputs: Vec<Interval> = (0..layer.len())
            .map(|i| self.node_bound(pred, i))
            .collect();

        for (i, neuron) in self.layers[idx].neurons.iter_mut().enumerate() {
            if neuron.pinned {
                continue;
            }
            let enclosure = relaxation.enclose(i, inputs[i]);
            neuron.bound = neuron.bound.meet(&enclosure.bound());
            match enclosure {
                Enclosure::Linear { expr, .. } => neuron.set_linear(expr),
                Enclosure::Relaxed { lower, upper, .. } => neuron.set_exprs(lower, upper),
            }
        }
    }

    /// ReLU layer with the configured lower slope, whatever policy is set.
    pub fn add_relu(&mut self, predecessors: &[usize]) -> Result<usize> {
        let relu = Arc::new(ReluRelaxation::new(self.config.relu_lower));
        self.add_activation_with(relu, predecessors)
    }
}
