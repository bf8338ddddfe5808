//! Layer graph and neuron model.
//!
//! The network is a DAG built incrementally, one layer per operator. Nodes
//! are identified by their position in creation order: node `0` is the
//! network input and node `i + 1` is layer `i`. Every predecessor of a layer
//! therefore has a smaller node id than the layer itself.
//!
//! A layer's neurons store affine expressions over the layer's *input
//! space*: the outputs of its predecessors laid end to end in predecessor
//! order. For a single-predecessor layer that is just the predecessor's
//! neurons; for residual and concatenation layers the `offsets` table
//! records where each predecessor's block starts.

use crate::expr::LinExpr;
use crate::relaxation::{ActivationRelaxation, ReluRelaxation};
use crate::types::EngineConfig;
use delta_core::{Bound, DeltaError, Interval, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Node id of the network input.
pub const INPUT_NODE: usize = 0;

/// One neuron: concrete bound, stored expressions, and the scratch
/// expressions produced by the last bound pass.
///
/// `lexpr` and `uexpr` may share one allocation when the neuron is exactly
/// affine in its inputs. Replacing either slot never touches the other, so
/// shared expressions are released exactly once.
#[derive(Debug, Clone)]
pub struct Neuron {
    pub(crate) bound: Interval,
    pub(crate) lexpr: Option<Arc<LinExpr>>,
    pub(crate) uexpr: Option<Arc<LinExpr>>,
    pub(crate) backsubstituted_lexpr: Option<LinExpr>,
    pub(crate) backsubstituted_uexpr: Option<LinExpr>,
    /// Enclosure set from outside; a re-run keeps it instead of asking the
    /// relaxation policy again.
    pub(crate) pinned: bool,
}

impl Default for Neuron {
    fn default() -> Self {
        Self {
            bound: Interval::top(),
            lexpr: None,
            uexpr: None,
            backsubstituted_lexpr: None,
            backsubstituted_uexpr: None,
            pinned: false,
        }
    }
}

impl Neuron {
    /// Store one expression as both lower and upper expression.
    pub(crate) fn set_linear(&mut self, expr: LinExpr) {
        let expr = Arc::new(expr);
        self.lexpr = Some(Arc::clone(&expr));
        self.uexpr = Some(expr);
    }

    pub(crate) fn set_exprs(&mut self, lower: LinExpr, upper: LinExpr) {
        self.lexpr = Some(Arc::new(lower));
        self.uexpr = Some(Arc::new(upper));
    }

    /// Concrete bound `[lower, upper]`.
    #[inline]
    pub fn bound(&self) -> Interval {
        self.bound
    }

    pub fn lexpr(&self) -> Option<&Arc<LinExpr>> {
        self.lexpr.as_ref()
    }

    pub fn uexpr(&self) -> Option<&Arc<LinExpr>> {
        self.uexpr.as_ref()
    }

    /// Lower and upper expression are the same object.
    pub fn is_linear(&self) -> bool {
        match (&self.lexpr, &self.uexpr) {
            (Some(l), Some(u)) => Arc::ptr_eq(l, u),
            _ => false,
        }
    }

    pub fn backsubstituted(&self, side: crate::types::Side) -> Option<&LinExpr> {
        match side {
            crate::types::Side::Lower => self.backsubstituted_lexpr.as_ref(),
            crate::types::Side::Upper => self.backsubstituted_uexpr.as_ref(),
        }
    }

    pub(crate) fn reset_bound(&mut self) {
        self.bound = Interval::top();
        self.backsubstituted_lexpr = None;
        self.backsubstituted_uexpr = None;
    }
}

/// Kind-specific layer data.
#[derive(Debug, Clone)]
pub enum LayerKind {
    /// Affine map of a single predecessor (fully connected, convolution,
    /// padding, elementwise scale/shift, matrix products).
    Affine,
    /// Activation over a single predecessor, neuron `i` reading neuron `i`.
    Activation {
        relaxation: Arc<dyn ActivationRelaxation>,
    },
    /// Elementwise sum of two predecessors of equal width.
    Residual,
    /// Predecessors stacked in order; `channels[p]` is predecessor `p`'s
    /// channel count.
    Concat { channels: Vec<usize> },
    /// Single predecessor repeated `repeat` times.
    Tile { repeat: usize },
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Affine => "affine",
            LayerKind::Activation { .. } => "activation",
            LayerKind::Residual => "residual",
            LayerKind::Concat { .. } => "concat",
            LayerKind::Tile { .. } => "tile",
        }
    }
}

/// A layer: fixed-size neuron array plus its predecessor list.
#[derive(Debug, Clone)]
pub struct Layer {
    pub(crate) kind: LayerKind,
    pub(crate) neurons: Vec<Neuron>,
    pub(crate) predecessors: Vec<usize>,
    /// Start of each predecessor's block in the input space, plus one
    /// trailing entry holding the input width.
    pub(crate) offsets: Vec<usize>,
}

impl Layer {
    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.neurons.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.neurons.is_empty()
    }

    #[inline]
    pub fn is_activation(&self) -> bool {
        matches!(self.kind, LayerKind::Activation { .. })
    }

    pub fn predecessors(&self) -> &[usize] {
        &self.predecessors
    }

    pub fn neurons(&self) -> &[Neuron] {
        &self.neurons
    }

    /// Width of the concatenated input space.
    #[inline]
    pub fn input_width(&self) -> usize {
        *self.offsets.last().unwrap_or(&0)
    }

    /// Total channel count of a concatenation layer.
    pub fn num_channels(&self) -> Option<usize> {
        match &self.kind {
            LayerKind::Concat { channels } => Some(channels.iter().sum()),
            _ => None,
        }
    }

    /// Resolve input-space index `k` to `(predecessor slot, local index)`.
    ///
    /// Slots are visited in predecessor order, accumulating block widths, so
    /// that the attribution matches how the construction handlers laid out
    /// the input space.
    #[inline]
    pub fn locate(&self, k: usize) -> (usize, usize) {
        locate_in(&self.offsets, k)
    }
}

/// Resolve input-space index `k` against an offset table.
#[inline]
pub(crate) fn locate_in(offsets: &[usize], k: usize) -> (usize, usize) {
    let width = *offsets.last().unwrap_or(&0);
    assert!(k < width, "input index {k} outside input space of width {width}");
    let slot = offsets[1..].partition_point(|&end| end <= k);
    (slot, k - offsets[slot])
}

/// Symbolic input enclosure: pixel `i` is bounded below by `lower[i]` and
/// above by `upper[i]`, both affine over a latent box.
#[derive(Debug, Clone)]
pub struct InputEnclosure {
    pub lower: Vec<LinExpr>,
    pub upper: Vec<LinExpr>,
    pub latent: Vec<Interval>,
}

/// Spatial-perturbation bookkeeping: `indices[j]` and `neighbors[j]` form a
/// pair of pixels whose perturbations share the budget `gamma`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialConstraints {
    pub indices: Vec<usize>,
    pub neighbors: Vec<usize>,
    pub gamma: f64,
}

/// Input region of the network.
#[derive(Debug, Clone)]
pub struct InputRegion {
    pub(crate) bounds: Vec<Interval>,
    pub(crate) original: Vec<Interval>,
    pub(crate) enclosure: Option<InputEnclosure>,
    pub(crate) spatial: Option<SpatialConstraints>,
}

impl InputRegion {
    #[inline]
    pub fn num_pixels(&self) -> usize {
        self.bounds.len()
    }

    pub fn bounds(&self) -> &[Interval] {
        &self.bounds
    }

    pub fn enclosure(&self) -> Option<&InputEnclosure> {
        self.enclosure.as_ref()
    }
}

/// Network abstract state: input region plus the ordered layer list.
#[derive(Debug)]
pub struct Network {
    pub(crate) config: EngineConfig,
    pub(crate) relaxation: Arc<dyn ActivationRelaxation>,
    pub(crate) input: InputRegion,
    pub(crate) layers: Vec<Layer>,
}

/// Log a rejected API call and hand the error back.
pub(crate) fn rejected(err: DeltaError) -> DeltaError {
    warn!("{err}");
    err
}

fn input_box(bounds: &[Bound]) -> Result<Vec<Interval>> {
    bounds
        .iter()
        .enumerate()
        .map(|(i, b)| {
            if b.is_valid() {
                Ok(Interval::from(*b))
            } else {
                Err(DeltaError::InvalidInput(format!(
                    "input bound {i} is not an interval: [{}, {}]",
                    b.lower, b.upper
                )))
            }
        })
        .collect()
}

impl Network {
    /// Network over an input box, default configuration.
    pub fn from_input_box(bounds: &[Bound]) -> Result<Self> {
        Self::with_config(EngineConfig::default(), bounds)
    }

    /// Network over an input box.
    pub fn with_config(config: EngineConfig, bounds: &[Bound]) -> Result<Self> {
        let bounds = input_box(bounds)?;
        debug!("Network input: {} pixels", bounds.len());
        let relaxation = Arc::new(ReluRelaxation::new(config.relu_lower));
        Ok(Self {
            config,
            relaxation,
            input: InputRegion {
                original: bounds.clone(),
                bounds,
                enclosure: None,
                spatial: None,
            },
            layers: Vec::new(),
        })
    }

    /// Network over an input box refined by per-pixel affine enclosures
    /// over a latent box, optionally with spatial-perturbation pairs.
    pub fn from_input_poly(
        config: EngineConfig,
        bounds: &[Bound],
        enclosure: InputEnclosure,
        spatial: Option<SpatialConstraints>,
    ) -> Result<Self> {
        let mut network = Self::with_config(config, bounds)?;
        let num_pixels = network.input.num_pixels();
        if enclosure.lower.len() != num_pixels || enclosure.upper.len() != num_pixels {
            return Err(DeltaError::shape_mismatch(
                "input enclosure",
                vec![num_pixels, num_pixels],
                vec![enclosure.lower.len(), enclosure.upper.len()],
            ));
        }
        let latent = enclosure.latent.len();
        for expr in enclosure.lower.iter().chain(&enclosure.upper) {
            if expr.max_dim().is_some_and(|d| d >= latent) {
                return Err(DeltaError::InvalidInput(format!(
                    "input enclosure references latent dimension {} of {latent}",
                    expr.max_dim().unwrap_or_default()
                )));
            }
        }
        if let Some(spatial) = &spatial {
            if spatial.indices.len() != spatial.neighbors.len() {
                return Err(DeltaError::shape_mismatch(
                    "spatial constraints",
                    vec![spatial.indices.len()],
                    vec![spatial.neighbors.len()],
                ));
            }
            if let Some(&bad) = spatial
                .indices
                .iter()
                .chain(&spatial.neighbors)
                .find(|&&p| p >= num_pixels)
            {
                return Err(DeltaError::InvalidInput(format!(
                    "spatial constraint references pixel {bad} of {num_pixels}"
                )));
            }
            if spatial.gamma.is_nan() || spatial.gamma < 0.0 {
                return Err(DeltaError::InvalidInput(format!(
                    "spatial budget must be >= 0 (got {})",
                    spatial.gamma
                )));
            }
        }
        network.input.enclosure = Some(enclosure);
        network.input.spatial = spatial;
        Ok(network)
    }

    /// Replace the activation policy used by subsequent activation layers.
    pub fn set_relaxation(&mut self, relaxation: Arc<dyn ActivationRelaxation>) {
        self.relaxation = relaxation;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn input(&self) -> &InputRegion {
        &self.input
    }

    pub fn spatial_constraints(&self) -> Option<&SpatialConstraints> {
        self.input.spatial.as_ref()
    }

    #[inline]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, layer: usize) -> Result<&Layer> {
        self.layers.get(layer).ok_or_else(|| {
            let err = DeltaError::LayerOutOfRange {
                layer,
                num_layers: self.layers.len(),
            };
            warn!("{err}");
            err
        })
    }

    pub(crate) fn layer_mut(&mut self, layer: usize) -> Result<&mut Layer> {
        let num_layers = self.layers.len();
        self.layers.get_mut(layer).ok_or_else(|| {
            let err = DeltaError::LayerOutOfRange { layer, num_layers };
            warn!("{err}");
            err
        })
    }

    /// Output width of a node (`0` is the input).
    pub fn node_width(&self, node: usize) -> Result<usize> {
        if node == INPUT_NODE {
            return Ok(self.input.num_pixels());
        }
        match self.layers.get(node - 1) {
            Some(layer) => Ok(layer.len()),
            None => {
                let err = DeltaError::PredecessorOutOfRange {
                    predecessor: node,
                    num_nodes: self.layers.len() + 1,
                };
                warn!("{err}");
                Err(err)
            }
        }
    }

    /// Concrete bound of neuron `k` of a node.
    pub(crate) fn node_bound(&self, node: usize, k: usize) -> Interval {
        node_bound(&self.input, &self.layers, node, k)
    }

    /// Append a layer of `size` neurons. Neuron expressions are filled in by
    /// the caller. Returns the new layer's index.
    pub fn add_layer(
        &mut self,
        size: usize,
        kind: LayerKind,
        predecessors: &[usize],
    ) -> Result<usize> {
        let arity_ok = match &kind {
            LayerKind::Residual => predecessors.len() == 2,
            LayerKind::Concat { .. } => !predecessors.is_empty(),
            _ => predecessors.len() == 1,
        };
        if !arity_ok {
            let expected = match &kind {
                LayerKind::Residual => "2",
                LayerKind::Concat { .. } => "at least 1",
                _ => "1",
            };
            let err = DeltaError::Arity {
                op: kind.name(),
                expected: expected.to_string(),
                got: predecessors.len(),
            };
            warn!("{err}");
            return Err(err);
        }

        let mut offsets = Vec::with_capacity(predecessors.len() + 1);
        let mut width = 0;
        for &pred in predecessors {
            offsets.push(width);
            width += self.node_width(pred)?;
        }
        offsets.push(width);

        self.layers.push(Layer {
            kind,
            neurons: vec![Neuron::default(); size],
            predecessors: predecessors.to_vec(),
            offsets,
        });
        Ok(self.layers.len() - 1)
    }
}

/// Concrete bound of neuron `k` of `node`, read from a layer prefix.
#[inline]
pub(crate) fn node_bound(input: &InputRegion, layers: &[Layer], node: usize, k: usize) -> Interval {
    if node == INPUT_NODE {
        input.bounds[k]
    } else {
        layers[node - 1].neurons[k].bound
    }
}
