//! Parallel bound computation over the neurons of a layer.
//!
//! Every neuron of a layer is bounded independently: its lower and upper
//! expressions are backsubstituted against the layers before it, which are
//! only read. The target layer is split off with `split_at_mut`, so each
//! worker writes its own disjoint chunk of neurons and nothing else.
//!
//! Work is split into contiguous chunks of `ceil(n / workers)` neurons (one
//! neuron per chunk when there are fewer neurons than workers). With
//! `max_threads` set, a dedicated rayon pool of that size runs the pass;
//! otherwise the global pool is used.

use crate::backsub::{Backsubstitution, Frontier};
use crate::expr::LinExpr;
use crate::network::{InputRegion, Layer, Neuron, INPUT_NODE};
use crate::types::{EngineConfig, Side};
use delta_core::{DeltaError, Result};
use rayon::prelude::*;
use std::ops::Range;
use tracing::debug;

/// Number of workers a pass is split across.
pub fn worker_count(config: &EngineConfig) -> usize {
    config
        .max_threads
        .unwrap_or_else(rayon::current_num_threads)
        .max(1)
}

/// Neurons per chunk for `n` neurons over `workers` workers.
#[inline]
pub(crate) fn chunk_len(n: usize, workers: usize) -> usize {
    let workers = workers.max(1);
    if n < workers {
        1
    } else {
        n.div_ceil(workers)
    }
}

/// Contiguous index ranges covering `0..n`, one per chunk.
pub(crate) fn partition_ranges(n: usize, workers: usize) -> Vec<Range<usize>> {
    let chunk = chunk_len(n, workers);
    (0..n)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(n))
        .collect()
}

/// Run `op` on a pool sized by `config.max_threads`, or on the global pool.
pub(crate) fn with_pool<R, F>(config: &EngineConfig, op: F) -> Result<R>
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match config.max_threads {
        Some(max_threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(max_threads)
                .build()
                .map_err(|e| DeltaError::ThreadPool(e.to_string()))?;
            Ok(pool.install(op))
        }
        None => Ok(op()),
    }
}

#[inline]
fn stop_node(config: &EngineConfig) -> usize {
    if config.backsubstitute {
        INPUT_NODE
    } else {
        // Anchors are never substituted; only predecessor bounds are used.
        usize::MAX
    }
}

/// Tighten one neuron's bound from its stored expressions.
fn bound_neuron(
    engine: &Backsubstitution<'_>,
    predecessors: &[usize],
    offsets: &[usize],
    neuron: &mut Neuron,
    stop: usize,
) {
    for side in [Side::Lower, Side::Upper] {
        let expr = match side {
            Side::Lower => neuron.lexpr.as_deref(),
            Side::Upper => neuron.uexpr.as_deref(),
        };
        let Some(expr) = expr else {
            continue;
        };
        let frontier = Frontier::over_inputs(predecessors, offsets, expr);
        let outcome = engine.run(frontier, side, stop);
        match side {
            Side::Lower => {
                // Lower bounds are stored negated; intersect with the old one.
                neuron.bound.inf = neuron.bound.inf.min(-outcome.bound);
                neuron.backsubstituted_lexpr = outcome.input_expr;
            }
            Side::Upper => {
                neuron.bound.sup = neuron.bound.sup.min(outcome.bound);
                neuron.backsubstituted_uexpr = outcome.input_expr;
            }
        }
    }
}

/// Compute bounds for every neuron of `layers[layer]`.
pub(crate) fn compute_layer_bounds(
    input: &InputRegion,
    layers: &mut [Layer],
    config: &EngineConfig,
    layer: usize,
) -> Result<()> {
    let (prefix, rest) = layers.split_at_mut(layer);
    let target = &mut rest[0];
    let engine = Backsubstitution::new(input, prefix);
    let stop = stop_node(config);
    let predecessors = &target.predecessors;
    let offsets = &target.offsets;
    let neurons = &mut target.neurons;

    let n = neurons.len();
    let workers = worker_count(config);
    let work = |chunk: &mut [Neuron]| {
        for neuron in chunk {
            bound_neuron(&engine, predecessors, offsets, neuron, stop);
        }
    };

    if n < config.min_neurons_for_parallel || workers == 1 {
        debug!("Layer {}: bounding {} neurons serially", layer, n);
        work(neurons.as_mut_slice());
        return Ok(());
    }

    let chunk = chunk_len(n, workers);
    debug!(
        "Layer {}: bounding {} neurons on {} workers ({} per chunk)",
        layer, n, workers, chunk
    );
    with_pool(config, || neurons.par_chunks_mut(chunk).for_each(work))
}

/// Upper bound of each expression over the neurons of `node`.
///
/// Every result is the tighter of evaluating against `node`'s bounds and
/// backsubstituting to the input. Single-term expressions skip
/// backsubstitution.
pub(crate) fn upper_bounds_for_exprs(
    input: &InputRegion,
    layers: &[Layer],
    config: &EngineConfig,
    node: usize,
    exprs: &[LinExpr],
) -> Result<Vec<f64>> {
    let engine = Backsubstitution::new(input, layers);
    let stop = if node == INPUT_NODE {
        INPUT_NODE
    } else {
        stop_node(config)
    };
    let bound_one = |expr: &LinExpr| -> f64 {
        let stop = if expr.len() <= 1 { usize::MAX } else { stop };
        engine
            .run(Frontier::anchored(node, expr), Side::Upper, stop)
            .bound
    };

    let n = exprs.len();
    let workers = worker_count(config);
    if n < config.min_neurons_for_parallel || workers == 1 {
        return Ok(exprs.iter().map(&bound_one).collect());
    }
    let ranges = partition_ranges(n, workers);
    debug!(
        "Bounding {} expressions over node {} in {} chunks",
        n,
        node,
        ranges.len()
    );
    with_pool(config, || {
        ranges
            .into_par_iter()
            .flat_map_iter(|range| exprs[range].iter().map(&bound_one))
            .collect()
    })
}
