//! Tests for delta-propagate.

pub(crate) use crate::*;

mod config;
mod graph;
mod parallel;

/// Input box from `(lower, upper)` pairs.
pub(crate) fn input_box(bounds: &[(f64, f64)]) -> Vec<Bound> {
    bounds.iter().map(|&(l, u)| Bound::new(l, u)).collect()
}

/// Network over `bounds` with the default configuration.
pub(crate) fn network(bounds: &[(f64, f64)]) -> Network {
    Network::from_input_box(&input_box(bounds)).unwrap()
}

/// Configuration that always runs layer passes on a dedicated pool.
pub(crate) fn parallel_config(threads: usize) -> EngineConfig {
    EngineConfig {
        max_threads: Some(threads),
        min_neurons_for_parallel: 1,
        ..EngineConfig::default()
    }
}
