//! Tests for the parallel bound driver.

use super::*;
use crate::parallel::{chunk_len, partition_ranges};
use ndarray::Array2;

/// Deterministic weights in `[-1, 1]` without a random source.
fn weights(rows: usize, cols: usize, seed: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        let v = ((i * 31 + j * 17 + seed * 7) % 23) as f64;
        v / 11.0 - 1.0
    })
}

fn stack(config: EngineConfig) -> Network {
    let bounds = input_box(&vec![(-0.5, 0.5); 6]);
    let mut net = Network::with_config(config, &bounds).unwrap();
    let mut pred = 0;
    for (depth, width) in [12, 9, 4].into_iter().enumerate() {
        let cols = net.node_width(pred).unwrap();
        let fc = net
            .add_fully_connected(weights(width, cols, depth).view(), &vec![0.1; width], &[pred])
            .unwrap();
        let relu = net.add_relu(&[fc + 1]).unwrap();
        pred = relu + 1;
    }
    net
}

// ============================================================
// WORK PARTITION
// ============================================================

#[test]
fn test_chunk_len() {
    assert_eq!(chunk_len(10, 4), 3);
    assert_eq!(chunk_len(8, 4), 2);
    assert_eq!(chunk_len(3, 4), 1);
    assert_eq!(chunk_len(5, 0), 5);
}

#[test]
fn test_partition_ranges_cover_all_neurons() {
    assert_eq!(partition_ranges(10, 4), vec![0..3, 3..6, 6..9, 9..10]);
    assert_eq!(partition_ranges(2, 8), vec![0..1, 1..2]);
    assert!(partition_ranges(0, 4).is_empty());

    let ranges = partition_ranges(1000, 7);
    assert_eq!(ranges.first().map(|r| r.start), Some(0));
    assert_eq!(ranges.last().map(|r| r.end), Some(1000));
    assert!(ranges.windows(2).all(|w| w[0].end == w[1].start));
}

#[test]
fn test_worker_count_honours_max_threads() {
    assert_eq!(worker_count(&parallel_config(3)), 3);
    assert_eq!(worker_count(&parallel_config(0)), 1);
    assert!(worker_count(&EngineConfig::default()) >= 1);
}

// ============================================================
// DETERMINISM
// ============================================================

#[test]
fn test_parallel_matches_serial() {
    let serial = stack(EngineConfig {
        max_threads: Some(1),
        ..EngineConfig::default()
    });
    for threads in [2, 3, 8] {
        let parallel = stack(parallel_config(threads));
        for layer in 0..serial.num_layers() {
            assert_eq!(
                serial.box_for_layer(layer).unwrap(),
                parallel.box_for_layer(layer).unwrap(),
                "layer {layer} with {threads} threads"
            );
        }
    }
}

#[test]
fn test_parallel_upper_bounds_match_serial() {
    let serial = stack(EngineConfig {
        max_threads: Some(1),
        ..EngineConfig::default()
    });
    let parallel = stack(parallel_config(4));
    let layer = serial.output_layer().unwrap();
    let exprs: Vec<LinExpr> = (0..4)
        .flat_map(|y| {
            (0..4)
                .filter(move |&x| x != y)
                .map(move |x| LinExpr::sparse_scalars(&[1.0, -1.0], &[y, x], 0.0))
        })
        .collect();
    assert_eq!(
        serial.upper_bounds_for_exprs(layer, &exprs).unwrap(),
        parallel.upper_bounds_for_exprs(layer, &exprs).unwrap()
    );
}

#[test]
fn test_rerun_on_pool_is_stable() {
    let mut net = stack(parallel_config(4));
    let before: Vec<Vec<Bound>> = (0..net.num_layers())
        .map(|l| net.box_for_layer(l).unwrap())
        .collect();
    net.run_bound_pass().unwrap();
    for (layer, old) in before.iter().enumerate() {
        let new = net.box_for_layer(layer).unwrap();
        for (o, n) in old.iter().zip(&new) {
            assert!(n.lower >= o.lower && n.upper <= o.upper);
        }
    }
}
