//! Tests for the layer graph and neuron model:
//! - layer append and predecessor validation
//! - input-space offsets of multi-predecessor layers
//! - expression sharing between the lower and upper slot
//! - input construction from a box or a symbolic enclosure

use super::*;
use ndarray::arr2;
use std::sync::Arc;

// ============================================================
// LAYER APPEND
// ============================================================

#[test]
fn test_add_layer_rejects_unknown_predecessor() {
    let mut net = network(&[(0.0, 1.0)]);
    let err = net.add_layer(1, LayerKind::Affine, &[3]).unwrap_err();
    assert_eq!(
        err,
        DeltaError::PredecessorOutOfRange {
            predecessor: 3,
            num_nodes: 1
        }
    );
    assert_eq!(net.num_layers(), 0);
}

#[test]
fn test_add_layer_checks_arity_per_kind() {
    let mut net = network(&[(0.0, 1.0)]);
    assert!(matches!(
        net.add_layer(1, LayerKind::Residual, &[0]),
        Err(DeltaError::Arity { op: "residual", got: 1, .. })
    ));
    assert!(matches!(
        net.add_layer(1, LayerKind::Affine, &[0, 0]),
        Err(DeltaError::Arity { op: "affine", got: 2, .. })
    ));
    assert!(matches!(
        net.add_layer(0, LayerKind::Concat { channels: vec![] }, &[]),
        Err(DeltaError::Arity { op: "concat", got: 0, .. })
    ));
}

#[test]
fn test_node_width_counts_input_pixels() {
    let mut net = network(&[(0.0, 1.0), (0.0, 1.0), (0.0, 1.0)]);
    assert_eq!(net.node_width(INPUT_NODE).unwrap(), 3);
    let fc = net
        .add_fully_connected(arr2(&[[1.0, 1.0, 1.0]]).view(), &[0.0], &[0])
        .unwrap();
    assert_eq!(net.node_width(fc + 1).unwrap(), 1);
    assert!(net.node_width(fc + 2).is_err());
}

#[test]
fn test_layer_out_of_range_is_rejected() {
    let net = network(&[(0.0, 1.0)]);
    assert_eq!(
        net.layer(0).unwrap_err(),
        DeltaError::LayerOutOfRange {
            layer: 0,
            num_layers: 0
        }
    );
}

// ============================================================
// INPUT-SPACE PARTITION
// ============================================================

#[test]
fn test_concat_offsets_resolve_to_source_predecessor() {
    let mut net = network(&[(0.0, 1.0), (0.0, 1.0)]);
    let a = net
        .add_fully_connected(arr2(&[[1.0, 0.0], [0.0, 1.0]]).view(), &[0.0, 0.0], &[0])
        .unwrap();
    let b = net
        .add_fully_connected(
            arr2(&[[1.0, 1.0], [1.0, -1.0], [2.0, 0.0]]).view(),
            &[0.0, 0.0, 0.0],
            &[0],
        )
        .unwrap();
    let cat = net.add_concatenation(&[a + 1, b + 1], &[2, 3]).unwrap();
    let layer = net.layer(cat).unwrap();

    assert_eq!(layer.input_width(), 5);
    assert_eq!(layer.num_channels(), Some(5));
    for k in 0..2 {
        assert_eq!(layer.locate(k), (0, k));
    }
    for k in 2..5 {
        assert_eq!(layer.locate(k), (1, k - 2));
    }
}

#[test]
fn test_residual_split_is_at_first_width() {
    let mut net = network(&[(0.0, 1.0), (0.0, 1.0)]);
    let fc = net
        .add_fully_connected(arr2(&[[1.0, 0.0], [0.0, 1.0]]).view(), &[0.0, 0.0], &[0])
        .unwrap();
    let res = net.add_residual(&[0, fc + 1]).unwrap();
    let layer = net.layer(res).unwrap();
    assert_eq!(layer.input_width(), 4);
    assert_eq!(layer.locate(1), (0, 1));
    assert_eq!(layer.locate(2), (1, 0));
    assert_eq!(layer.locate(3), (1, 1));

    let expr = layer.neurons()[1].lexpr().unwrap();
    assert_eq!(expr.dims(), Some(&[1, 3][..]));
}

// ============================================================
// EXPRESSION SHARING
// ============================================================

#[test]
fn test_shared_expression_is_released_once() {
    let mut neuron = Neuron::default();
    neuron.set_linear(LinExpr::unit(0, 1.0));
    assert!(neuron.is_linear());

    let shared = Arc::clone(neuron.lexpr().unwrap());
    assert_eq!(Arc::strong_count(&shared), 3);

    let copy = neuron.clone();
    assert_eq!(Arc::strong_count(&shared), 5);
    drop(copy);
    drop(neuron);
    assert_eq!(Arc::strong_count(&shared), 1);
}

#[test]
fn test_replacing_one_slot_breaks_sharing() {
    let mut neuron = Neuron::default();
    neuron.set_linear(LinExpr::unit(0, 1.0));
    let shared = Arc::clone(neuron.lexpr().unwrap());

    neuron.uexpr = Some(Arc::new(LinExpr::unit(0, 2.0)));
    assert!(!neuron.is_linear());
    assert_eq!(Arc::strong_count(&shared), 2);
    assert_eq!(**neuron.lexpr().unwrap(), LinExpr::unit(0, 1.0));
}

#[test]
fn test_new_neuron_is_unbounded() {
    let neuron = Neuron::default();
    assert_eq!(neuron.bound(), Interval::top());
    assert!(!neuron.is_linear());
    assert!(neuron.backsubstituted(Side::Lower).is_none());
}

// ============================================================
// INPUT CONSTRUCTION
// ============================================================

#[test]
fn test_input_box_rejects_inverted_bound() {
    let bad = [Bound {
        lower: 1.0,
        upper: 0.0,
    }];
    assert!(matches!(
        Network::from_input_box(&bad),
        Err(DeltaError::InvalidInput(_))
    ));
    let nan = [Bound {
        lower: f64::NAN,
        upper: 0.0,
    }];
    assert!(Network::from_input_box(&nan).is_err());
}

#[test]
fn test_input_poly_validates_enclosure() {
    let bounds = input_box(&[(0.0, 1.0), (0.0, 1.0)]);
    let enclosure = InputEnclosure {
        lower: vec![LinExpr::unit(0, 1.0)],
        upper: vec![LinExpr::unit(0, 1.0)],
        latent: vec![Interval::new(0.0, 1.0)],
    };
    assert!(matches!(
        Network::from_input_poly(EngineConfig::default(), &bounds, enclosure, None),
        Err(DeltaError::ShapeMismatch { .. })
    ));

    let enclosure = InputEnclosure {
        lower: vec![LinExpr::unit(0, 1.0), LinExpr::unit(2, 1.0)],
        upper: vec![LinExpr::unit(0, 1.0), LinExpr::unit(1, 1.0)],
        latent: vec![Interval::new(0.0, 1.0), Interval::new(0.0, 1.0)],
    };
    assert!(matches!(
        Network::from_input_poly(EngineConfig::default(), &bounds, enclosure, None),
        Err(DeltaError::InvalidInput(_))
    ));
}

#[test]
fn test_input_poly_validates_spatial_table() {
    let bounds = input_box(&[(0.0, 1.0), (0.0, 1.0)]);
    let enclosure = || InputEnclosure {
        lower: vec![LinExpr::unit(0, 1.0), LinExpr::unit(1, 1.0)],
        upper: vec![LinExpr::unit(0, 1.0), LinExpr::unit(1, 1.0)],
        latent: vec![Interval::new(0.0, 1.0), Interval::new(0.0, 1.0)],
    };

    let out_of_range = SpatialConstraints {
        indices: vec![0],
        neighbors: vec![2],
        gamma: 0.1,
    };
    assert!(Network::from_input_poly(
        EngineConfig::default(),
        &bounds,
        enclosure(),
        Some(out_of_range)
    )
    .is_err());

    let negative_budget = SpatialConstraints {
        indices: vec![0],
        neighbors: vec![1],
        gamma: -1.0,
    };
    assert!(Network::from_input_poly(
        EngineConfig::default(),
        &bounds,
        enclosure(),
        Some(negative_budget)
    )
    .is_err());

    let spatial = SpatialConstraints {
        indices: vec![0],
        neighbors: vec![1],
        gamma: 0.25,
    };
    let net = Network::from_input_poly(
        EngineConfig::default(),
        &bounds,
        enclosure(),
        Some(spatial.clone()),
    )
    .unwrap();
    assert_eq!(net.spatial_constraints(), Some(&spatial));
    assert!(net.input().enclosure().is_some());
}
