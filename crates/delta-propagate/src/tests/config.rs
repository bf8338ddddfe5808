//! Tests for configuration and geometry serialization.

use super::*;
use ndarray::Array4;

// ============================================================
// ENGINE CONFIG
// ============================================================

#[test]
fn test_partial_config_fills_defaults() {
    let config: EngineConfig = serde_json::from_str(r#"{"relu_lower": "Area"}"#).unwrap();
    assert_eq!(
        config,
        EngineConfig {
            relu_lower: ReluLowerSlope::Area,
            ..EngineConfig::default()
        }
    );

    let empty: EngineConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(empty, EngineConfig::default());
}

#[test]
fn test_config_round_trip() {
    let config = EngineConfig {
        max_threads: Some(3),
        min_neurons_for_parallel: 16,
        relu_lower: ReluLowerSlope::Area,
        backsubstitute: false,
    };
    let json = serde_json::to_string(&config).unwrap();
    let back: EngineConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
}

#[test]
fn test_config_rejects_malformed_field() {
    assert!(serde_json::from_str::<EngineConfig>(r#"{"max_threads": "four"}"#).is_err());
    assert!(serde_json::from_str::<EngineConfig>(r#"{"relu_lower": "Steep"}"#).is_err());
}

#[test]
fn test_deserialized_config_drives_network() {
    let config: EngineConfig = serde_json::from_str(r#"{"backsubstitute": false}"#).unwrap();
    // x0 - x1 then + x1: exact with backsubstitution, loose without.
    let mut net = Network::with_config(config, &input_box(&[(0.0, 1.0), (0.0, 1.0)])).unwrap();
    let fc = net
        .add_fully_connected(ndarray::arr2(&[[1.0, -1.0], [0.0, 1.0]]).view(), &[0.0, 0.0], &[0])
        .unwrap();
    let sum = net
        .add_fully_connected(ndarray::arr2(&[[1.0, 1.0]]).view(), &[0.0], &[fc + 1])
        .unwrap();
    assert!(!net.config().backsubstitute);
    assert_eq!(net.box_for_neuron(sum, 0).unwrap(), Bound::new(-1.0, 2.0));
}

#[test]
fn test_side_serializes_as_variant_name() {
    assert_eq!(serde_json::to_string(&Side::Upper).unwrap(), r#""Upper""#);
    let side: Side = serde_json::from_str(r#""Lower""#).unwrap();
    assert_eq!(side, Side::Lower);
}

// ============================================================
// CONVOLUTION GEOMETRY
// ============================================================

#[test]
fn test_conv_geometry_from_json() {
    let json = r#"{
        "input": [2, 2, 1],
        "strides": [1, 1],
        "padding": {"top": 1, "left": 1, "bottom": 1, "right": 1}
    }"#;
    let geometry: ConvGeometry = serde_json::from_str(json).unwrap();
    assert_eq!(geometry.padding, Padding::uniform(1));
    assert_eq!(geometry.output_hw([2, 2]), Some([3, 3]));

    let mut net = network(&[(0.0, 1.0); 4]);
    let filters = Array4::from_elem((2, 2, 1, 1), 1.0);
    let conv = net
        .add_convolution(filters.view(), None, geometry, &[0])
        .unwrap();
    assert_eq!(net.num_neurons(conv).unwrap(), 9);
}

#[test]
fn test_padding_requires_every_side() {
    assert!(serde_json::from_str::<Padding>(r#"{"top": 1, "left": 1}"#).is_err());
    let asymmetric = Padding {
        top: 0,
        left: 2,
        bottom: 1,
        right: 0,
    };
    let json = serde_json::to_string(&asymmetric).unwrap();
    assert_eq!(serde_json::from_str::<Padding>(&json).unwrap(), asymmetric);
}
