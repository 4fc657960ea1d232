// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for configuration loading

use depth_vsr::{Config, DepthError, DevicePreference, RefineSignal};
use std::path::PathBuf;

#[test]
fn test_config_round_trips_through_json() {
    let config = Config {
        mid_channels: 32,
        refine_signal: RefineSignal::DepthConfidence,
        device: DevicePreference::Auto,
        pretrained: Some(PathBuf::from("weights/dvsr.safetensors")),
        ..Config::default()
    };
    let json = config.to_json().unwrap();
    assert_eq!(Config::from_json_str(&json).unwrap(), config);
}

#[test]
fn test_config_loads_from_file() {
    let dir = std::env::temp_dir().join(format!("depth-vsr-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.json");
    std::fs::write(
        &path,
        r#"{ "scale": 8, "refine_signal": "HistogramFeedback", "flow_pretrained": null }"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.scale, 8);
    assert_eq!(config.flow_pretrained, None);
    assert_eq!(config.sensor_repeat(), 2);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_invalid_file_is_a_config_error() {
    let err = Config::from_json_str(r#"{ "scale": 10 }"#).unwrap_err();
    assert!(matches!(err, DepthError::Config(_)));

    let err = Config::from_json_str(r#"{ "flow_pretrained": ["a"] }"#).unwrap_err();
    assert!(err.to_string().contains("array"), "{}", err);

    let err = Config::from_json_str("{ not json").unwrap_err();
    assert!(matches!(err, DepthError::Config(_)));
}

#[test]
fn test_missing_file_is_an_io_error() {
    let err = Config::load(&PathBuf::from("/nonexistent/depth-vsr/config.json")).unwrap_err();
    assert!(matches!(err, DepthError::Io(_)));
}

#[test]
fn test_odd_deform_groups_rejected() {
    let config = Config {
        mid_channels: 6,
        deform_groups: 3,
        ..Config::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_default_path_points_to_app_dir() {
    if let Some(path) = Config::default_path() {
        assert!(path.ends_with("depth-vsr/config.json"));
    }
}
