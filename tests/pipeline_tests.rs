// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end tests of the two-stage model on small sequences

use depth_vsr::errors::WeightsError;
use depth_vsr::nn::{External, FlowNetwork};
use depth_vsr::sequence::sequence_bytes;
use depth_vsr::{
    Config, DepthError, DepthResult, HierarchicalDepthModel, Observation, OffloadPolicy,
    RefineSignal, SensorObservation, Stage, Tensor4, Tensor5,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const SCALE: usize = 8;

fn small_config() -> Config {
    Config {
        mid_channels: 4,
        num_blocks: 1,
        scale: SCALE,
        deform_groups: 2,
        ..Config::default()
    }
}

/// Flow from the brightness difference of the first channel, counting frame pairs
struct BrightnessFlow {
    pairs: Arc<AtomicUsize>,
}

impl FlowNetwork for BrightnessFlow {
    fn estimate(&self, reference: &Tensor4, supporting: &Tensor4) -> DepthResult<Tensor4> {
        let (n, _, h, w) = reference.dim();
        self.pairs.fetch_add(n, Ordering::Relaxed);
        Ok(Tensor4::from_shape_fn((n, 2, h, w), |(b, c, y, x)| {
            let diff = reference[[b, 0, y, x]] - supporting[[b, 0, y, x]];
            if c == 0 { diff } else { -0.5 * diff }
        }))
    }
}

/// Model with stub flow networks in both stages, returning the pair counter
fn stub_model(config: Config) -> (HierarchicalDepthModel, Arc<AtomicUsize>) {
    let pairs = Arc::new(AtomicUsize::new(0));
    let mut model = HierarchicalDepthModel::new(config).unwrap();
    for stage in [Stage::Initial, Stage::Refine] {
        model.set_flow_network(
            stage,
            Box::new(External(BrightnessFlow {
                pairs: Arc::clone(&pairs),
            })),
        );
    }
    (model, pairs)
}

/// Frame `t` of every tensor is driven by `phase[t]`
fn guides(n: usize, phase: &[f32], h: usize, w: usize) -> Tensor5 {
    Tensor5::from_shape_fn(
        (n, phase.len(), 3, h * SCALE, w * SCALE),
        |(b, t, c, y, x)| {
            0.2 + 0.1 * c as f32 + 0.02 * ((x + y) as f32 + phase[t] * 3.0) + 0.05 * b as f32
        },
    )
}

fn histogram_observation(n: usize, phase: &[f32], h: usize, w: usize) -> Observation {
    let temp_res = Config::default().temp_res as f32;
    let peaks = Tensor5::from_shape_fn((n, phase.len(), 1, h, w), |(b, t, _, y, x)| {
        (200.0 + 40.0 * phase[t] + 25.0 * (y + x) as f32 + 10.0 * b as f32).min(temp_res - 1.0)
    });
    let cdfs = Tensor5::from_shape_fn((n, phase.len(), 4, h, w), |(_, _, k, y, _)| {
        if y == 0 && k == 0 { 0.0 } else { (k + 1) as f32 / 4.0 }
    });
    let rebins = Tensor5::from_shape_fn((n, phase.len(), 4, h, w), |(_, t, k, _, x)| {
        150.0 * (k + 1) as f32 + 10.0 * phase[t] + x as f32
    });
    Observation::Histogram(SensorObservation::new(peaks, cdfs, rebins).unwrap())
}

fn assert_close(a: &Tensor5, b: &Tensor5, tol: f32) {
    assert_eq!(a.dim(), b.dim());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() <= tol, "{} vs {}", x, y);
    }
}

#[test]
fn test_outputs_have_guide_resolution() {
    let (model, _) = stub_model(small_config());
    let phase = [0.0, 1.0, 2.0];
    let output = model
        .forward(&histogram_observation(2, &phase, 2, 3), &guides(2, &phase, 2, 3))
        .unwrap();
    let expected = (2, 3, 1, 2 * SCALE, 3 * SCALE);
    for tensor in [
        &output.depth,
        &output.stage1_depth,
        &output.stage2_depth,
        &output.stage1_weight,
        &output.stage2_weight,
    ] {
        assert_eq!(tensor.dim(), expected);
        assert!(tensor.iter().all(|v| v.is_finite()));
    }
}

#[test]
fn test_blend_is_convex_combination_of_stages() {
    let (model, _) = stub_model(small_config());
    let phase = [0.0, 2.0];
    let output = model
        .forward(&histogram_observation(1, &phase, 2, 2), &guides(1, &phase, 2, 2))
        .unwrap();
    let blended = &output.stage1_depth * &output.stage1_weight
        + &output.stage2_depth * &output.stage2_weight;
    assert_close(&output.depth, &blended, 1e-5);
    for (w1, w2) in output.stage1_weight.iter().zip(output.stage2_weight.iter()) {
        assert!((w1 + w2 - 1.0).abs() < 1e-5);
    }
}

#[test]
fn test_mirrored_sequence_estimates_half_the_flows() {
    let (model, pairs) = stub_model(small_config());
    let phase = [0.0, 1.0, 3.0, 4.0];
    model
        .forward(&histogram_observation(1, &phase, 2, 2), &guides(1, &phase, 2, 2))
        .unwrap();
    // Both directions in both stages
    assert_eq!(pairs.swap(0, Ordering::Relaxed), 2 * 2 * 3);

    let mirrored = [0.0, 1.0, 1.0, 0.0];
    model
        .forward(
            &histogram_observation(1, &mirrored, 2, 2),
            &guides(1, &mirrored, 2, 2),
        )
        .unwrap();
    assert_eq!(pairs.load(Ordering::Relaxed), 2 * 3);
}

#[test]
fn test_evaluation_is_deterministic() {
    let (model, _) = stub_model(small_config());
    let phase = [0.0, 1.0, 2.0];
    let observation = histogram_observation(1, &phase, 2, 2);
    let guides = guides(1, &phase, 2, 2);
    let first = model.forward(&observation, &guides).unwrap();
    let second = model.forward(&observation, &guides).unwrap();
    assert_eq!(first.depth, second.depth);
    assert_eq!(first.stage2_weight, second.stage2_weight);
}

#[test]
fn test_offload_matches_resident_evaluation() {
    let phase = [0.0, 1.0, 2.0, 4.0];
    let observation = histogram_observation(1, &phase, 2, 2);
    let guides = guides(1, &phase, 2, 2);

    let (resident, _) = stub_model(small_config());
    let resident = resident.with_offload_policy(OffloadPolicy::Never);
    let (offloaded, _) = stub_model(small_config());
    let offloaded = offloaded.with_offload_policy(OffloadPolicy::Always);

    let a = resident.forward(&observation, &guides).unwrap();
    let b = offloaded.forward(&observation, &guides).unwrap();
    assert_close(&a.depth, &b.depth, 1e-4);
    assert_close(&a.stage1_weight, &b.stage1_weight, 1e-4);
}

#[test]
fn test_single_frame_sequence() {
    let (model, pairs) = stub_model(small_config());
    let phase = [1.0];
    let output = model
        .forward(&histogram_observation(1, &phase, 2, 2), &guides(1, &phase, 2, 2))
        .unwrap();
    assert_eq!(output.depth.dim(), (1, 1, 1, 2 * SCALE, 2 * SCALE));
    assert_eq!(pairs.load(Ordering::Relaxed), 0);
}

#[test]
fn test_depth_confidence_variant() {
    let config = Config {
        refine_signal: RefineSignal::DepthConfidence,
        ..small_config()
    };
    let (model, _) = stub_model(config);
    let phase = [0.0, 1.0];
    let lqs = Tensor5::from_shape_fn((1, 2, 1, 2, 2), |(_, t, _, y, x)| {
        0.3 + 0.1 * t as f32 + 0.05 * (y + x) as f32
    });
    let output = model
        .forward(&Observation::Depth(lqs), &guides(1, &phase, 2, 2))
        .unwrap();
    assert_eq!(output.depth.dim(), (1, 2, 1, 2 * SCALE, 2 * SCALE));

    // A histogram observation does not fit this variant
    let err = model
        .forward(&histogram_observation(1, &phase, 2, 2), &guides(1, &phase, 2, 2))
        .unwrap_err();
    assert!(matches!(err, DepthError::Config(_)));
}

#[test]
fn test_guides_must_match_sensor_scale() {
    let (model, _) = stub_model(small_config());
    let phase = [0.0, 1.0];
    let wrong = Tensor5::zeros((1, 2, 3, 2 * SCALE, 2 * SCALE + 4));
    assert!(matches!(
        model.forward(&histogram_observation(1, &phase, 2, 2), &wrong),
        Err(DepthError::Shape(_))
    ));
}

#[test]
fn test_exported_weights_reproduce_outputs() {
    let phase = [0.0, 1.0, 2.0];
    let observation = histogram_observation(1, &phase, 2, 2);
    let guides = guides(1, &phase, 2, 2);

    let (mut source, _) = stub_model(Config {
        seed: 1,
        ..small_config()
    });
    let (mut target, _) = stub_model(Config {
        seed: 2,
        ..small_config()
    });
    let expected = source.forward(&observation, &guides).unwrap();
    assert_ne!(target.forward(&observation, &guides).unwrap().depth, expected.depth);

    let bytes = source.state_dict_bytes().unwrap();
    target.load_weights_from_bytes(&bytes).unwrap();
    let reloaded = target.forward(&observation, &guides).unwrap();
    assert_close(&reloaded.depth, &expected.depth, 1e-6);
}

#[test]
fn test_strict_loading_reports_missing_tensors() {
    let (mut model, _) = stub_model(small_config());
    let empty = sequence_bytes(&[]).unwrap();
    assert!(matches!(
        model.load_weights_from_bytes(&empty),
        Err(DepthError::Weights(WeightsError::MissingTensor(_)))
    ));

    let (mut lenient, _) = stub_model(Config {
        strict_load: false,
        ..small_config()
    });
    lenient.load_weights_from_bytes(&empty).unwrap();
}

#[test]
fn test_checkpoint_for_other_width_rejected() {
    let (mut wide, _) = stub_model(Config {
        mid_channels: 8,
        ..small_config()
    });
    let (mut narrow, _) = stub_model(small_config());
    let bytes = wide.state_dict_bytes().unwrap();
    assert!(matches!(
        narrow.load_weights_from_bytes(&bytes),
        Err(DepthError::Weights(WeightsError::ShapeMismatch { .. }))
    ));
}

#[test]
fn test_learned_flow_network_end_to_end() {
    let model = HierarchicalDepthModel::new(small_config()).unwrap();
    let phase = [0.0, 1.0];
    let output = model
        .forward(&histogram_observation(1, &phase, 2, 2), &guides(1, &phase, 2, 2))
        .unwrap();
    assert_eq!(output.depth.dim(), (1, 2, 1, 2 * SCALE, 2 * SCALE));
    assert!(output.depth.iter().all(|v| v.is_finite()));
}
