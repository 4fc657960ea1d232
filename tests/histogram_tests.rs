// SPDX-License-Identifier: GPL-3.0-only

//! Properties of the histogram matching error on realistic patches

use depth_vsr::Tensor4;
use ndarray::s;
use depth_vsr::model::{histogram_to_cdf, matching_error, positional_encoding, simulate_histogram};

const PITCH: usize = 4;
const TEMP_RES: usize = 256;

fn ramp_depth(b: usize, h: usize, w: usize) -> Tensor4 {
    Tensor4::from_shape_fn((b, 1, h, w), |(n, _, y, x)| {
        0.1 + 0.05 * (y + x) as f32 / (h + w) as f32 + 0.3 * n as f32
    })
}

fn guide(b: usize, h: usize, w: usize) -> Tensor4 {
    Tensor4::from_shape_fn((b, 3, h, w), |(_, c, y, x)| 0.2 + 0.1 * c as f32 + 0.01 * (y * x) as f32)
}

fn rebins(b: usize, h: usize, w: usize) -> Tensor4 {
    Tensor4::from_shape_fn((b, 4, h / PITCH, w / PITCH), |(_, k, _, _)| {
        [0.0, 30.0, 60.0, 120.0][k]
    })
}

#[test]
fn test_histogram_is_non_negative_and_collects_patch() {
    let depth = ramp_depth(2, 8, 8);
    let hist = simulate_histogram(&depth, &guide(2, 8, 8), &rebins(2, 8, 8), PITCH, TEMP_RES)
        .unwrap();
    assert_eq!(hist.dim(), (2, 4, 2, 2));
    assert!(hist.iter().all(|&v| v >= 0.0));
    // Every pixel passes the zero boundary, so every patch receives energy
    for n in 0..2 {
        for y in 0..2 {
            for x in 0..2 {
                let total: f32 = (0..4).map(|k| hist[[n, k, y, x]]).sum();
                assert!(total > 0.0);
            }
        }
    }
}

#[test]
fn test_cdf_is_monotone_and_bounded() {
    let hist = simulate_histogram(
        &ramp_depth(1, 8, 8),
        &guide(1, 8, 8),
        &rebins(1, 8, 8),
        PITCH,
        TEMP_RES,
    )
    .unwrap();
    let cdf = histogram_to_cdf(&hist);
    for y in 0..2 {
        for x in 0..2 {
            let mut previous = 0.0;
            for k in 0..4 {
                let v = cdf[[0, k, y, x]];
                assert!(v >= previous && v <= 1.0);
                previous = v;
            }
            assert!(previous > 0.99);
        }
    }
}

/// Compressed CDF as the sensor reports it: a leading zero then the cumulative bins
fn measured_cdf(depth: &Tensor4, guide: &Tensor4, rebin: &Tensor4) -> Tensor4 {
    let (b, bins, h, w) = rebin.dim();
    let boundaries = rebin.slice(s![.., ..bins - 1, .., ..]).to_owned();
    let cdf = histogram_to_cdf(
        &simulate_histogram(depth, guide, &boundaries, PITCH, TEMP_RES).unwrap(),
    );
    Tensor4::from_shape_fn((b, bins, h, w), |(n, k, y, x)| {
        if k == 0 { 0.0 } else { cdf[[n, k - 1, y, x]] }
    })
}

fn mean(t: &Tensor4) -> f32 {
    t.iter().sum::<f32>() / t.len() as f32
}

#[test]
fn test_error_grows_away_from_measured_depth() {
    let depth = ramp_depth(1, 8, 8);
    let guide = guide(1, 8, 8);
    let rebin = rebins(1, 8, 8);
    let measured = measured_cdf(&depth, &guide, &rebin);

    let near = matching_error(&measured, &rebin, &depth, &guide, PITCH, TEMP_RES).unwrap();
    assert_eq!(near.dim(), (1, 1, 8, 8));
    assert!(near.iter().all(|&v| v >= 0.0));

    let shifted = &depth + 0.3;
    let far = matching_error(&measured, &rebin, &shifted, &guide, PITCH, TEMP_RES).unwrap();
    assert!(mean(&far) > mean(&near) + 1.0);
}

#[test]
fn test_unmeasured_patches_use_sentinel() {
    let depth = ramp_depth(1, 8, 8);
    let guide = guide(1, 8, 8);
    let rebin = rebins(1, 8, 8);
    let mut measured = measured_cdf(&depth, &guide, &rebin);
    for k in 0..4 {
        measured[[0, k, 1, 0]] = 0.0;
    }
    let error = matching_error(&measured, &rebin, &depth, &guide, PITCH, TEMP_RES).unwrap();
    for y in PITCH..2 * PITCH {
        for x in 0..PITCH {
            assert_eq!(error[[0, 0, y, x]], -1.0);
        }
    }
    assert!(error[[0, 0, 0, 0]] >= 0.0);
}

#[test]
fn test_positional_encoding_anchors_repeat_per_patch() {
    let pos = positional_encoding(1, 2, 8, 8, PITCH).unwrap();
    assert_eq!(pos.dim(), (1, 2, 6, 8, 8));
    assert_eq!(pos[[0, 1, 4, 5, 3]], 0.5);
    assert_eq!(pos[[0, 1, 4, 7, 3]], 0.5);
    assert_eq!(pos[[0, 0, 2, 6, 0]], 0.5);
    assert_eq!(pos[[0, 0, 5, 0, 3]], 0.0);
}
