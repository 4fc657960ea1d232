// SPDX-License-Identifier: GPL-3.0-only

//! Histogram matching error between a predicted depth map and dToF statistics
//!
//! A predicted depth map is turned into the histogram the sensor would have
//! recorded: every pixel returns light proportional to its albedo over the
//! squared distance, lands in the compressed bin its depth falls into, and
//! pixels are sum-pooled per sensor patch. Comparing the cumulative form of
//! that histogram against the measured compressed CDF yields a per-pixel error
//! that tells the refinement stage where stage 1 disagrees with the sensor.

use crate::constants::{CDF_EPS, INTENSITY_EPS, MISSING_MEASUREMENT, POS_ENCODING_CHANNELS};
use crate::errors::{DepthError, DepthResult};
use crate::tensor::{Tensor4, Tensor5, upsample_nearest};
use ndarray::{Axis, s};

fn check_patch_layout(
    context: &'static str,
    full: &Tensor4,
    sensor: &Tensor4,
    pitch: usize,
) -> DepthResult<()> {
    let (n, _, h, w) = full.dim();
    let (sn, _, sh, sw) = sensor.dim();
    if pitch == 0 || sn != n || sh * pitch != h || sw * pitch != w {
        return Err(DepthError::shape(
            context,
            format!("{}×C×{}×{} (pitch {})", n, h / pitch.max(1), w / pitch.max(1), pitch),
            sensor.shape(),
        ));
    }
    Ok(())
}

/// Simulated sensor histogram of a depth map
///
/// * `depth`: `B×1×H×W`, normalised to `[0, 1]` (values outside are clamped)
/// * `guide`: `B×C×H×W`; its channel mean is used as albedo
/// * `rebin`: `B×M×(H/pitch)×(W/pitch)` non-decreasing bin boundaries
///
/// Returns `B×M×(H/pitch)×(W/pitch)`: bin `j` of a patch sums the intensity of
/// every pixel whose quantised depth passes exactly `j + 1` boundaries.
pub fn simulate_histogram(
    depth: &Tensor4,
    guide: &Tensor4,
    rebin: &Tensor4,
    pitch: usize,
    temp_res: usize,
) -> DepthResult<Tensor4> {
    let (b, dc, h, w) = depth.dim();
    let (gb, gc, gh, gw) = guide.dim();
    if dc != 1 || gc == 0 || (gb, gh, gw) != (b, h, w) {
        return Err(DepthError::shape(
            "simulate_histogram guide",
            format!("{}×C×{}×{} guide for a 1-channel depth", b, h, w),
            guide.shape(),
        ));
    }
    check_patch_layout("simulate_histogram rebin", depth, rebin, pitch)?;

    let bins = rebin.dim().1;
    let levels = temp_res.saturating_sub(1) as f32;
    let mut hist = Tensor4::zeros(rebin.raw_dim());
    for n in 0..b {
        for y in 0..h {
            for x in 0..w {
                let d = depth[[n, 0, y, x]].clamp(0.0, 1.0);
                let albedo = guide.slice(s![n, .., y, x]).sum() / gc as f32;
                let intensity = albedo / (INTENSITY_EPS + d * d);
                let bin = (d * levels).round_ties_even();
                let (py, px) = (y / pitch, x / pitch);
                let passed = (0..bins)
                    .filter(|&k| bin - rebin[[n, k, py, px]] >= 0.0)
                    .count();
                if passed > 0 {
                    hist[[n, passed - 1, py, px]] += intensity;
                }
            }
        }
    }
    Ok(hist)
}

/// Normalise a histogram over its bins (`sum + 1e-3`) and accumulate it
pub fn histogram_to_cdf(hist: &Tensor4) -> Tensor4 {
    let mut cdf = hist.clone();
    for mut lane in cdf.lanes_mut(Axis(1)) {
        let total = lane.sum() + CDF_EPS;
        let mut running = 0.0;
        for v in lane.iter_mut() {
            running += *v / total;
            *v = running;
        }
    }
    cdf
}

/// Per-pixel histogram matching error at full resolution
///
/// * `cdf`, `rebin`: `B×M×h×w` measured compressed CDF and its bin boundaries
/// * `pred`: `B×1×H×W` predicted depth, `guide`: `B×C×H×W`
///
/// Patches whose measured CDF is all zero carry no measurement and are set to
/// exactly −1. The error map is nearest-upsampled by `pitch` to `B×1×H×W`.
pub fn matching_error(
    cdf: &Tensor4,
    rebin: &Tensor4,
    pred: &Tensor4,
    guide: &Tensor4,
    pitch: usize,
    temp_res: usize,
) -> DepthResult<Tensor4> {
    if cdf.dim() != rebin.dim() || cdf.dim().1 < 2 {
        return Err(DepthError::shape(
            "matching_error cdf",
            format!("same shape as rebin {:?} with at least 2 bins", rebin.shape()),
            cdf.shape(),
        ));
    }
    check_patch_layout("matching_error cdf", pred, cdf, pitch)?;

    let (b, bins, h, w) = cdf.dim();
    let boundaries = rebin.slice(s![.., ..bins - 1, .., ..]).to_owned();
    let cdf_pred = histogram_to_cdf(&simulate_histogram(pred, guide, &boundaries, pitch, temp_res)?);

    let mut error = Tensor4::zeros((b, 1, h, w));
    for n in 0..b {
        for y in 0..h {
            for x in 0..w {
                let measured = cdf.slice(s![n, .., y, x]);
                let peak = measured.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                let scale = peak + CDF_EPS;
                if measured.iter().map(|v| v / scale).fold(f32::NEG_INFINITY, f32::max) == 0.0 {
                    error[[n, 0, y, x]] = MISSING_MEASUREMENT;
                    continue;
                }
                let total: f32 = (0..bins - 1)
                    .map(|k| {
                        let delta = rebin[[n, k + 1, y, x]] - rebin[[n, k, y, x]];
                        ((measured[k + 1] / scale - cdf_pred[[n, k, y, x]]) * delta).abs()
                    })
                    .sum();
                error[[n, 0, y, x]] = total / (bins - 1) as f32;
            }
        }
    }
    Ok(upsample_nearest(&error, pitch))
}

/// Six-channel positional encoding broadcast to `N×T×6×H×W`
///
/// Channels: `y/H`, `x/W`, offset inside the `pitch×pitch` patch (`/pitch`),
/// and the patch anchor (`py/H`, `px/W`).
pub fn positional_encoding(
    n: usize,
    t: usize,
    h: usize,
    w: usize,
    pitch: usize,
) -> DepthResult<Tensor5> {
    if pitch == 0 || h % pitch != 0 || w % pitch != 0 {
        return Err(DepthError::shape(
            "positional_encoding",
            format!("H and W divisible by {}", pitch),
            &[h, w],
        ));
    }
    let (hf, wf, pf) = (h as f32, w as f32, pitch as f32);
    Ok(Tensor5::from_shape_fn(
        (n, t, POS_ENCODING_CHANNELS, h, w),
        |(_, _, c, y, x)| {
            let (py, px) = (y - y % pitch, x - x % pitch);
            match c {
                0 => y as f32 / hf,
                1 => x as f32 / wf,
                2 => (y - py) as f32 / pf,
                3 => (x - px) as f32 / pf,
                4 => py as f32 / hf,
                _ => px as f32 / wf,
            }
        },
    ))
}
