// SPDX-License-Identifier: GPL-3.0-only

//! Spatial resampling kernels
//!
//! - flow warping (bilinear sampling at `(x + dx, y + dy)`)
//! - bilinear and bicubic resizing with PyTorch's coordinate conventions
//! - nearest (repeat) upsampling and 2×2 average pooling

use super::Tensor4;
use crate::constants::BICUBIC_A;
use crate::errors::{DepthError, DepthResult};

/// Out-of-bounds behaviour of [`flow_warp`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Samples outside the frame read zero
    Zeros,
    /// Sample coordinates are clamped to the frame
    Border,
}

/// Bilinear sample of one plane at fractional `(sy, sx)` with zero padding
#[inline]
pub(crate) fn sample_zeros(plane: &[f32], height: usize, width: usize, sy: f32, sx: f32) -> f32 {
    let x0 = sx.floor();
    let y0 = sy.floor();
    let wx1 = sx - x0;
    let wy1 = sy - y0;
    let (x0, y0) = (x0 as isize, y0 as isize);
    let mut acc = 0.0;
    for (dy, wy) in [(0, 1.0 - wy1), (1, wy1)] {
        let y = y0 + dy;
        if y < 0 || y >= height as isize {
            continue;
        }
        for (dx, wx) in [(0, 1.0 - wx1), (1, wx1)] {
            let x = x0 + dx;
            if x < 0 || x >= width as isize {
                continue;
            }
            acc += wy * wx * plane[y as usize * width + x as usize];
        }
    }
    acc
}

/// Warp `input` by a per-pixel displacement field
///
/// `flow` is `N×2×H×W` with channel 0 = dx and channel 1 = dy in pixels; the
/// output at `(y, x)` samples the input at `(y + dy, x + dx)`.
pub fn flow_warp(input: &Tensor4, flow: &Tensor4, padding: Padding) -> DepthResult<Tensor4> {
    let (n, c, h, w) = input.dim();
    if flow.dim() != (n, 2, h, w) {
        return Err(DepthError::shape(
            "flow_warp",
            format!("flow of {}×2×{}×{}", n, h, w),
            flow.shape(),
        ));
    }
    let input = input.as_standard_layout();
    let data = input
        .as_slice()
        .ok_or_else(|| DepthError::Other("flow_warp input is not contiguous".into()))?;
    let plane = h * w;
    let mut output = Tensor4::zeros((n, c, h, w));
    for b in 0..n {
        for y in 0..h {
            for x in 0..w {
                // A unit-length axis always samples index 0
                let mut sx = if w > 1 { x as f32 + flow[[b, 0, y, x]] } else { 0.0 };
                let mut sy = if h > 1 { y as f32 + flow[[b, 1, y, x]] } else { 0.0 };
                if padding == Padding::Border {
                    sx = sx.clamp(0.0, (w - 1) as f32);
                    sy = sy.clamp(0.0, (h - 1) as f32);
                }
                for ch in 0..c {
                    let offset = (b * c + ch) * plane;
                    output[[b, ch, y, x]] =
                        sample_zeros(&data[offset..offset + plane], h, w, sy, sx);
                }
            }
        }
    }
    Ok(output)
}

/// Source index pair and weights of linear interpolation along one axis
fn linear_taps(input: usize, output: usize, align_corners: bool) -> Vec<(usize, usize, f32)> {
    (0..output)
        .map(|dst| {
            let src = if align_corners {
                if output > 1 {
                    dst as f32 * (input - 1) as f32 / (output - 1) as f32
                } else {
                    0.0
                }
            } else {
                let scale = input as f32 / output as f32;
                ((dst as f32 + 0.5) * scale - 0.5).max(0.0)
            };
            let i0 = (src.floor() as usize).min(input - 1);
            let i1 = (i0 + 1).min(input - 1);
            (i0, i1, src - i0 as f32)
        })
        .collect()
}

/// Bilinear resize to `out_h×out_w`
pub fn resize_bilinear(
    input: &Tensor4,
    out_h: usize,
    out_w: usize,
    align_corners: bool,
) -> Tensor4 {
    let (n, c, h, w) = input.dim();
    let ys = linear_taps(h, out_h, align_corners);
    let xs = linear_taps(w, out_w, align_corners);
    let mut output = Tensor4::zeros((n, c, out_h, out_w));
    for b in 0..n {
        for ch in 0..c {
            let src = input.slice(ndarray::s![b, ch, .., ..]);
            for (oy, &(y0, y1, ly)) in ys.iter().enumerate() {
                for (ox, &(x0, x1, lx)) in xs.iter().enumerate() {
                    let top = src[[y0, x0]] * (1.0 - lx) + src[[y0, x1]] * lx;
                    let bottom = src[[y1, x0]] * (1.0 - lx) + src[[y1, x1]] * lx;
                    output[[b, ch, oy, ox]] = top * (1.0 - ly) + bottom * ly;
                }
            }
        }
    }
    output
}

/// Cubic convolution weights for fractional offset `t` (taps at -1, 0, 1, 2)
fn cubic_weights(t: f32) -> [f32; 4] {
    let a = BICUBIC_A;
    let near = |x: f32| ((a + 2.0) * x - (a + 3.0)) * x * x + 1.0;
    let far = |x: f32| ((a * x - 5.0 * a) * x + 8.0 * a) * x - 4.0 * a;
    [far(t + 1.0), near(t), near(1.0 - t), far(2.0 - t)]
}

/// Source taps and weights of cubic interpolation along one axis (`align_corners = false`)
fn cubic_taps(input: usize, output: usize) -> Vec<([usize; 4], [f32; 4])> {
    let scale = input as f32 / output as f32;
    let last = input as isize - 1;
    (0..output)
        .map(|dst| {
            let src = (dst as f32 + 0.5) * scale - 0.5;
            let base = src.floor();
            let weights = cubic_weights(src - base);
            let base = base as isize;
            let idx = [-1, 0, 1, 2].map(|k| (base + k).clamp(0, last) as usize);
            (idx, weights)
        })
        .collect()
}

/// Bicubic resize to `out_h×out_w` (`align_corners = false`, border-replicated taps)
pub fn resize_bicubic(input: &Tensor4, out_h: usize, out_w: usize) -> Tensor4 {
    let (n, c, h, w) = input.dim();
    let ys = cubic_taps(h, out_h);
    let xs = cubic_taps(w, out_w);
    let mut output = Tensor4::zeros((n, c, out_h, out_w));
    let mut rows = vec![0.0f32; h * out_w];
    for b in 0..n {
        for ch in 0..c {
            let src = input.slice(ndarray::s![b, ch, .., ..]);
            // Horizontal pass into `rows`, then vertical pass into the output
            for y in 0..h {
                for (ox, (idx, wts)) in xs.iter().enumerate() {
                    rows[y * out_w + ox] = (0..4).map(|k| src[[y, idx[k]]] * wts[k]).sum();
                }
            }
            for (oy, (idx, wts)) in ys.iter().enumerate() {
                for ox in 0..out_w {
                    output[[b, ch, oy, ox]] =
                        (0..4).map(|k| rows[idx[k] * out_w + ox] * wts[k]).sum();
                }
            }
        }
    }
    output
}

/// Repeat every pixel `factor×factor` times
pub fn upsample_nearest(input: &Tensor4, factor: usize) -> Tensor4 {
    let (n, c, h, w) = input.dim();
    Tensor4::from_shape_fn((n, c, h * factor, w * factor), |(b, ch, y, x)| {
        input[[b, ch, y / factor, x / factor]]
    })
}

/// 2×2 average pooling with stride 2 (odd trailing rows/columns are dropped)
pub fn avg_pool2(input: &Tensor4) -> Tensor4 {
    let (n, c, h, w) = input.dim();
    Tensor4::from_shape_fn((n, c, h / 2, w / 2), |(b, ch, y, x)| {
        let (y, x) = (2 * y, 2 * x);
        0.25 * (input[[b, ch, y, x]]
            + input[[b, ch, y, x + 1]]
            + input[[b, ch, y + 1, x]]
            + input[[b, ch, y + 1, x + 1]])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(h: usize, w: usize) -> Tensor4 {
        Tensor4::from_shape_fn((1, 1, h, w), |(_, _, y, x)| (y * w + x) as f32)
    }

    #[test]
    fn test_zero_flow_is_identity() {
        let input = ramp(4, 5);
        let flow = Tensor4::zeros((1, 2, 4, 5));
        assert_eq!(flow_warp(&input, &flow, Padding::Zeros).unwrap(), input);
    }

    #[test]
    fn test_integer_shift_with_zero_padding() {
        let input = ramp(3, 3);
        let mut flow = Tensor4::zeros((1, 2, 3, 3));
        flow.slice_mut(ndarray::s![.., 0, .., ..]).fill(1.0);
        let out = flow_warp(&input, &flow, Padding::Zeros).unwrap();
        assert_eq!(out[[0, 0, 1, 0]], input[[0, 0, 1, 1]]);
        assert_eq!(out[[0, 0, 1, 2]], 0.0);
    }

    #[test]
    fn test_border_padding_clamps() {
        let input = ramp(3, 3);
        let mut flow = Tensor4::zeros((1, 2, 3, 3));
        flow.slice_mut(ndarray::s![.., 0, .., ..]).fill(5.0);
        let out = flow_warp(&input, &flow, Padding::Border).unwrap();
        assert_eq!(out[[0, 0, 2, 0]], input[[0, 0, 2, 2]]);
    }

    #[test]
    fn test_half_pixel_shift_interpolates() {
        let input = ramp(1, 4).into_shape_with_order((1, 1, 2, 2)).unwrap();
        let mut flow = Tensor4::zeros((1, 2, 2, 2));
        flow[[0, 0, 0, 0]] = 0.5;
        let out = flow_warp(&input, &flow, Padding::Zeros).unwrap();
        assert!((out[[0, 0, 0, 0]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_flow_shape_checked() {
        let input = ramp(4, 4);
        let flow = Tensor4::zeros((1, 2, 2, 2));
        assert!(flow_warp(&input, &flow, Padding::Zeros).is_err());
    }

    #[test]
    fn test_bilinear_constant_preserved() {
        let input = Tensor4::from_elem((1, 2, 3, 5), 0.7);
        let out = resize_bilinear(&input, 12, 20, false);
        assert!(out.iter().all(|v| (v - 0.7).abs() < 1e-6));
        let out = resize_bilinear(&input, 6, 10, true);
        assert!(out.iter().all(|v| (v - 0.7).abs() < 1e-6));
    }

    #[test]
    fn test_bilinear_align_corners_keeps_endpoints() {
        let input = ramp(2, 2);
        let out = resize_bilinear(&input, 4, 4, true);
        assert_eq!(out[[0, 0, 0, 0]], 0.0);
        assert_eq!(out[[0, 0, 3, 3]], 3.0);
    }

    #[test]
    fn test_bicubic_weights_sum_to_one() {
        for t in [0.0, 0.25, 0.5, 0.9] {
            let sum: f32 = cubic_weights(t).iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_bicubic_downsample_of_linear_ramp() {
        // Cubic convolution reproduces linear functions away from the border
        let input = Tensor4::from_shape_fn((1, 1, 16, 16), |(_, _, _, x)| x as f32);
        let out = resize_bicubic(&input, 4, 4);
        // Output pixel 1 samples source coordinate (1 + 0.5) * 4 - 0.5 = 5.5
        assert!((out[[0, 0, 2, 1]] - 5.5).abs() < 1e-4);
    }

    #[test]
    fn test_nearest_and_pool() {
        let input = ramp(2, 2);
        let up = upsample_nearest(&input, 2);
        assert_eq!(up.dim(), (1, 1, 4, 4));
        assert_eq!(up[[0, 0, 3, 2]], 3.0);
        assert_eq!(avg_pool2(&up), input);
    }
}
