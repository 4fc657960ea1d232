// SPDX-License-Identifier: GPL-3.0-only

//! Convolution, pixel shuffle and activations
//!
//! Convolution is lowered to a matrix product: the input patches of every
//! output pixel are gathered into a column matrix (im2col) and multiplied by
//! the flattened `Cout×(Cin·k·k)` weight.

use super::Tensor4;
use crate::errors::{DepthError, DepthResult};
use ndarray::{Array1, Array2, Array4, Axis};

/// Output extent of a convolution along one axis
#[inline]
pub fn conv_output_size(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding).saturating_sub(kernel) / stride + 1
}

/// Gather convolution patches of one batch element into a `(Cin·k·k)×(Hout·Wout)` matrix
fn im2col(
    data: &[f32],
    (channels, height, width): (usize, usize, usize),
    kernel: usize,
    stride: usize,
    padding: usize,
    (out_h, out_w): (usize, usize),
) -> Array2<f32> {
    let mut cols = Array2::<f32>::zeros((channels * kernel * kernel, out_h * out_w));
    for c in 0..channels {
        let plane = &data[c * height * width..(c + 1) * height * width];
        for ky in 0..kernel {
            for kx in 0..kernel {
                let row = (c * kernel + ky) * kernel + kx;
                let mut col_row = cols.row_mut(row);
                for oy in 0..out_h {
                    let iy = (oy * stride + ky) as isize - padding as isize;
                    if iy < 0 || iy >= height as isize {
                        continue;
                    }
                    let src = &plane[iy as usize * width..(iy as usize + 1) * width];
                    for ox in 0..out_w {
                        let ix = (ox * stride + kx) as isize - padding as isize;
                        if ix >= 0 && ix < width as isize {
                            col_row[oy * out_w + ox] = src[ix as usize];
                        }
                    }
                }
            }
        }
    }
    cols
}

/// 2D convolution with square kernels, `weight` is `Cout×Cin×k×k`
pub fn conv2d(
    input: &Tensor4,
    weight: &Array4<f32>,
    bias: Option<&Array1<f32>>,
    stride: usize,
    padding: usize,
) -> DepthResult<Tensor4> {
    let (n, cin, h, w) = input.dim();
    let (cout, wcin, kh, kw) = weight.dim();
    if wcin != cin || kh != kw {
        return Err(DepthError::shape(
            "conv2d",
            format!("input with {} channels and a square kernel", wcin),
            input.shape(),
        ));
    }
    let kernel = kh;
    let out_h = conv_output_size(h, kernel, stride, padding);
    let out_w = conv_output_size(w, kernel, stride, padding);

    let input = input.as_standard_layout();
    let data = input
        .as_slice()
        .ok_or_else(|| DepthError::Other("conv2d input is not contiguous".into()))?;
    let weight = weight
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((cout, cin * kernel * kernel))?;

    let plane = cin * h * w;
    let mut output = Tensor4::zeros((n, cout, out_h, out_w));
    for b in 0..n {
        let cols = im2col(
            &data[b * plane..(b + 1) * plane],
            (cin, h, w),
            kernel,
            stride,
            padding,
            (out_h, out_w),
        );
        let product = weight.dot(&cols).into_shape_with_order((cout, out_h, out_w))?;
        let mut out_b = output.index_axis_mut(Axis(0), b);
        out_b.assign(&product);
        if let Some(bias) = bias {
            out_b += &bias.view().insert_axis(Axis(1)).insert_axis(Axis(2));
        }
    }
    Ok(output)
}

/// Rearrange `N×(C·r²)×H×W` into `N×C×(H·r)×(W·r)`
pub fn pixel_shuffle(input: &Tensor4, factor: usize) -> DepthResult<Tensor4> {
    let (n, c, h, w) = input.dim();
    let block = factor * factor;
    if factor == 0 || c % block != 0 {
        return Err(DepthError::shape(
            "pixel_shuffle",
            format!("channels divisible by {}", block),
            input.shape(),
        ));
    }
    let out_c = c / block;
    let shuffled = input
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((n, out_c, factor, factor, h, w))?
        .permuted_axes([0, 1, 4, 2, 5, 3]);
    Ok(shuffled
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((n, out_c, h * factor, w * factor))?)
}

/// LeakyReLU in place
pub fn leaky_relu(tensor: &mut Tensor4, slope: f32) {
    tensor.mapv_inplace(|v| if v >= 0.0 { v } else { v * slope });
}

/// ReLU in place
pub fn relu(tensor: &mut Tensor4) {
    tensor.mapv_inplace(|v| v.max(0.0));
}

/// Logistic sigmoid in place
pub fn sigmoid(tensor: &mut Tensor4) {
    tensor.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp()));
}
