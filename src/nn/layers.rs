// SPDX-License-Identifier: GPL-3.0-only

//! Convolutional building blocks

use super::{Initializer, ParamVisitor, Parameterized, param_name};
use crate::constants::LEAKY_RELU_SLOPE;
use crate::errors::{DepthError, DepthResult};
use crate::tensor::{Tensor4, conv2d, leaky_relu, pixel_shuffle, relu};
use ndarray::{Array1, Array4};

fn visit_array<D: ndarray::Dimension>(
    array: &mut ndarray::Array<f32, D>,
    name: &str,
    visitor: &mut ParamVisitor<'_>,
) -> DepthResult<()> {
    let shape = array.shape().to_vec();
    let data = array
        .as_slice_mut()
        .ok_or_else(|| DepthError::Other(format!("parameter {} is not contiguous", name)))?;
    visitor(name, &shape, data)
}

/// Square-kernel convolution with "same" padding (`kernel / 2`)
pub struct Conv2d {
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    pub fn new(
        init: &mut Initializer,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
    ) -> Self {
        Self::with_gain(init, in_channels, out_channels, kernel, stride, 1.0)
    }

    pub fn with_gain(
        init: &mut Initializer,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        gain: f32,
    ) -> Self {
        let (weight, bias) = init.conv(in_channels, out_channels, kernel, gain);
        Self {
            weight,
            bias,
            stride,
            padding: kernel / 2,
        }
    }

    /// All-zero weights and bias
    pub fn zeros(in_channels: usize, out_channels: usize, kernel: usize, stride: usize) -> Self {
        Self {
            weight: Array4::zeros((out_channels, in_channels, kernel, kernel)),
            bias: Array1::zeros(out_channels),
            stride,
            padding: kernel / 2,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn forward(&self, input: &Tensor4) -> DepthResult<Tensor4> {
        conv2d(
            input,
            &self.weight,
            Some(&self.bias),
            self.stride,
            self.padding,
        )
    }
}

impl Parameterized for Conv2d {
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        visit_array(&mut self.weight, &param_name(prefix, "weight"), visitor)?;
        visit_array(&mut self.bias, &param_name(prefix, "bias"), visitor)
    }
}

/// `x + conv2(relu(conv1(x)))`
pub struct ResidualBlockNoBN {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl ResidualBlockNoBN {
    pub fn new(init: &mut Initializer, channels: usize) -> Self {
        // Residual branches start close to identity
        Self {
            conv1: Conv2d::with_gain(init, channels, channels, 3, 1, 0.1),
            conv2: Conv2d::with_gain(init, channels, channels, 3, 1, 0.1),
        }
    }

    pub fn forward(&self, input: &Tensor4) -> DepthResult<Tensor4> {
        let mut hidden = self.conv1.forward(input)?;
        relu(&mut hidden);
        let mut output = self.conv2.forward(&hidden)?;
        output += input;
        Ok(output)
    }
}

impl Parameterized for ResidualBlockNoBN {
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        self.conv1.visit_params(&param_name(prefix, "conv1"), visitor)?;
        self.conv2.visit_params(&param_name(prefix, "conv2"), visitor)
    }
}

/// Input convolution plus LeakyReLU followed by a stack of residual blocks
///
/// State-dict layout: `main.0` is the input convolution, `main.2.{i}` the
/// residual blocks.
pub struct ResidualBlocksWithInputConv {
    input_conv: Conv2d,
    blocks: Vec<ResidualBlockNoBN>,
}

impl ResidualBlocksWithInputConv {
    pub fn new(
        init: &mut Initializer,
        in_channels: usize,
        out_channels: usize,
        num_blocks: usize,
    ) -> Self {
        let input_conv = Conv2d::new(init, in_channels, out_channels, 3, 1);
        let blocks = (0..num_blocks)
            .map(|_| ResidualBlockNoBN::new(init, out_channels))
            .collect();
        Self { input_conv, blocks }
    }

    pub fn in_channels(&self) -> usize {
        self.input_conv.in_channels()
    }

    pub fn out_channels(&self) -> usize {
        self.input_conv.out_channels()
    }

    pub fn forward(&self, input: &Tensor4) -> DepthResult<Tensor4> {
        let mut x = self.input_conv.forward(input)?;
        leaky_relu(&mut x, LEAKY_RELU_SLOPE);
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        Ok(x)
    }
}

impl Parameterized for ResidualBlocksWithInputConv {
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        self.input_conv
            .visit_params(&param_name(prefix, "main.0"), visitor)?;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.visit_params(&param_name(prefix, &format!("main.2.{}", i)), visitor)?;
        }
        Ok(())
    }
}

/// Convolution to `out·r²` channels followed by a pixel shuffle
pub struct PixelShufflePack {
    upsample_conv: Conv2d,
    factor: usize,
}

impl PixelShufflePack {
    pub fn new(
        init: &mut Initializer,
        in_channels: usize,
        out_channels: usize,
        factor: usize,
        kernel: usize,
    ) -> Self {
        Self {
            upsample_conv: Conv2d::new(init, in_channels, out_channels * factor * factor, kernel, 1),
            factor,
        }
    }

    pub fn forward(&self, input: &Tensor4) -> DepthResult<Tensor4> {
        pixel_shuffle(&self.upsample_conv.forward(input)?, self.factor)
    }
}

impl Parameterized for PixelShufflePack {
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        self.upsample_conv
            .visit_params(&param_name(prefix, "upsample_conv"), visitor)
    }
}
