// SPDX-License-Identifier: GPL-3.0-only

//! Second-order flow-guided deformable alignment
//!
//! A small convolution stack predicts offset residues and modulation masks from
//! the warped features and both flows. The residues are bounded by
//! `max_residue_magnitude · tanh`, the flows are added back as the offset base
//! (first half of the groups follows `flow_1`, the second half `flow_2`), and a
//! modulated 3×3 deformable convolution produces the aligned feature.

use super::{Conv2d, DeformableAlign, Initializer, ParamVisitor, Parameterized, param_name};
use crate::constants::{DEFORM_KERNEL_TAPS, LEAKY_RELU_SLOPE};
use crate::errors::{DepthError, DepthResult};
use crate::tensor::resample::sample_zeros;
use crate::tensor::{Tensor4, concat_channels, expect_dims, leaky_relu};
use ndarray::{Array1, Array2, Array4, Axis, s};

pub struct SecondOrderDeformableAlignment {
    weight: Array4<f32>,
    bias: Array1<f32>,
    conv_offset: [Conv2d; 4],
    deform_groups: usize,
    max_residue_magnitude: f32,
}

impl SecondOrderDeformableAlignment {
    /// Alignment of `channels`-wide features (input is the `2·channels` pair)
    pub fn new(
        init: &mut Initializer,
        channels: usize,
        deform_groups: usize,
        max_residue_magnitude: f32,
    ) -> DepthResult<Self> {
        let in_channels = 2 * channels;
        if deform_groups == 0 || deform_groups % 2 != 0 || in_channels % deform_groups != 0 {
            return Err(DepthError::Config(format!(
                "deform_groups ({}) must be even and divide {}",
                deform_groups, in_channels
            )));
        }
        let (weight, _) = init.conv(in_channels, channels, 3, 1.0);
        let offset_channels = 3 * DEFORM_KERNEL_TAPS * deform_groups;
        Ok(Self {
            weight,
            bias: Array1::zeros(channels),
            conv_offset: [
                Conv2d::new(init, 3 * channels + 4, channels, 3, 1),
                Conv2d::new(init, channels, channels, 3, 1),
                Conv2d::new(init, channels, channels, 3, 1),
                // Offsets start at the flow, masks at 0.5
                Conv2d::zeros(channels, offset_channels, 3, 1),
            ],
            deform_groups,
            max_residue_magnitude,
        })
    }

    /// Offsets (`2·9·G` channels, dy before dx) and masks (`9·G` channels)
    fn offsets_and_mask(
        &self,
        condition: &Tensor4,
        flow_1: &Tensor4,
        flow_2: &Tensor4,
    ) -> DepthResult<(Tensor4, Tensor4)> {
        let mut x = concat_channels(&[condition.view(), flow_1.view(), flow_2.view()])?;
        let last = self.conv_offset.len() - 1;
        for (i, conv) in self.conv_offset.iter().enumerate() {
            x = conv.forward(&x)?;
            if i < last {
                leaky_relu(&mut x, LEAKY_RELU_SLOPE);
            }
        }

        let chunk = DEFORM_KERNEL_TAPS * self.deform_groups;
        let magnitude = self.max_residue_magnitude;
        let mut offset = x
            .slice(s![.., 0..2 * chunk, .., ..])
            .mapv(|v| magnitude * v.tanh());
        for (half, flow) in [flow_1, flow_2].into_iter().enumerate() {
            for ch in 0..chunk {
                // Flow is (dx, dy); offsets are interleaved (dy, dx)
                let flow_ch = if ch % 2 == 0 { 1 } else { 0 };
                let mut target = offset.slice_mut(s![.., half * chunk + ch, .., ..]);
                target += &flow.slice(s![.., flow_ch, .., ..]);
            }
        }
        let mask = x
            .slice(s![.., 2 * chunk..3 * chunk, .., ..])
            .mapv(|v| 1.0 / (1.0 + (-v).exp()));
        Ok((offset, mask))
    }

    /// Modulated deformable 3×3 convolution, stride 1, padding 1
    fn modulated_deform_conv(
        &self,
        input: &Tensor4,
        offset: &Tensor4,
        mask: &Tensor4,
    ) -> DepthResult<Tensor4> {
        let (n, cin, h, w) = input.dim();
        let cout = self.weight.dim().0;
        let taps = DEFORM_KERNEL_TAPS;
        let group_channels = cin / self.deform_groups;
        let weight = self
            .weight
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((cout, cin * taps))?;
        let input = input.as_standard_layout();
        let data = input
            .as_slice()
            .ok_or_else(|| DepthError::Other("deformable input is not contiguous".into()))?;
        let plane = h * w;

        let mut output = Tensor4::zeros((n, cout, h, w));
        for b in 0..n {
            let mut cols = Array2::<f32>::zeros((cin * taps, plane));
            for g in 0..self.deform_groups {
                for k in 0..taps {
                    let (ky, kx) = ((k / 3) as f32 - 1.0, (k % 3) as f32 - 1.0);
                    let tap = g * taps + k;
                    for y in 0..h {
                        for x in 0..w {
                            let sy = y as f32 + ky + offset[[b, 2 * tap, y, x]];
                            let sx = x as f32 + kx + offset[[b, 2 * tap + 1, y, x]];
                            let m = mask[[b, tap, y, x]];
                            for c in g * group_channels..(g + 1) * group_channels {
                                let start = (b * cin + c) * plane;
                                cols[[c * taps + k, y * w + x]] =
                                    m * sample_zeros(&data[start..start + plane], h, w, sy, sx);
                            }
                        }
                    }
                }
            }
            let product = weight.dot(&cols).into_shape_with_order((cout, h, w))?;
            let mut out_b = output.index_axis_mut(Axis(0), b);
            out_b.assign(&product);
            out_b += &self.bias.view().insert_axis(Axis(1)).insert_axis(Axis(2));
        }
        Ok(output)
    }
}

impl DeformableAlign for SecondOrderDeformableAlignment {
    fn align(
        &self,
        features: &Tensor4,
        condition: &Tensor4,
        flow_1: &Tensor4,
        flow_2: &Tensor4,
    ) -> DepthResult<Tensor4> {
        let channels = self.weight.dim().0;
        let (n, _, h, w) = features.dim();
        expect_dims("deform_align features", features, [None, Some(2 * channels), None, None])?;
        expect_dims("deform_align condition", condition, [Some(n), Some(3 * channels), Some(h), Some(w)])?;
        expect_dims("deform_align flow_1", flow_1, [Some(n), Some(2), Some(h), Some(w)])?;
        expect_dims("deform_align flow_2", flow_2, [Some(n), Some(2), Some(h), Some(w)])?;

        let (offset, mask) = self.offsets_and_mask(condition, flow_1, flow_2)?;
        self.modulated_deform_conv(features, &offset, &mask)
    }
}

impl Parameterized for SecondOrderDeformableAlignment {
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        let weight_name = param_name(prefix, "weight");
        let weight_shape = self.weight.shape().to_vec();
        let weight = self
            .weight
            .as_slice_mut()
            .ok_or_else(|| DepthError::Other(format!("{} is not contiguous", weight_name)))?;
        visitor(&weight_name, &weight_shape, weight)?;
        let bias_name = param_name(prefix, "bias");
        let bias_shape = self.bias.shape().to_vec();
        let bias = self
            .bias
            .as_slice_mut()
            .ok_or_else(|| DepthError::Other(format!("{} is not contiguous", bias_name)))?;
        visitor(&bias_name, &bias_shape, bias)?;
        // Sequential indices skip the activations
        for (i, conv) in self.conv_offset.iter_mut().enumerate() {
            conv.visit_params(&param_name(prefix, &format!("conv_offset.{}", 2 * i)), visitor)?;
        }
        Ok(())
    }
}
