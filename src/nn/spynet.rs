// SPDX-License-Identifier: GPL-3.0-only

//! SPyNet optical flow
//!
//! Coarse-to-fine flow over a six-level average-pool pyramid. Each level
//! upsamples the running estimate, warps the supporting frame with it and adds
//! the residual predicted by a small 7×7 convolution stack.

use super::{Conv2d, FlowNetwork, Initializer, ParamVisitor, Parameterized, param_name};
use crate::constants::{SPYNET_ALIGNMENT, SPYNET_LEVELS, SPYNET_MEAN, SPYNET_STD};
use crate::errors::{DepthError, DepthResult};
use crate::tensor::{
    Padding, Tensor4, avg_pool2, concat_channels, flow_warp, relu, resize_bilinear,
};
use ndarray::{Array4, s};

/// Channel widths of the per-level convolution stack
const BASIC_CHANNELS: [usize; 6] = [8, 32, 64, 32, 16, 2];
const BASIC_KERNEL: usize = 7;

struct BasicModule {
    convs: Vec<Conv2d>,
}

impl BasicModule {
    fn new(init: &mut Initializer) -> Self {
        let convs = BASIC_CHANNELS
            .windows(2)
            .map(|pair| Conv2d::new(init, pair[0], pair[1], BASIC_KERNEL, 1))
            .collect();
        Self { convs }
    }

    fn forward(&self, input: &Tensor4) -> DepthResult<Tensor4> {
        let last = self.convs.len() - 1;
        let mut x = input.clone();
        for (i, conv) in self.convs.iter().enumerate() {
            x = conv.forward(&x)?;
            if i < last {
                relu(&mut x);
            }
        }
        Ok(x)
    }
}

impl Parameterized for BasicModule {
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        for (j, conv) in self.convs.iter_mut().enumerate() {
            conv.visit_params(&param_name(prefix, &format!("basic_module.{}.conv", j)), visitor)?;
        }
        Ok(())
    }
}

/// Pyramid flow network operating on RGB frames
pub struct SpyNet {
    mean: Array4<f32>,
    std: Array4<f32>,
    levels: Vec<BasicModule>,
}

impl SpyNet {
    pub fn new(init: &mut Initializer) -> Self {
        Self {
            mean: Array4::from_shape_fn((1, 3, 1, 1), |(_, c, _, _)| SPYNET_MEAN[c]),
            std: Array4::from_shape_fn((1, 3, 1, 1), |(_, c, _, _)| SPYNET_STD[c]),
            levels: (0..SPYNET_LEVELS).map(|_| BasicModule::new(init)).collect(),
        }
    }

    fn normalize(&self, frame: &Tensor4) -> Tensor4 {
        &(frame - &self.mean) / &self.std
    }

    /// Flow at a resolution divisible by the pyramid depth
    fn compute_flow(&self, reference: &Tensor4, supporting: &Tensor4) -> DepthResult<Tensor4> {
        let mut refs = vec![self.normalize(reference)];
        let mut supps = vec![self.normalize(supporting)];
        for _ in 1..SPYNET_LEVELS {
            let next_ref = avg_pool2(&refs[refs.len() - 1]);
            let next_supp = avg_pool2(&supps[supps.len() - 1]);
            refs.push(next_ref);
            supps.push(next_supp);
        }
        refs.reverse();
        supps.reverse();

        let (n, _, h, w) = refs[0].dim();
        let mut flow = Tensor4::zeros((n, 2, h, w));
        for (level, module) in self.levels.iter().enumerate() {
            let (_, _, lh, lw) = refs[level].dim();
            let flow_up = if level == 0 {
                flow
            } else {
                resize_bilinear(&flow, lh, lw, true) * 2.0
            };
            let warped = flow_warp(&supps[level], &flow_up, Padding::Border)?;
            let input = concat_channels(&[refs[level].view(), warped.view(), flow_up.view()])?;
            flow = flow_up + module.forward(&input)?;
        }
        Ok(flow)
    }
}

impl FlowNetwork for SpyNet {
    fn estimate(&self, reference: &Tensor4, supporting: &Tensor4) -> DepthResult<Tensor4> {
        let (n, c, h, w) = reference.dim();
        if c != 3 || supporting.dim() != reference.dim() {
            return Err(DepthError::shape(
                "SpyNet",
                format!("two RGB frames of {}×3×{}×{}", n, h, w),
                supporting.shape(),
            ));
        }
        let h_up = h.div_ceil(SPYNET_ALIGNMENT) * SPYNET_ALIGNMENT;
        let w_up = w.div_ceil(SPYNET_ALIGNMENT) * SPYNET_ALIGNMENT;
        if (h_up, w_up) == (h, w) {
            return self.compute_flow(reference, supporting);
        }

        let reference = resize_bilinear(reference, h_up, w_up, false);
        let supporting = resize_bilinear(supporting, h_up, w_up, false);
        let flow = self.compute_flow(&reference, &supporting)?;
        let mut flow = resize_bilinear(&flow, h, w, false);
        flow.slice_mut(s![.., 0, .., ..])
            .mapv_inplace(|v| v * w as f32 / w_up as f32);
        flow.slice_mut(s![.., 1, .., ..])
            .mapv_inplace(|v| v * h as f32 / h_up as f32);
        Ok(flow)
    }
}

impl Parameterized for SpyNet {
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        for (name, buffer) in [("mean", &mut self.mean), ("std", &mut self.std)] {
            let shape = buffer.shape().to_vec();
            let full = param_name(prefix, name);
            let data = buffer
                .as_slice_mut()
                .ok_or_else(|| DepthError::Other(format!("buffer {} is not contiguous", full)))?;
            visitor(&full, &shape, data)?;
        }
        for (level, module) in self.levels.iter_mut().enumerate() {
            module.visit_params(&param_name(prefix, &format!("basic_module.{}", level)), visitor)?;
        }
        Ok(())
    }
}
