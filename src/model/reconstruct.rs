// SPDX-License-Identifier: GPL-3.0-only

//! Branch fusion and full-resolution depth/confidence prediction

use super::branch::{Branch, BranchArena};
use super::storage::StorageTier;
use crate::constants::{EXTRACT_BLOCKS, FEATURE_STRIDE, HEAD_CHANNELS, HEAD_OUTPUTS, LEAKY_RELU_SLOPE};
use crate::errors::{DepthError, DepthResult};
use crate::nn::{
    Conv2d, Initializer, ParamVisitor, Parameterized, PixelShufflePack,
    ResidualBlocksWithInputConv, param_name,
};
use crate::tensor::{
    Tensor4, Tensor5, channel_slice, concat_channels, fold_time, frame_at, leaky_relu,
    resize_bilinear, stack_frames, unfold_time,
};
use tracing::debug;

/// Two pixel-shuffle upsamplings followed by two convolutions
///
/// Produces `[depth residual, confidence]` at 4× the input resolution.
pub struct PredictionHead {
    up_1: PixelShufflePack,
    up_2: PixelShufflePack,
    conv_hr: Conv2d,
    conv_last: Conv2d,
}

impl PredictionHead {
    pub fn new(init: &mut Initializer, mid_channels: usize) -> Self {
        Self {
            up_1: PixelShufflePack::new(init, mid_channels, mid_channels, 2, 3),
            up_2: PixelShufflePack::new(init, mid_channels, HEAD_CHANNELS, 2, 3),
            conv_hr: Conv2d::new(init, HEAD_CHANNELS, HEAD_CHANNELS, 3, 1),
            conv_last: Conv2d::new(init, HEAD_CHANNELS, HEAD_OUTPUTS, 3, 1),
        }
    }

    pub fn forward(&self, fused: &Tensor4) -> DepthResult<Tensor4> {
        let mut x = self.up_1.forward(fused)?;
        leaky_relu(&mut x, LEAKY_RELU_SLOPE);
        x = self.up_2.forward(&x)?;
        leaky_relu(&mut x, LEAKY_RELU_SLOPE);
        x = self.conv_hr.forward(&x)?;
        leaky_relu(&mut x, LEAKY_RELU_SLOPE);
        self.conv_last.forward(&x)
    }
}

impl Parameterized for PredictionHead {
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        self.up_1.visit_params(&param_name(prefix, "0"), visitor)?;
        self.up_2.visit_params(&param_name(prefix, "2"), visitor)?;
        self.conv_hr.visit_params(&param_name(prefix, "4"), visitor)?;
        self.conv_last.visit_params(&param_name(prefix, "6"), visitor)
    }
}

/// Per-frame output of a stage
pub struct Reconstruction {
    /// `N×T×1×H×W`
    pub depth: Tensor5,
    /// `N×T×1×H×W`, unnormalised
    pub confidence: Tensor5,
    /// `N×T×mid×h×w`, reused by the refinement stage
    pub fused: Tensor5,
}

pub struct FrameReconstructor {
    fusion: ResidualBlocksWithInputConv,
    head: PredictionHead,
}

impl FrameReconstructor {
    pub fn new(init: &mut Initializer, mid_channels: usize) -> Self {
        Self {
            fusion: ResidualBlocksWithInputConv::new(
                init,
                (Branch::ORDER.len() + 1) * mid_channels,
                mid_channels,
                EXTRACT_BLOCKS,
            ),
            head: PredictionHead::new(init, mid_channels),
        }
    }

    /// Parameters under `reconstruction.{stage}` and `final_pred.{stage}`
    pub fn visit_stage_params(
        &mut self,
        prefix: &str,
        stage_key: &str,
        visitor: &mut ParamVisitor<'_>,
    ) -> DepthResult<()> {
        let fusion = format!("reconstruction.{}", stage_key);
        let head = format!("final_pred.{}", stage_key);
        self.fusion.visit_params(&param_name(prefix, &fusion), visitor)?;
        self.head.visit_params(&param_name(prefix, &head), visitor)
    }

    /// `(depth, confidence, fused)` of one frame or of a folded batch of frames
    fn predict(&self, stacked: &Tensor4, coarse: &Tensor4) -> DepthResult<(Tensor4, Tensor4, Tensor4)> {
        let fused = self.fusion.forward(stacked)?;
        let head = self.head.forward(&fused)?;
        let (_, _, h, w) = head.dim();
        let mut depth = channel_slice(&head, 0, 1)?;
        let confidence = channel_slice(&head, 1, 1)?;
        let (_, _, ch, cw) = coarse.dim();
        if (ch * FEATURE_STRIDE, cw * FEATURE_STRIDE) != (h, w) {
            return Err(DepthError::shape(
                "FrameReconstructor measurement",
                format!("{}×{} feature resolution", h / FEATURE_STRIDE, w / FEATURE_STRIDE),
                coarse.shape(),
            ));
        }
        depth += &resize_bilinear(coarse, h, w, false);
        Ok((depth, confidence, fused))
    }

    fn stacked_frame(
        spatial: &[Tensor4],
        branches: &BranchArena,
        t: usize,
        tier: &StorageTier,
    ) -> DepthResult<Tensor4> {
        let features = Branch::ORDER
            .iter()
            .map(|&b| branches.get(b, t).map(|f| tier.stage_in(f)))
            .collect::<DepthResult<Vec<_>>>()?;
        let spatial = tier.stage_in(&spatial[t]);
        let mut parts = vec![spatial.view()];
        parts.extend(features.iter().map(|f| f.view()));
        concat_channels(&parts)
    }

    /// Reconstruct every frame
    ///
    /// `measurements` is the feature-resolution measurement sequence; its first
    /// channel is the coarse depth the head predicts a residual for.
    pub fn reconstruct(
        &self,
        measurements: &Tensor5,
        spatial: &[Tensor4],
        branches: &BranchArena,
        tier: &StorageTier,
    ) -> DepthResult<Reconstruction> {
        let (n, frames, _, _, _) = measurements.dim();
        if spatial.len() != frames || branches.frames() != frames {
            return Err(DepthError::shape(
                "FrameReconstructor",
                format!("{} frames of features", frames),
                &[spatial.len(), branches.frames()],
            ));
        }
        if frames == 0 {
            return Err(DepthError::shape("FrameReconstructor", "at least one frame", &[0]));
        }

        if tier.is_offloaded() {
            debug!(frames, "Reconstructing per frame");
            let mut depths = Vec::with_capacity(frames);
            let mut confidences = Vec::with_capacity(frames);
            let mut fused = Vec::with_capacity(frames);
            for t in 0..frames {
                let stacked = Self::stacked_frame(spatial, branches, t, tier)?;
                let coarse = channel_slice(&frame_at(measurements, t), 0, 1)?;
                let (depth, confidence, feature) = self.predict(&stacked, &coarse)?;
                depths.push(tier.stage_out(depth));
                confidences.push(tier.stage_out(confidence));
                fused.push(tier.stage_out(feature));
                tier.reclaim();
            }
            return Ok(Reconstruction {
                depth: stack_frames(&depths)?,
                confidence: stack_frames(&confidences)?,
                fused: stack_frames(&fused)?,
            });
        }

        debug!(frames, "Reconstructing batched");
        let stacked = (0..frames)
            .map(|t| Self::stacked_frame(spatial, branches, t, tier))
            .collect::<DepthResult<Vec<_>>>()?;
        let stacked = fold_time(&stack_frames(&stacked)?)?;
        let coarse = fold_time(&measurements.slice(ndarray::s![.., .., 0..1, .., ..]).to_owned())?;
        let (depth, confidence, fused) = self.predict(&stacked, &coarse)?;
        Ok(Reconstruction {
            depth: unfold_time(depth, n, frames)?,
            confidence: unfold_time(confidence, n, frames)?,
            fused: unfold_time(fused, n, frames)?,
        })
    }
}
