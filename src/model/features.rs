// SPDX-License-Identifier: GPL-3.0-only

//! Per-frame spatial features

use super::storage::StorageTier;
use crate::constants::{EXTRACT_BLOCKS, FEATURE_STRIDE, LEAKY_RELU_SLOPE};
use crate::errors::{DepthError, DepthResult};
use crate::nn::{Conv2d, Initializer, ParamVisitor, Parameterized, ResidualBlocksWithInputConv, param_name};
use crate::tensor::{Tensor4, Tensor5, concat_channels, fold_time, frame_at, leaky_relu, unfold_time};
use tracing::debug;

/// Embeds a full-resolution guide into a feature-resolution tensor
///
/// conv → LReLU → conv/2 → LReLU → residual(1) → conv/2 → LReLU → residual(2)
pub struct GuideEncoder {
    conv_in: Conv2d,
    down_1: Conv2d,
    blocks_1: ResidualBlocksWithInputConv,
    down_2: Conv2d,
    blocks_2: ResidualBlocksWithInputConv,
}

impl GuideEncoder {
    pub fn new(init: &mut Initializer, in_channels: usize, mid_channels: usize) -> Self {
        Self {
            conv_in: Conv2d::new(init, in_channels, mid_channels, 3, 1),
            down_1: Conv2d::new(init, mid_channels, mid_channels, 3, 2),
            blocks_1: ResidualBlocksWithInputConv::new(init, mid_channels, mid_channels, 1),
            down_2: Conv2d::new(init, mid_channels, mid_channels, 3, 2),
            blocks_2: ResidualBlocksWithInputConv::new(init, mid_channels, mid_channels, 2),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.conv_in.in_channels()
    }

    pub fn forward(&self, guide: &Tensor4) -> DepthResult<Tensor4> {
        let mut x = self.conv_in.forward(guide)?;
        leaky_relu(&mut x, LEAKY_RELU_SLOPE);
        x = self.down_1.forward(&x)?;
        leaky_relu(&mut x, LEAKY_RELU_SLOPE);
        x = self.blocks_1.forward(&x)?;
        x = self.down_2.forward(&x)?;
        leaky_relu(&mut x, LEAKY_RELU_SLOPE);
        self.blocks_2.forward(&x)
    }
}

impl Parameterized for GuideEncoder {
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        self.conv_in.visit_params(&param_name(prefix, "0"), visitor)?;
        self.down_1.visit_params(&param_name(prefix, "2"), visitor)?;
        self.blocks_1.visit_params(&param_name(prefix, "4"), visitor)?;
        self.down_2.visit_params(&param_name(prefix, "5"), visitor)?;
        self.blocks_2.visit_params(&param_name(prefix, "7"), visitor)
    }
}

/// Measurement and guide embedding fused into the propagation seed feature
pub struct SpatialFeatureExtractor {
    guide: GuideEncoder,
    extract: ResidualBlocksWithInputConv,
    measurement_channels: usize,
    carried_channels: usize,
}

impl SpatialFeatureExtractor {
    /// `carried_channels` is the width of a feature handed over from an earlier
    /// stage, zero for the first stage
    pub fn new(
        init: &mut Initializer,
        measurement_channels: usize,
        guide_channels: usize,
        carried_channels: usize,
        mid_channels: usize,
    ) -> Self {
        let guide = GuideEncoder::new(init, guide_channels, mid_channels);
        let extract = ResidualBlocksWithInputConv::new(
            init,
            measurement_channels + mid_channels + carried_channels,
            mid_channels,
            EXTRACT_BLOCKS,
        );
        Self {
            guide,
            extract,
            measurement_channels,
            carried_channels,
        }
    }

    /// Guide encoder parameters, stored under their own checkpoint key
    pub fn visit_guide_params(
        &mut self,
        prefix: &str,
        visitor: &mut ParamVisitor<'_>,
    ) -> DepthResult<()> {
        self.guide.visit_params(prefix, visitor)
    }

    fn frame(
        &self,
        measurement: &Tensor4,
        guide: &Tensor4,
        carried: Option<&Tensor4>,
    ) -> DepthResult<Tensor4> {
        let embedded = self.guide.forward(guide)?;
        let mut parts = vec![measurement.view(), embedded.view()];
        if let Some(carried) = carried {
            parts.push(carried.view());
        }
        self.extract.forward(&concat_channels(&parts)?)
    }

    fn check_inputs(
        &self,
        measurements: &Tensor5,
        guides: &Tensor5,
        carried: Option<&Tensor5>,
    ) -> DepthResult<()> {
        let (n, t, m, h, w) = measurements.dim();
        let (gn, gt, gc, gh, gw) = guides.dim();
        if m != self.measurement_channels {
            return Err(DepthError::shape(
                "SpatialFeatureExtractor measurements",
                format!("{} channels", self.measurement_channels),
                measurements.shape(),
            ));
        }
        if (gn, gt, gc, gh, gw)
            != (n, t, self.guide.in_channels(), h * FEATURE_STRIDE, w * FEATURE_STRIDE)
        {
            return Err(DepthError::shape(
                "SpatialFeatureExtractor guides",
                format!(
                    "{}×{}×{}×{}×{}",
                    n,
                    t,
                    self.guide.in_channels(),
                    h * FEATURE_STRIDE,
                    w * FEATURE_STRIDE
                ),
                guides.shape(),
            ));
        }
        match (carried, self.carried_channels) {
            (None, 0) => Ok(()),
            (Some(c), width) if width > 0 && c.dim() == (n, t, width, h, w) => Ok(()),
            (Some(c), _) => Err(DepthError::shape(
                "SpatialFeatureExtractor carried feature",
                format!("{}×{}×{}×{}×{}", n, t, self.carried_channels, h, w),
                c.shape(),
            )),
            (None, width) => Err(DepthError::shape(
                "SpatialFeatureExtractor carried feature",
                format!("{} channels", width),
                &[],
            )),
        }
    }

    /// Spatial feature of every frame, `N×mid×h×w` each
    ///
    /// `measurements` is at feature resolution, `guides` at full resolution.
    pub fn extract(
        &self,
        measurements: &Tensor5,
        guides: &Tensor5,
        carried: Option<&Tensor5>,
        tier: &StorageTier,
    ) -> DepthResult<Vec<Tensor4>> {
        self.check_inputs(measurements, guides, carried)?;
        let (n, frames, _, _, _) = measurements.dim();
        if frames == 0 {
            return Ok(Vec::new());
        }

        if tier.is_offloaded() {
            debug!(frames, "Extracting spatial features per frame");
            return (0..frames)
                .map(|t| {
                    let carried = carried.map(|c| frame_at(c, t));
                    let feature =
                        self.frame(&frame_at(measurements, t), &frame_at(guides, t), carried.as_ref())?;
                    tier.reclaim();
                    Ok(tier.stage_out(feature))
                })
                .collect();
        }

        debug!(frames, "Extracting spatial features batched");
        let carried = carried.map(fold_time).transpose()?;
        let features = self.frame(&fold_time(measurements)?, &fold_time(guides)?, carried.as_ref())?;
        let features = unfold_time(features, n, frames)?;
        Ok((0..frames).map(|t| frame_at(&features, t)).collect())
    }
}

impl Parameterized for SpatialFeatureExtractor {
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        self.extract.visit_params(prefix, visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(carried: usize) -> SpatialFeatureExtractor {
        let mut init = Initializer::new(3);
        SpatialFeatureExtractor::new(&mut init, 1, 3, carried, 4)
    }

    fn sequence(n: usize, t: usize, c: usize, h: usize, w: usize) -> Tensor5 {
        Tensor5::from_shape_fn((n, t, c, h, w), |(b, f, ch, y, x)| {
            ((b * 7 + f * 5 + ch * 3 + y + 2 * x) % 11) as f32 / 11.0
        })
    }

    #[test]
    fn test_guide_encoder_downsamples_four_times() {
        let mut init = Initializer::new(0);
        let encoder = GuideEncoder::new(&mut init, 9, 4);
        let out = encoder.forward(&Tensor4::ones((2, 9, 16, 12))).unwrap();
        assert_eq!(out.dim(), (2, 4, 4, 3));
    }

    #[test]
    fn test_guide_encoder_param_keys() {
        let mut init = Initializer::new(0);
        let mut encoder = GuideEncoder::new(&mut init, 3, 4);
        let mut names = Vec::new();
        encoder
            .visit_params("conv_guide_init.hg_1", &mut |name, _, _| {
                names.push(name.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(names[0], "conv_guide_init.hg_1.0.weight");
        assert!(names.contains(&"conv_guide_init.hg_1.4.main.2.0.conv1.bias".to_string()));
        assert!(names.contains(&"conv_guide_init.hg_1.7.main.2.1.conv2.weight".to_string()));
        assert_eq!(names.last().unwrap(), "conv_guide_init.hg_1.7.main.2.1.conv2.bias");
    }

    #[test]
    fn test_batched_matches_per_frame() {
        let fe = extractor(4);
        let meas = sequence(1, 3, 1, 2, 3);
        let guides = sequence(1, 3, 3, 8, 12);
        let carried = sequence(1, 3, 4, 2, 3);
        let batched = fe
            .extract(&meas, &guides, Some(&carried), &StorageTier::resident())
            .unwrap();
        let per_frame = fe
            .extract(&meas, &guides, Some(&carried), &StorageTier::offloaded())
            .unwrap();
        assert_eq!(batched.len(), 3);
        for (a, b) in batched.iter().zip(&per_frame) {
            assert_eq!(a.dim(), (1, 4, 2, 3));
            let diff = (a - b).mapv(f32::abs).fold(0.0f32, |m, v| m.max(*v));
            assert!(diff < 1e-5, "max diff {}", diff);
        }
    }

    #[test]
    fn test_carried_feature_required_in_refinement() {
        let fe = extractor(4);
        let meas = sequence(1, 2, 1, 2, 3);
        let guides = sequence(1, 2, 3, 8, 12);
        assert!(fe
            .extract(&meas, &guides, None, &StorageTier::resident())
            .is_err());
    }

    #[test]
    fn test_guide_resolution_checked() {
        let fe = extractor(0);
        let meas = sequence(1, 2, 1, 2, 3);
        let guides = sequence(1, 2, 3, 8, 8);
        assert!(matches!(
            fe.extract(&meas, &guides, None, &StorageTier::resident()),
            Err(DepthError::Shape(_))
        ));
    }
}
