// SPDX-License-Identifier: GPL-3.0-only

//! One propagation stage: features, flows, four branches, reconstruction
//!
//! Both hierarchical stages run the same pipeline; they differ only in the
//! guide fed to the guide encoder (RGB for the initial stage, the side channel
//! for the refinement stage) and in the stage-1 feature carried into the
//! refinement stage's extractor.

use super::branch::{Branch, Stage};
use super::features::SpatialFeatureExtractor;
use super::flow::FlowEstimator;
use super::propagation::PropagationEngine;
use super::reconstruct::{FrameReconstructor, Reconstruction};
use super::storage::{ComputeDevice, OffloadPolicy, StorageTier};
use super::symmetry::is_mirror_extended;
use crate::config::Config;
use crate::errors::{DepthError, DepthResult};
use crate::nn::{
    AlignModule, FlowModule, Initializer, ParamVisitor, Parameterized, SpyNet, param_name,
};
use crate::tensor::Tensor5;
use std::time::Instant;
use tracing::{debug, info};

/// Input widths of one stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageSpec {
    pub stage: Stage,
    /// Channels of the feature-resolution measurement
    pub measurement_channels: usize,
    /// Channels of the full-resolution guide given to the guide encoder
    pub guide_channels: usize,
    /// Channels of the feature carried over from the previous stage
    pub carried_channels: usize,
}

impl StageSpec {
    /// RGB-guided first stage
    pub fn initial(config: &Config) -> Self {
        Self {
            stage: Stage::Initial,
            measurement_channels: config.measurement_channels(),
            guide_channels: 3,
            carried_channels: 0,
        }
    }

    /// Refinement stage fed by the stage-1 side channel and fused feature
    pub fn refine(config: &Config) -> Self {
        Self {
            stage: Stage::Refine,
            measurement_channels: config.measurement_channels(),
            guide_channels: config.refine_signal.side_channels(),
            carried_channels: config.mid_channels,
        }
    }

    pub fn for_stage(stage: Stage, config: &Config) -> Self {
        match stage {
            Stage::Initial => Self::initial(config),
            Stage::Refine => Self::refine(config),
        }
    }
}

/// Inputs of one stage call
pub struct StageInput<'a> {
    /// `N×T×m×h×w` measurement at feature resolution
    pub measurements: &'a Tensor5,
    /// `N×T×3×H×W` RGB frames the flow network runs on
    pub flow_guides: &'a Tensor5,
    /// `N×T×g×H×W` input of the guide encoder
    pub guides: &'a Tensor5,
    /// `N×T×mid×h×w` fused feature of the previous stage
    pub carried: Option<&'a Tensor5>,
}

pub struct DepthStage {
    spec: StageSpec,
    flow: FlowEstimator,
    features: SpatialFeatureExtractor,
    propagation: PropagationEngine,
    reconstruct: FrameReconstructor,
    cpu_cache_length: usize,
}

impl DepthStage {
    pub fn new(spec: StageSpec, config: &Config, init: &mut Initializer) -> DepthResult<Self> {
        let flow = FlowEstimator::new(Box::new(SpyNet::new(init)));
        let features = SpatialFeatureExtractor::new(
            init,
            spec.measurement_channels,
            spec.guide_channels,
            spec.carried_channels,
            config.mid_channels,
        );
        let propagation = PropagationEngine::new(
            init,
            config.mid_channels,
            config.num_blocks,
            config.deform_groups,
            config.max_residue_magnitude,
        )?;
        let reconstruct = FrameReconstructor::new(init, config.mid_channels);
        Ok(Self {
            spec,
            flow,
            features,
            propagation,
            reconstruct,
            cpu_cache_length: config.cpu_cache_length,
        })
    }

    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    /// Swap the flow network, e.g. for a precomputed or external estimator
    pub fn set_flow_network(&mut self, network: Box<dyn FlowModule>) {
        self.flow = FlowEstimator::new(network);
    }

    /// Swap the alignment operator of one branch
    pub fn set_aligner(&mut self, branch: Branch, align: Box<dyn AlignModule>) {
        self.propagation.set_aligner(branch, align);
    }

    /// Flow network parameters, named as in a standalone flow checkpoint
    pub fn visit_flow_params(
        &mut self,
        prefix: &str,
        visitor: &mut ParamVisitor<'_>,
    ) -> DepthResult<()> {
        self.flow.network_mut().visit_params(prefix, visitor)
    }

    /// Run the stage on one sequence
    pub fn forward(
        &self,
        input: &StageInput<'_>,
        device: &ComputeDevice,
        policy: OffloadPolicy,
    ) -> DepthResult<Reconstruction> {
        let (n, frames, _, h, w) = input.measurements.dim();
        if input.flow_guides.dim().1 != frames || input.guides.dim().1 != frames {
            return Err(DepthError::shape(
                "DepthStage guides",
                format!("{} frames", frames),
                &[input.flow_guides.dim().1, input.guides.dim().1],
            ));
        }
        let tier = StorageTier::select(frames, self.cpu_cache_length, device, policy);
        let mirrored = is_mirror_extended(input.measurements);
        info!(
            stage = self.spec.stage.checkpoint_key(),
            batch = n,
            frames,
            height = h,
            width = w,
            offload = tier.is_offloaded(),
            mirrored,
            "Running stage"
        );

        let start = Instant::now();
        let spatial = self
            .features
            .extract(input.measurements, input.guides, input.carried, &tier)?;
        let flows = self.flow.estimate(input.flow_guides, mirrored, &tier)?;
        let branches = self
            .propagation
            .propagate_all(&spatial, &flows, &tier, device)?;
        let output = self
            .reconstruct
            .reconstruct(input.measurements, &spatial, &branches, &tier)?;
        debug!(
            stage = self.spec.stage.checkpoint_key(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            transfers = tier.transfers(),
            "Stage complete"
        );
        Ok(output)
    }
}

impl Parameterized for DepthStage {
    /// Names follow `{component}.{hg_1|hg_2}.…`
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        let key = self.spec.stage.checkpoint_key();
        self.visit_flow_params(&param_name(prefix, &format!("spynet.{}", key)), visitor)?;
        self.features
            .visit_guide_params(&param_name(prefix, &format!("conv_guide_init.{}", key)), visitor)?;
        self.features
            .visit_params(&param_name(prefix, &format!("feat_extract.{}", key)), visitor)?;
        self.propagation.visit_stage_params(prefix, key, visitor)?;
        self.reconstruct.visit_stage_params(prefix, key, visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RefineSignal;

    fn config() -> Config {
        Config {
            mid_channels: 4,
            num_blocks: 1,
            scale: 8,
            deform_groups: 2,
            ..Config::default()
        }
    }

    #[test]
    fn test_specs_follow_refine_signal() {
        let mut config = config();
        assert_eq!(StageSpec::refine(&config).guide_channels, 9);
        assert_eq!(StageSpec::refine(&config).carried_channels, 4);
        config.refine_signal = RefineSignal::DepthConfidence;
        let initial = StageSpec::for_stage(Stage::Initial, &config);
        assert_eq!(initial.guide_channels, 3);
        assert_eq!(initial.carried_channels, 0);
        assert_eq!(StageSpec::refine(&config).guide_channels, 2);
    }

    #[test]
    fn test_param_names_are_stage_scoped() {
        let config = config();
        let mut init = Initializer::new(0);
        let mut stage = DepthStage::new(StageSpec::refine(&config), &config, &mut init).unwrap();
        let mut names = Vec::new();
        stage
            .visit_params("", &mut |name, _, _| {
                names.push(name.to_string());
                Ok(())
            })
            .unwrap();
        for expected in [
            "spynet.hg_2.basic_module.0.basic_module.0.conv.weight",
            "conv_guide_init.hg_2.0.weight",
            "feat_extract.hg_2.main.0.weight",
            "deform_align.hg_2.forward_2.conv_offset.6.bias",
            "backbone.hg_2.backward_1.main.2.0.conv2.weight",
            "reconstruction.hg_2.main.0.bias",
            "final_pred.hg_2.2.upsample_conv.weight",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
        assert!(names.iter().all(|n| !n.contains("hg_1")));
    }

    #[test]
    fn test_frame_count_mismatch_rejected() {
        let config = config();
        let mut init = Initializer::new(0);
        let stage = DepthStage::new(StageSpec::initial(&config), &config, &mut init).unwrap();
        let meas = Tensor5::zeros((1, 2, 1, 2, 2));
        let guides = Tensor5::zeros((1, 3, 3, 8, 8));
        let input = StageInput {
            measurements: &meas,
            flow_guides: &guides,
            guides: &guides,
            carried: None,
        };
        assert!(stage
            .forward(&input, &ComputeDevice::Cpu, OffloadPolicy::Auto)
            .is_err());
    }
}
