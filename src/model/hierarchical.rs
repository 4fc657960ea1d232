// SPDX-License-Identifier: GPL-3.0-only

//! Two-stage hierarchical depth video super-resolution
//!
//! Stage 1 predicts depth and confidence from the measurement and the RGB
//! guidance. Its prediction is turned into a side channel (with the histogram
//! matching error when sensor statistics are available) that guides stage 2,
//! which also reuses the stage-1 fused features. The final depth blends both
//! stages with per-pixel softmax weights over their confidences.

use super::branch::Stage;
use super::histogram::{matching_error, positional_encoding};
use super::stage::{DepthStage, StageInput, StageSpec};
use super::storage::{ComputeDevice, OffloadPolicy};
use crate::config::{Config, RefineSignal};
use crate::constants::FEATURE_STRIDE;
use crate::errors::{DepthError, DepthResult};
use crate::nn::{FlowModule, Initializer, ParamVisitor, Parameterized, WeightStore};
use crate::nn::weights::export_state_dict;
use crate::tensor::{Tensor5, concat_sequence_channels, fold_time, sequence_channels, unfold_time};
use ndarray::Zip;
use std::path::Path;
use tracing::info;

/// Compressed dToF statistics of a sequence at sensor resolution
#[derive(Debug, Clone)]
pub struct SensorObservation {
    /// `N×T×m×h×w` histogram peak positions, in bins
    pub peaks: Tensor5,
    /// `N×T×(2m+2)×h×w` compressed CDF values
    pub cdfs: Tensor5,
    /// `N×T×(2m+2)×h×w` non-decreasing rebin boundaries, in bins
    pub rebins: Tensor5,
}

impl SensorObservation {
    pub fn new(peaks: Tensor5, cdfs: Tensor5, rebins: Tensor5) -> DepthResult<Self> {
        let (n, t, m, h, w) = peaks.dim();
        let expected = (n, t, 2 * m + 2, h, w);
        for (context, tensor) in [
            ("SensorObservation cdfs", &cdfs),
            ("SensorObservation rebins", &rebins),
        ] {
            if tensor.dim() != expected {
                return Err(DepthError::shape(
                    context,
                    format!("{}×{}×{}×{}×{}", n, t, 2 * m + 2, h, w),
                    tensor.shape(),
                ));
            }
        }
        Ok(Self {
            peaks,
            cdfs,
            rebins,
        })
    }

    /// Split a packed `N×T×(5m+4)×h×w` tensor: peaks, CDFs, rebin boundaries
    pub fn from_packed(packed: &Tensor5, mpeaks: usize) -> DepthResult<Self> {
        let bins = 2 * mpeaks + 2;
        if packed.dim().2 != mpeaks + 2 * bins {
            return Err(DepthError::shape(
                "SensorObservation::from_packed",
                format!("{} channels for {} peaks", mpeaks + 2 * bins, mpeaks),
                packed.shape(),
            ));
        }
        Self::new(
            sequence_channels(packed, 0, mpeaks)?,
            sequence_channels(packed, mpeaks, bins)?,
            sequence_channels(packed, mpeaks + bins, bins)?,
        )
    }

    pub fn mpeaks(&self) -> usize {
        self.peaks.dim().2
    }
}

/// Measurement input of the model
#[derive(Debug, Clone)]
pub enum Observation {
    /// Sensor histogram statistics
    Histogram(SensorObservation),
    /// `N×T×1×h×w` normalised low-resolution depth
    Depth(Tensor5),
}

impl Observation {
    fn sensor_dims(&self) -> (usize, usize, usize, usize) {
        let (n, t, _, h, w) = match self {
            Self::Histogram(obs) => obs.peaks.dim(),
            Self::Depth(depth) => depth.dim(),
        };
        (n, t, h, w)
    }
}

/// Result of one evaluation, every tensor `N×T×1×H×W`
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Confidence-blended depth
    pub depth: Tensor5,
    pub stage1_depth: Tensor5,
    pub stage2_depth: Tensor5,
    /// Normalised blend weight of stage 1
    pub stage1_weight: Tensor5,
    /// Normalised blend weight of stage 2
    pub stage2_weight: Tensor5,
}

/// Per-pixel softmax over two confidence maps
pub fn blend_confidence(first: &Tensor5, second: &Tensor5) -> DepthResult<(Tensor5, Tensor5)> {
    if first.dim() != second.dim() {
        return Err(DepthError::shape(
            "blend_confidence",
            format!("{:?}", first.shape()),
            second.shape(),
        ));
    }
    let mut w1 = Tensor5::zeros(first.raw_dim());
    let mut w2 = Tensor5::zeros(first.raw_dim());
    Zip::from(&mut w1)
        .and(&mut w2)
        .and(first)
        .and(second)
        .for_each(|w1, w2, &a, &b| {
            let top = a.max(b);
            let (ea, eb) = ((a - top).exp(), (b - top).exp());
            let total = ea + eb;
            *w1 = ea / total;
            *w2 = eb / total;
        });
    Ok((w1, w2))
}

/// Repeat every pixel `factor×factor` times in a sequence
fn repeat_spatial(seq: &Tensor5, factor: usize) -> Tensor5 {
    let (n, t, c, h, w) = seq.dim();
    Tensor5::from_shape_fn((n, t, c, h * factor, w * factor), |(b, f, ch, y, x)| {
        seq[[b, f, ch, y / factor, x / factor]]
    })
}

pub struct HierarchicalDepthModel {
    config: Config,
    stages: [DepthStage; 2],
    device: ComputeDevice,
    offload_policy: OffloadPolicy,
}

impl HierarchicalDepthModel {
    /// Build both stages with seeded initial weights
    ///
    /// Checkpoints named in the configuration are not read here, see
    /// [`HierarchicalDepthModel::init_weights`].
    pub fn new(config: Config) -> DepthResult<Self> {
        config.validate()?;
        let mut init = Initializer::new(config.seed);
        let initial = DepthStage::new(StageSpec::initial(&config), &config, &mut init)?;
        let refine = DepthStage::new(StageSpec::refine(&config), &config, &mut init)?;
        let device = ComputeDevice::from_preference(config.device)?;
        info!(
            mid_channels = config.mid_channels,
            num_blocks = config.num_blocks,
            scale = config.scale,
            refine_signal = ?config.refine_signal,
            device = device.name(),
            "Model constructed"
        );
        Ok(Self {
            config,
            stages: [initial, refine],
            device,
            offload_policy: OffloadPolicy::Auto,
        })
    }

    pub fn with_device(mut self, device: ComputeDevice) -> Self {
        self.device = device;
        self
    }

    pub fn with_offload_policy(mut self, policy: OffloadPolicy) -> Self {
        self.offload_policy = policy;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &ComputeDevice {
        &self.device
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut DepthStage {
        &mut self.stages[stage.index()]
    }

    /// Replace the flow network of one stage
    pub fn set_flow_network(&mut self, stage: Stage, network: Box<dyn FlowModule>) {
        self.stage_mut(stage).set_flow_network(network);
    }

    /// Load the checkpoints named in the configuration
    ///
    /// The flow checkpoint is applied first so a full model checkpoint
    /// overrides it.
    pub fn init_weights(&mut self) -> DepthResult<()> {
        if let Some(path) = self.config.flow_pretrained.clone() {
            self.load_flow_weights(&path)?;
        }
        if let Some(path) = self.config.pretrained.clone() {
            self.load_weights(&path)?;
        }
        Ok(())
    }

    fn open_store(&self, path: &Path) -> DepthResult<WeightStore> {
        WeightStore::from_file(path, self.config.key_prefix.as_deref(), self.config.strict_load)
    }

    /// Load a full model checkpoint
    pub fn load_weights(&mut self, path: &Path) -> DepthResult<()> {
        let store = self.open_store(path)?;
        self.apply_weights(store)
    }

    /// Load a full model checkpoint from an in-memory safetensors buffer
    pub fn load_weights_from_bytes(&mut self, bytes: &[u8]) -> DepthResult<()> {
        let store = WeightStore::from_bytes(
            bytes,
            self.config.key_prefix.as_deref(),
            self.config.strict_load,
        )?;
        self.apply_weights(store)
    }

    fn apply_weights(&mut self, mut store: WeightStore) -> DepthResult<()> {
        let tensors = store.len();
        store.load_into(self, "")?;
        store.finish()?;
        info!(tensors, "Model weights loaded");
        Ok(())
    }

    /// Load a standalone flow-network checkpoint into both stages
    pub fn load_flow_weights(&mut self, path: &Path) -> DepthResult<()> {
        let mut store = self.open_store(path)?;
        for stage in &mut self.stages {
            stage.visit_flow_params("", &mut |name, shape, data| {
                store.fill(name, shape, data).map(|_| ())
            })?;
        }
        store.finish()?;
        info!(path = %path.display(), "Flow weights loaded");
        Ok(())
    }

    /// Every parameter serialised as safetensors
    pub fn state_dict_bytes(&mut self) -> DepthResult<Vec<u8>> {
        export_state_dict(self, "")
    }

    /// Feature-resolution measurement: normalised peaks or depth, repeated to `h/4×w/4`
    fn measurements(&self, observation: &Observation) -> DepthResult<Tensor5> {
        let repeat = self.config.sensor_repeat();
        match (self.config.refine_signal, observation) {
            (RefineSignal::HistogramFeedback, Observation::Histogram(obs)) => {
                if obs.mpeaks() != self.config.mpeaks {
                    return Err(DepthError::shape(
                        "HierarchicalDepthModel peaks",
                        format!("{} peak channels", self.config.mpeaks),
                        obs.peaks.shape(),
                    ));
                }
                let levels = self.config.temp_res.saturating_sub(1) as f32;
                Ok(repeat_spatial(&(&obs.peaks / levels), repeat))
            }
            (RefineSignal::DepthConfidence, Observation::Depth(depth)) => {
                if depth.dim().2 != 1 {
                    return Err(DepthError::shape(
                        "HierarchicalDepthModel depth",
                        "single-channel depth",
                        depth.shape(),
                    ));
                }
                Ok(repeat_spatial(depth, repeat))
            }
            (RefineSignal::HistogramFeedback, Observation::Depth(_)) => Err(DepthError::Config(
                "histogram feedback refinement needs a sensor histogram observation".into(),
            )),
            (RefineSignal::DepthConfidence, Observation::Histogram(_)) => Err(DepthError::Config(
                "depth/confidence refinement needs a low-resolution depth observation".into(),
            )),
        }
    }

    /// Stage-2 side channel derived from the stage-1 prediction
    fn side_channel(
        &self,
        observation: &Observation,
        guides: &Tensor5,
        depth: &Tensor5,
        confidence: &Tensor5,
    ) -> DepthResult<Tensor5> {
        let Observation::Histogram(obs) = observation else {
            return concat_sequence_channels(&[depth.view(), confidence.view()]);
        };
        let (n, t, _, h, w) = depth.dim();
        let pitch = self.config.scale;
        let error = matching_error(
            &fold_time(&obs.cdfs)?,
            &fold_time(&obs.rebins)?,
            &fold_time(depth)?,
            &fold_time(guides)?,
            pitch,
            self.config.temp_res,
        )?;
        let error = unfold_time(error, n, t)?;
        let position = positional_encoding(n, t, h, w, pitch)?;
        concat_sequence_channels(&[
            depth.view(),
            confidence.view(),
            position.view(),
            error.view(),
        ])
    }

    /// Evaluate the model on one sequence
    ///
    /// `guides` is the `N×T×3×H×W` RGB guidance with `H = scale·h`.
    pub fn forward(&self, observation: &Observation, guides: &Tensor5) -> DepthResult<ModelOutput> {
        let (n, t, h, w) = observation.sensor_dims();
        let scale = self.config.scale;
        if guides.dim() != (n, t, 3, h * scale, w * scale) {
            return Err(DepthError::shape(
                "HierarchicalDepthModel guides",
                format!("{}×{}×3×{}×{}", n, t, h * scale, w * scale),
                guides.shape(),
            ));
        }
        if t == 0 {
            return Err(DepthError::shape("HierarchicalDepthModel", "at least one frame", &[0]));
        }
        info!(
            batch = n,
            frames = t,
            height = h * scale,
            width = w * scale,
            feature_stride = FEATURE_STRIDE,
            "Evaluating sequence"
        );

        let measurements = self.measurements(observation)?;
        let [initial, refine] = &self.stages;
        let first = initial.forward(
            &StageInput {
                measurements: &measurements,
                flow_guides: guides,
                guides,
                carried: None,
            },
            &self.device,
            self.offload_policy,
        )?;

        let side = self.side_channel(observation, guides, &first.depth, &first.confidence)?;
        let second = refine.forward(
            &StageInput {
                measurements: &measurements,
                flow_guides: guides,
                guides: &side,
                carried: Some(&first.fused),
            },
            &self.device,
            self.offload_policy,
        )?;

        let (stage1_weight, stage2_weight) = blend_confidence(&first.confidence, &second.confidence)?;
        let depth = &second.depth * &stage2_weight + &first.depth * &stage1_weight;
        Ok(ModelOutput {
            depth,
            stage1_depth: first.depth,
            stage2_depth: second.depth,
            stage1_weight,
            stage2_weight,
        })
    }
}

impl Parameterized for HierarchicalDepthModel {
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        for stage in &mut self.stages {
            stage.visit_params(prefix, visitor)?;
        }
        Ok(())
    }
}
