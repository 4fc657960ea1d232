// SPDX-License-Identifier: GPL-3.0-only

//! Model configuration
//!
//! The numeric surface is fixed when the model is constructed. Configuration is
//! read from JSON; the pretrained-weight fields accept only a path string or
//! `null`, anything else is rejected with a type error.

use crate::constants::{FEATURE_STRIDE, POS_ENCODING_CHANNELS, defaults};
use crate::errors::{DepthError, DepthResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// Name of the directory under the user config dir
const CONFIG_DIR_NAME: &str = "depth-vsr";
/// File name of the JSON configuration
const CONFIG_FILE_NAME: &str = "config.json";

/// Side channel fed to the refinement stage
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum RefineSignal {
    /// Stage-1 depth and confidence, positional encoding and histogram
    /// matching error (requires the compressed sensor statistics)
    #[default]
    HistogramFeedback,
    /// Stage-1 depth and confidence only (plain low-resolution depth input)
    DepthConfidence,
}

impl RefineSignal {
    /// Channels of the refinement side channel at full resolution
    pub fn side_channels(&self) -> usize {
        match self {
            // depth + confidence + positional encoding + matching error
            Self::HistogramFeedback => 2 + POS_ENCODING_CHANNELS + 1,
            Self::DepthConfidence => 2,
        }
    }
}

/// Where the compute kernels should run
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum DevicePreference {
    /// Always run on the CPU
    #[default]
    Cpu,
    /// Use a GPU adapter when one is available, otherwise the CPU
    Auto,
    /// Require a GPU adapter
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Channel count of the intermediate features
    pub mid_channels: usize,
    /// Residual blocks in each propagation branch
    pub num_blocks: usize,
    /// dToF sensor downsampling scale (also the histogram patch pitch)
    pub scale: usize,
    /// Bound on the learned deformable offset residue
    pub max_residue_magnitude: f32,
    /// Sequences longer than this are processed with host offload on an accelerator
    pub cpu_cache_length: usize,
    /// Deformable convolution groups
    pub deform_groups: usize,
    /// Number of histogram peaks reported per sensor pixel
    pub mpeaks: usize,
    /// Temporal resolution (bin count) of the dToF sensor
    pub temp_res: usize,
    /// Refinement stage side channel composition
    pub refine_signal: RefineSignal,
    /// Compute device preference
    pub device: DevicePreference,
    /// Seed for weight initialisation when no checkpoint is loaded
    pub seed: u64,
    /// Model checkpoint (safetensors)
    #[serde(deserialize_with = "deserialize_pretrained")]
    pub pretrained: Option<PathBuf>,
    /// Separate checkpoint for the flow networks
    #[serde(deserialize_with = "deserialize_pretrained")]
    pub flow_pretrained: Option<PathBuf>,
    /// Fail on missing or unexpected checkpoint tensors
    pub strict_load: bool,
    /// Prefix stripped from checkpoint keys (e.g. "generator.")
    pub key_prefix: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mid_channels: defaults::MID_CHANNELS,
            num_blocks: defaults::NUM_BLOCKS,
            scale: defaults::SCALE,
            max_residue_magnitude: defaults::MAX_RESIDUE_MAGNITUDE,
            cpu_cache_length: defaults::CPU_CACHE_LENGTH,
            deform_groups: defaults::DEFORM_GROUPS,
            mpeaks: defaults::MPEAKS,
            temp_res: defaults::TEMP_RES,
            refine_signal: RefineSignal::default(),
            device: DevicePreference::default(),
            seed: defaults::SEED,
            pretrained: None,
            flow_pretrained: None,
            strict_load: true,
            key_prefix: None,
        }
    }
}

impl Config {
    /// Parse a JSON configuration and validate it
    pub fn from_json_str(json: &str) -> DepthResult<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load(path: &Path) -> DepthResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Default location: `<config dir>/depth-vsr/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> DepthResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Measurement channels consumed by the feature extractor
    pub fn measurement_channels(&self) -> usize {
        match self.refine_signal {
            RefineSignal::HistogramFeedback => self.mpeaks,
            RefineSignal::DepthConfidence => 1,
        }
    }

    /// Channels of the compressed CDF / rebin index arrays
    pub fn histogram_channels(&self) -> usize {
        2 * self.mpeaks + 2
    }

    /// Repetition factor from sensor resolution to feature resolution
    pub fn sensor_repeat(&self) -> usize {
        self.scale / FEATURE_STRIDE
    }

    /// Check the numeric surface for consistency
    pub fn validate(&self) -> DepthResult<()> {
        if self.mid_channels == 0 {
            return Err(DepthError::Config("mid_channels must be positive".into()));
        }
        if self.scale == 0 || self.scale % FEATURE_STRIDE != 0 {
            return Err(DepthError::Config(format!(
                "scale must be a positive multiple of {}, got {}",
                FEATURE_STRIDE, self.scale
            )));
        }
        if self.deform_groups == 0 || (2 * self.mid_channels) % self.deform_groups != 0 {
            return Err(DepthError::Config(format!(
                "2 * mid_channels ({}) must be divisible by deform_groups ({})",
                2 * self.mid_channels,
                self.deform_groups
            )));
        }
        if self.deform_groups % 2 != 0 {
            return Err(DepthError::Config(format!(
                "deform_groups must be even, got {}",
                self.deform_groups
            )));
        }
        if self.mpeaks == 0 {
            return Err(DepthError::Config("mpeaks must be positive".into()));
        }
        if self.temp_res < 2 {
            return Err(DepthError::Config(format!(
                "temp_res must be at least 2, got {}",
                self.temp_res
            )));
        }
        if !self.max_residue_magnitude.is_finite() || self.max_residue_magnitude <= 0.0 {
            return Err(DepthError::Config(format!(
                "max_residue_magnitude must be positive, got {}",
                self.max_residue_magnitude
            )));
        }
        Ok(())
    }
}

/// Interpret a pretrained-weight argument: a path string or null
pub fn pretrained_from_value(value: &serde_json::Value) -> DepthResult<Option<PathBuf>> {
    use serde_json::Value;
    match value {
        Value::String(path) => Ok(Some(PathBuf::from(path))),
        Value::Null => Ok(None),
        other => Err(DepthError::Config(format!(
            "\"pretrained\" must be a str or None. But received {}.",
            json_type_name(other)
        ))),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "str",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn deserialize_pretrained<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    pretrained_from_value(&value).map_err(serde::de::Error::custom)
}
