// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline-wide constants
//!
//! Numeric guards, fixed layer widths and default configuration values shared by
//! the pipeline stages and the learned operators.

/// Guard added to the squared depth in the inverse-square intensity falloff
pub const INTENSITY_EPS: f32 = 1e-3;
/// Guard added to CDF maxima and histogram sums before normalisation
pub const CDF_EPS: f32 = 1e-3;
/// Error-map value for pixels without a valid sensor measurement
pub const MISSING_MEASUREMENT: f32 = -1.0;

/// Negative slope of every LeakyReLU in the network
pub const LEAKY_RELU_SLOPE: f32 = 0.1;

/// Ratio between output resolution and feature (propagation) resolution
pub const FEATURE_STRIDE: usize = 4;

/// Channels of the positional encoding: absolute, patch-relative, patch anchor (y, x each)
pub const POS_ENCODING_CHANNELS: usize = 6;

/// Width of the prediction head after the second pixel shuffle
pub const HEAD_CHANNELS: usize = 64;
/// Output channels of the prediction head (depth residual, confidence)
pub const HEAD_OUTPUTS: usize = 2;

/// Residual blocks in the spatial feature extractor and in the fusion stack
pub const EXTRACT_BLOCKS: usize = 5;

/// Kernel taps of the 3×3 deformable convolution
pub const DEFORM_KERNEL_TAPS: usize = 9;

/// SPyNet pyramid depth (input is resized to a multiple of 2^(levels-1))
pub const SPYNET_LEVELS: usize = 6;
/// Alignment SPyNet requires for its input size
pub const SPYNET_ALIGNMENT: usize = 32;
/// ImageNet normalisation used by SPyNet
pub const SPYNET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const SPYNET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Cubic convolution coefficient used by bicubic resampling
pub const BICUBIC_A: f32 = -0.75;

/// Default configuration values
pub mod defaults {
    pub const MID_CHANNELS: usize = 64;
    pub const NUM_BLOCKS: usize = 7;
    pub const SCALE: usize = 16;
    pub const MAX_RESIDUE_MAGNITUDE: f32 = 10.0;
    pub const CPU_CACHE_LENGTH: usize = 200;
    pub const DEFORM_GROUPS: usize = 16;
    pub const MPEAKS: usize = 1;
    pub const TEMP_RES: usize = 1024;
    pub const SEED: u64 = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spynet_alignment_matches_levels() {
        assert_eq!(1 << (SPYNET_LEVELS - 1), SPYNET_ALIGNMENT);
    }

    #[test]
    fn test_default_scale_is_feature_multiple() {
        assert_eq!(defaults::SCALE % FEATURE_STRIDE, 0);
        assert_eq!((2 * defaults::MID_CHANNELS) % defaults::DEFORM_GROUPS, 0);
    }
}
