// SPDX-License-Identifier: GPL-3.0-only

//! Depth video super-resolution from direct time-of-flight measurements
//!
//! Reconstructs per-frame dense depth and confidence from a low-resolution
//! dToF measurement stream, guided by a high-resolution RGB video.
//!
//! # Architecture
//!
//! - [`model`]: the two-stage propagation pipeline and histogram matching error
//! - [`nn`]: learned operators (convolution stacks, SPyNet, deformable alignment)
//!   and checkpoint loading
//! - [`tensor`]: NCHW array kernels
//! - [`gpu`], [`shaders`]: optional wgpu compute path for flow warping
//! - [`config`]: model configuration
//! - [`sequence`]: safetensors sequence files and PNG depth export
//!
//! # Example
//!
//! ```ignore
//! use depth_vsr::{Config, HierarchicalDepthModel, Observation, SensorObservation};
//!
//! let mut model = HierarchicalDepthModel::new(Config::default())?;
//! model.init_weights()?;
//! let observation = Observation::Histogram(SensorObservation::from_packed(&packed, 1)?);
//! let output = model.forward(&observation, &guides)?;
//! ```

pub mod config;
pub mod constants;
pub mod errors;
pub mod gpu;
pub mod model;
pub mod nn;
pub mod sequence;
pub mod shaders;
pub mod tensor;

// Re-export commonly used types
pub use config::{Config, DevicePreference, RefineSignal};
pub use errors::{DepthError, DepthResult};
pub use model::{
    ComputeDevice, HierarchicalDepthModel, ModelOutput, Observation, OffloadPolicy,
    SensorObservation, Stage,
};
pub use tensor::{Tensor4, Tensor5};
