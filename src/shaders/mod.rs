// SPDX-License-Identifier: GPL-3.0-only
//! Compute shaders and their GPU processors

pub mod flow_warp;
mod gpu_processor;

pub use flow_warp::{FLOW_WARP_SHADER, FlowWarpProcessor};
pub use gpu_processor::{CachedDimensions, compute_dispatch_size, read_buffer_async};
