// SPDX-License-Identifier: GPL-3.0-only

//! GPU flow warping
//!
//! Backward bilinear warp of feature and flow tensors. Produces the same
//! values as [`crate::tensor::flow_warp`] up to float rounding.

mod processor;

pub use processor::FlowWarpProcessor;

/// Flow-warp shader source
pub const FLOW_WARP_SHADER: &str = include_str!("flow_warp.wgsl");

#[cfg(test)]
mod tests {
    use super::*;

    /// Validate that a WGSL shader compiles successfully using naga
    fn validate_shader(name: &str, source: &str) {
        let result = naga::front::wgsl::parse_str(source);
        match result {
            Ok(module) => {
                let info = naga::valid::Validator::new(
                    naga::valid::ValidationFlags::all(),
                    naga::valid::Capabilities::all(),
                )
                .validate(&module);

                if let Err(e) = info {
                    panic!("Shader '{}' validation failed: {:?}", name, e);
                }
            }
            Err(e) => {
                panic!("Shader '{}' parse failed: {:?}", name, e);
            }
        }
    }

    #[test]
    fn test_flow_warp_shader_validates() {
        validate_shader("flow_warp", FLOW_WARP_SHADER);
    }
}
