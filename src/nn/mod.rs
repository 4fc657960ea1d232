// SPDX-License-Identifier: GPL-3.0-only

//! Learned operators
//!
//! Plain convolution stacks, the SPyNet flow network and the second-order
//! deformable alignment operator. The pipeline only depends on their
//! input/output contracts ([`FlowNetwork`], [`DeformableAlign`]); the
//! implementations here reproduce the pretrained blocks so checkpoints in the
//! PyTorch state-dict naming can be loaded directly.

pub mod deform;
pub mod layers;
pub mod spynet;
pub mod weights;

use crate::errors::DepthResult;
use crate::tensor::Tensor4;

pub use deform::SecondOrderDeformableAlignment;
pub use layers::{Conv2d, PixelShufflePack, ResidualBlockNoBN, ResidualBlocksWithInputConv};
pub use spynet::SpyNet;
pub use weights::{Initializer, WeightStore};

/// Callback receiving every parameter as (full name, shape, mutable data)
pub type ParamVisitor<'a> = dyn FnMut(&str, &[usize], &mut [f32]) -> DepthResult<()> + 'a;

/// Anything that owns named parameters
///
/// Names follow the PyTorch state-dict convention (`main.2.0.conv1.weight`), so
/// a checkpoint exported from PyTorch loads without renaming.
pub trait Parameterized {
    fn visit_params(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) -> DepthResult<()>;
}

/// Join a parameter path
pub fn param_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Optical flow between two frames
///
/// Returns an `N×2×H×W` field at the input resolution; channel 0 is dx and
/// channel 1 is dy, such that warping `supporting` by the flow aligns it to
/// `reference`.
pub trait FlowNetwork: Send + Sync {
    fn estimate(&self, reference: &Tensor4, supporting: &Tensor4) -> DepthResult<Tensor4>;
}

/// Flow-guided deformable alignment of the propagated features
///
/// * `features`: `N×2C×h×w`: the accumulator and the second-previous feature
/// * `condition`: `N×3C×h×w`: first-order warp, current feature, second-order warp
/// * `flow_1`, `flow_2`: `N×2×h×w` first- and (composed) second-order flows
///
/// Returns the corrected accumulator, `N×C×h×w`.
pub trait DeformableAlign: Send + Sync {
    fn align(
        &self,
        features: &Tensor4,
        condition: &Tensor4,
        flow_1: &Tensor4,
        flow_2: &Tensor4,
    ) -> DepthResult<Tensor4>;
}

/// Trait objects that also expose their parameters
pub trait FlowModule: FlowNetwork + Parameterized {}
impl<T: FlowNetwork + Parameterized> FlowModule for T {}

pub trait AlignModule: DeformableAlign + Parameterized {}
impl<T: DeformableAlign + Parameterized> AlignModule for T {}

/// Blocks injected by callers carry no parameters of ours
pub struct External<T>(pub T);

impl<T> Parameterized for External<T> {
    fn visit_params(&mut self, _prefix: &str, _visitor: &mut ParamVisitor<'_>) -> DepthResult<()> {
        Ok(())
    }
}

impl<T: FlowNetwork> FlowNetwork for External<T> {
    fn estimate(&self, reference: &Tensor4, supporting: &Tensor4) -> DepthResult<Tensor4> {
        self.0.estimate(reference, supporting)
    }
}

impl<T: DeformableAlign> DeformableAlign for External<T> {
    fn align(
        &self,
        features: &Tensor4,
        condition: &Tensor4,
        flow_1: &Tensor4,
        flow_2: &Tensor4,
    ) -> DepthResult<Tensor4> {
        self.0.align(features, condition, flow_1, flow_2)
    }
}
