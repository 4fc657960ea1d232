// SPDX-License-Identifier: GPL-3.0-only

//! Consecutive-frame optical flow at feature resolution

use super::branch::Direction;
use super::storage::StorageTier;
use crate::constants::FEATURE_STRIDE;
use crate::errors::{DepthError, DepthResult};
use crate::nn::FlowModule;
use crate::tensor::{Tensor4, Tensor5, expect_dims, fold_time, frame_at, resize_bicubic, unfold_time};
use ndarray::s;
use tracing::debug;

/// Flow fields of one sequence, `T-1` per direction
///
/// `backward[k]` aligns frame `k+1` onto frame `k`; `forward[k]` aligns frame
/// `k` onto frame `k+1`. Forward fields are absent for mirror-extended
/// sequences and derived by time reversal instead.
#[derive(Debug, Clone)]
pub struct FlowFields {
    backward: Vec<Tensor4>,
    forward: Option<Vec<Tensor4>>,
}

/// Flow sequence seen by one propagation direction
#[derive(Debug, Clone, Copy)]
pub enum DirectedFlows<'a> {
    Direct(&'a [Tensor4]),
    /// Time-reversed backward fields
    Reversed(&'a [Tensor4]),
}

impl<'a> DirectedFlows<'a> {
    pub fn len(&self) -> usize {
        match self {
            Self::Direct(fields) | Self::Reversed(fields) => fields.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> DepthResult<&'a Tensor4> {
        let len = self.len();
        let field = match self {
            Self::Direct(fields) => fields.get(index),
            Self::Reversed(fields) => len
                .checked_sub(index + 1)
                .and_then(|reversed| fields.get(reversed)),
        };
        field.ok_or_else(|| {
            DepthError::Other(format!("flow index {} outside {} fields", index, len))
        })
    }
}

impl FlowFields {
    pub fn new(backward: Vec<Tensor4>, forward: Option<Vec<Tensor4>>) -> DepthResult<Self> {
        if let Some(forward) = &forward {
            if forward.len() != backward.len() {
                return Err(DepthError::shape(
                    "FlowFields",
                    format!("{} forward fields", backward.len()),
                    &[forward.len()],
                ));
            }
        }
        Ok(Self { backward, forward })
    }

    pub fn backward(&self) -> &[Tensor4] {
        &self.backward
    }

    pub fn forward(&self) -> Option<&[Tensor4]> {
        self.forward.as_deref()
    }

    /// Whether forward fields are derived from the backward ones
    pub fn is_mirrored(&self) -> bool {
        self.forward.is_none()
    }

    /// Fields for a propagation direction, checked against the sequence length
    pub fn directed(&self, direction: Direction, frames: usize) -> DepthResult<DirectedFlows<'_>> {
        let expected = frames.saturating_sub(1);
        if self.backward.len() != expected {
            return Err(DepthError::shape(
                "FlowFields",
                format!("{} fields for {} frames", expected, frames),
                &[self.backward.len()],
            ));
        }
        Ok(match (direction, &self.forward) {
            (Direction::Backward, _) => DirectedFlows::Direct(&self.backward),
            (Direction::Forward, Some(forward)) => DirectedFlows::Direct(forward),
            (Direction::Forward, None) => DirectedFlows::Reversed(&self.backward),
        })
    }
}

/// Wraps a flow network for one stage
pub struct FlowEstimator {
    network: Box<dyn FlowModule>,
}

impl FlowEstimator {
    pub fn new(network: Box<dyn FlowModule>) -> Self {
        Self { network }
    }

    pub fn network_mut(&mut self) -> &mut dyn FlowModule {
        self.network.as_mut()
    }

    /// Reduce a full-resolution flow to feature resolution
    fn to_feature_resolution(flow: &Tensor4) -> Tensor4 {
        let (_, _, h, w) = flow.dim();
        resize_bicubic(flow, h / FEATURE_STRIDE, w / FEATURE_STRIDE) / FEATURE_STRIDE as f32
    }

    /// One call over every consecutive pair stacked on the batch axis
    fn batched(&self, first: &Tensor5, second: &Tensor5) -> DepthResult<Vec<Tensor4>> {
        let (n, pairs, _, _, _) = first.dim();
        let flows = self.network.estimate(&fold_time(first)?, &fold_time(second)?)?;
        let flows = unfold_time(Self::to_feature_resolution(&flows), n, pairs)?;
        Ok((0..pairs).map(|k| frame_at(&flows, k)).collect())
    }

    /// One call per pair, each result staged out immediately
    fn sequential(
        &self,
        first: &Tensor5,
        second: &Tensor5,
        tier: &StorageTier,
    ) -> DepthResult<Vec<Tensor4>> {
        let pairs = first.dim().1;
        (0..pairs)
            .map(|k| {
                let flow = self
                    .network
                    .estimate(&frame_at(first, k), &frame_at(second, k))?;
                Ok(tier.stage_out(Self::to_feature_resolution(&flow)))
            })
            .collect()
    }

    fn pairs(&self, first: &Tensor5, second: &Tensor5, tier: &StorageTier) -> DepthResult<Vec<Tensor4>> {
        if first.dim().1 == 0 {
            return Ok(Vec::new());
        }
        if tier.is_offloaded() {
            self.sequential(first, second, tier)
        } else {
            self.batched(first, second)
        }
    }

    /// Flow fields of an `N×T×3×H×W` guidance sequence
    pub fn estimate(
        &self,
        guides: &Tensor5,
        mirrored: bool,
        tier: &StorageTier,
    ) -> DepthResult<FlowFields> {
        let (_, frames, channels, h, w) = guides.dim();
        if channels != 3 || h % FEATURE_STRIDE != 0 || w % FEATURE_STRIDE != 0 {
            return Err(DepthError::shape(
                "FlowEstimator",
                format!("N×T×3×H×W guidance with H, W divisible by {}", FEATURE_STRIDE),
                guides.shape(),
            ));
        }
        let pairs = frames.saturating_sub(1);
        let earlier = guides.slice(s![.., 0..pairs, .., .., ..]).to_owned();
        let later = guides.slice(s![.., 1..frames.max(1), .., .., ..]).to_owned();

        debug!(pairs, mirrored, offload = tier.is_offloaded(), "Computing flows");
        let backward = self.pairs(&earlier, &later, tier)?;
        let forward = if mirrored {
            None
        } else {
            Some(self.pairs(&later, &earlier, tier)?)
        };
        for field in &backward {
            expect_dims(
                "backward flow",
                field,
                [None, Some(2), Some(h / FEATURE_STRIDE), Some(w / FEATURE_STRIDE)],
            )?;
        }
        FlowFields::new(backward, forward)
    }
}
