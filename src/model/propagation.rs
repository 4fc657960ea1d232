// SPDX-License-Identifier: GPL-3.0-only

//! Bidirectional second-order flow-compensated propagation
//!
//! Four branches run in [`Branch::ORDER`]. Each walks the sequence once in its
//! direction, carrying an accumulator that is aligned onto the current frame
//! with the first-order flow and the composed second-order flow, then refined
//! by the branch backbone from the spatial feature, every earlier branch at the
//! same frame and the aligned accumulator.

use super::branch::{Branch, BranchArena, Direction};
use super::flow::{DirectedFlows, FlowFields};
use super::storage::{ComputeDevice, StorageTier};
use crate::errors::{DepthError, DepthResult};
use crate::nn::{
    AlignModule, Initializer, ParamVisitor, Parameterized, ResidualBlocksWithInputConv,
    SecondOrderDeformableAlignment, param_name,
};
use crate::tensor::{Padding, Tensor4, concat_channels, expect_dims};
use tracing::{debug, trace};

/// `flow_1 + warp(flow_2, flow_1)`: the displacement two steps back
pub fn compose_second_order(
    flow_1: &Tensor4,
    flow_2: &Tensor4,
    device: &ComputeDevice,
) -> DepthResult<Tensor4> {
    let mut composed = device.warp(flow_2, flow_1, Padding::Zeros)?;
    composed += flow_1;
    Ok(composed)
}

/// Flow index linking frame `idx` to the frame `order` steps earlier in `direction`
fn flow_index(direction: Direction, idx: usize, order: usize) -> usize {
    match direction {
        Direction::Forward => idx - order,
        Direction::Backward => idx + order - 1,
    }
}

pub struct PropagationEngine {
    align: [Box<dyn AlignModule>; 4],
    backbone: [ResidualBlocksWithInputConv; 4],
    mid_channels: usize,
}

impl PropagationEngine {
    pub fn new(
        init: &mut Initializer,
        mid_channels: usize,
        num_blocks: usize,
        deform_groups: usize,
        max_residue_magnitude: f32,
    ) -> DepthResult<Self> {
        let mut aligners = Vec::with_capacity(4);
        for _ in Branch::ORDER {
            aligners.push(Box::new(SecondOrderDeformableAlignment::new(
                init,
                mid_channels,
                deform_groups,
                max_residue_magnitude,
            )?) as Box<dyn AlignModule>);
        }
        let align: [Box<dyn AlignModule>; 4] = aligners
            .try_into()
            .map_err(|_| DepthError::Other("expected one aligner per branch".into()))?;
        let backbone = std::array::from_fn(|i| {
            ResidualBlocksWithInputConv::new(init, (2 + i) * mid_channels, mid_channels, num_blocks)
        });
        Ok(Self {
            align,
            backbone,
            mid_channels,
        })
    }

    /// Replace the alignment operator of one branch
    pub fn set_aligner(&mut self, branch: Branch, align: Box<dyn AlignModule>) {
        self.align[branch.index()] = align;
    }

    /// Parameters under `deform_align.{stage}.{branch}` and `backbone.{stage}.{branch}`
    pub fn visit_stage_params(
        &mut self,
        prefix: &str,
        stage_key: &str,
        visitor: &mut ParamVisitor<'_>,
    ) -> DepthResult<()> {
        for branch in Branch::ORDER {
            let i = branch.index();
            let align = format!("deform_align.{}.{}", stage_key, branch.name());
            let backbone = format!("backbone.{}.{}", stage_key, branch.name());
            self.align[i].visit_params(&param_name(prefix, &align), visitor)?;
            self.backbone[i].visit_params(&param_name(prefix, &backbone), visitor)?;
        }
        Ok(())
    }

    fn check_inputs(&self, spatial: &[Tensor4], flows: &FlowFields) -> DepthResult<(usize, usize, usize)> {
        let first = spatial
            .first()
            .ok_or_else(|| DepthError::shape("PropagationEngine", "at least one frame", &[]))?;
        let (n, _, h, w) = first.dim();
        let dims = [Some(n), Some(self.mid_channels), Some(h), Some(w)];
        for feature in spatial {
            expect_dims("spatial feature", feature, dims)?;
        }
        let flow_dims = [Some(n), Some(2), Some(h), Some(w)];
        for field in flows.backward().iter().chain(flows.forward().unwrap_or(&[])) {
            expect_dims("flow field", field, flow_dims)?;
        }
        Ok((n, h, w))
    }

    /// Run all four branches over `spatial` (one feature per frame)
    pub fn propagate_all(
        &self,
        spatial: &[Tensor4],
        flows: &FlowFields,
        tier: &StorageTier,
        device: &ComputeDevice,
    ) -> DepthResult<BranchArena> {
        let frames = spatial.len();
        let dims = self.check_inputs(spatial, flows)?;
        let mut arena = BranchArena::new(frames);
        for branch in Branch::ORDER {
            let directed = flows.directed(branch.direction, frames)?;
            debug!(
                branch = %branch,
                frames,
                reversed = matches!(directed, DirectedFlows::Reversed(_)),
                "Propagating"
            );
            self.propagate(branch, spatial, directed, dims, &mut arena, tier, device)?;
        }
        Ok(arena)
    }

    #[allow(clippy::too_many_arguments)]
    fn propagate(
        &self,
        branch: Branch,
        spatial: &[Tensor4],
        flows: DirectedFlows<'_>,
        (n, h, w): (usize, usize, usize),
        arena: &mut BranchArena,
        tier: &StorageTier,
        device: &ComputeDevice,
    ) -> DepthResult<()> {
        let frames = spatial.len();
        let align = &self.align[branch.index()];
        let backbone = &self.backbone[branch.index()];
        let mut prop = Tensor4::zeros((n, self.mid_channels, h, w));

        for step in 0..frames {
            let idx = branch.frame_at_step(step, frames);
            let current = tier.stage_in(&spatial[idx]);
            trace!(branch = %branch, step, frame = idx, "propagation step");

            if step > 0 {
                let flow_1 = tier.stage_in(flows.get(flow_index(branch.direction, idx, 1))?);
                let cond_1 = device.warp(&prop, &flow_1, Padding::Zeros)?;

                let (feat_2, flow_2, cond_2) = if step > 1 {
                    let previous = branch.frame_at_step(step - 2, frames);
                    let feat_2 = tier.stage_in(arena.get(branch, previous)?).into_owned();
                    let flow_2 = tier.stage_in(flows.get(flow_index(branch.direction, idx, 2))?);
                    let flow_2 = compose_second_order(&flow_1, &flow_2, device)?;
                    let cond_2 = device.warp(&feat_2, &flow_2, Padding::Zeros)?;
                    (feat_2, flow_2, cond_2)
                } else {
                    (
                        Tensor4::zeros(prop.raw_dim()),
                        Tensor4::zeros(flow_1.raw_dim()),
                        Tensor4::zeros(prop.raw_dim()),
                    )
                };

                let features = concat_channels(&[prop.view(), feat_2.view()])?;
                let condition = concat_channels(&[cond_1.view(), current.view(), cond_2.view()])?;
                prop = align.align(&features, &condition, &flow_1, &flow_2)?;
                expect_dims(
                    "aligned feature",
                    &prop,
                    [Some(n), Some(self.mid_channels), Some(h), Some(w)],
                )?;
            }

            let refined = {
                let earlier = branch
                    .earlier()
                    .iter()
                    .map(|&b| arena.get(b, idx).map(|f| tier.stage_in(f)))
                    .collect::<DepthResult<Vec<_>>>()?;
                let mut parts = vec![current.view()];
                parts.extend(earlier.iter().map(|f| f.view()));
                parts.push(prop.view());
                backbone.forward(&concat_channels(&parts)?)?
            };
            prop += &refined;

            arena.write(branch, idx, tier.stage_out(prop.clone()))?;
            tier.reclaim();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{DeformableAlign, External};
    use std::sync::{Arc, Mutex};

    /// Keeps the accumulator and records the first-order flow it was given
    struct RecordingAlign {
        seen: Arc<Mutex<Vec<f32>>>,
        channels: usize,
    }

    impl DeformableAlign for RecordingAlign {
        fn align(
            &self,
            features: &Tensor4,
            _condition: &Tensor4,
            flow_1: &Tensor4,
            _flow_2: &Tensor4,
        ) -> DepthResult<Tensor4> {
            self.seen.lock().unwrap().push(flow_1[[0, 0, 0, 0]]);
            Ok(features.slice(ndarray::s![.., 0..self.channels, .., ..]).to_owned())
        }
    }

    fn engine(mid: usize) -> PropagationEngine {
        let mut init = Initializer::new(11);
        PropagationEngine::new(&mut init, mid, 1, 2, 10.0).unwrap()
    }

    fn spatial(frames: usize, mid: usize) -> Vec<Tensor4> {
        (0..frames)
            .map(|t| {
                Tensor4::from_shape_fn((1, mid, 4, 5), |(_, c, y, x)| {
                    ((t * 13 + c * 7 + y * 3 + x) % 17) as f32 / 17.0
                })
            })
            .collect()
    }

    fn constant_flows(values: &[f32]) -> Vec<Tensor4> {
        values
            .iter()
            .map(|&v| Tensor4::from_elem((1, 2, 4, 5), v))
            .collect()
    }

    #[test]
    fn test_second_order_composition_of_constant_flow() {
        let v = Tensor4::from_shape_fn((1, 2, 8, 8), |(_, c, _, _)| if c == 0 { 1.0 } else { -1.0 });
        let composed = compose_second_order(&v, &v, &ComputeDevice::Cpu).unwrap();
        for y in 1..7 {
            for x in 0..7 {
                assert!((composed[[0, 0, y, x]] - 2.0).abs() < 1e-6);
                assert!((composed[[0, 1, y, x]] + 2.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_flow_indices_per_direction() {
        // Frame 3 of 5: forward reads F[2] then F[1]; backward reads F[3] then F[4]
        assert_eq!(flow_index(Direction::Forward, 3, 1), 2);
        assert_eq!(flow_index(Direction::Forward, 3, 2), 1);
        assert_eq!(flow_index(Direction::Backward, 3, 1), 3);
        assert_eq!(flow_index(Direction::Backward, 2, 2), 3);
    }

    fn recorded_flows(flows: &FlowFields, branch: Branch) -> Vec<f32> {
        let mid = 4;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut engine = engine(mid);
        engine.set_aligner(
            branch,
            Box::new(External(RecordingAlign {
                seen: seen.clone(),
                channels: mid,
            })),
        );
        engine
            .propagate_all(&spatial(4, mid), flows, &StorageTier::resident(), &ComputeDevice::Cpu)
            .unwrap();
        let recorded = seen.lock().unwrap().clone();
        recorded
    }

    #[test]
    fn test_branches_consume_flows_in_traversal_order() {
        let flows = FlowFields::new(
            constant_flows(&[1.0, 2.0, 3.0]),
            Some(constant_flows(&[-1.0, -2.0, -3.0])),
        )
        .unwrap();
        assert_eq!(recorded_flows(&flows, Branch::BACKWARD_1), vec![3.0, 2.0, 1.0]);
        assert_eq!(recorded_flows(&flows, Branch::FORWARD_2), vec![-1.0, -2.0, -3.0]);
    }

    #[test]
    fn test_mirrored_forward_branch_reads_reversed_backward_flows() {
        let flows = FlowFields::new(constant_flows(&[1.0, 2.0, 3.0]), None).unwrap();
        assert_eq!(recorded_flows(&flows, Branch::FORWARD_1), vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_all_branches_complete_with_expected_shapes() {
        let mid = 4;
        let flows = FlowFields::new(constant_flows(&[0.5, 0.0, -0.5]), None).unwrap();
        let arena = engine(mid)
            .propagate_all(&spatial(4, mid), &flows, &StorageTier::resident(), &ComputeDevice::Cpu)
            .unwrap();
        for branch in Branch::ORDER {
            assert!(arena.is_complete(branch));
            assert_eq!(arena.get(branch, 2).unwrap().dim(), (1, mid, 4, 5));
        }
    }

    #[test]
    fn test_offloaded_matches_resident_and_is_deterministic() {
        let mid = 4;
        let feats = spatial(5, mid);
        let flows = FlowFields::new(
            constant_flows(&[0.25, -0.5, 0.75, 0.1]),
            Some(constant_flows(&[-0.25, 0.5, -0.75, -0.1])),
        )
        .unwrap();
        let engine = engine(mid);
        let cpu = ComputeDevice::Cpu;
        let a = engine
            .propagate_all(&feats, &flows, &StorageTier::resident(), &cpu)
            .unwrap();
        let b = engine
            .propagate_all(&feats, &flows, &StorageTier::resident(), &cpu)
            .unwrap();
        let tier = StorageTier::offloaded();
        let c = engine.propagate_all(&feats, &flows, &tier, &cpu).unwrap();
        assert!(tier.transfers() > 0);
        for branch in Branch::ORDER {
            for t in 0..5 {
                let reference = a.get(branch, t).unwrap();
                assert_eq!(reference, b.get(branch, t).unwrap());
                let offloaded = c.get(branch, t).unwrap();
                let diff = (reference - offloaded)
                    .mapv(f32::abs)
                    .fold(0.0f32, |m, v| m.max(*v));
                assert!(diff < 1e-5, "{} frame {} differs by {}", branch, t, diff);
            }
        }
    }

    #[test]
    fn test_single_frame_runs_seed_step_only() {
        let mid = 4;
        let flows = FlowFields::new(Vec::new(), None).unwrap();
        let arena = engine(mid)
            .propagate_all(&spatial(1, mid), &flows, &StorageTier::resident(), &ComputeDevice::Cpu)
            .unwrap();
        assert!(arena.is_complete(Branch::FORWARD_2));
    }

    #[test]
    fn test_flow_count_mismatch_rejected() {
        let mid = 4;
        let flows = FlowFields::new(constant_flows(&[1.0]), None).unwrap();
        assert!(engine(mid)
            .propagate_all(&spatial(3, mid), &flows, &StorageTier::resident(), &ComputeDevice::Cpu)
            .is_err());
    }
}
