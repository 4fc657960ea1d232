// SPDX-License-Identifier: GPL-3.0-only

//! Stage, direction and branch identifiers, and the per-stage branch arena

use crate::errors::{DepthError, DepthResult};
use crate::tensor::Tensor4;

/// Hierarchical stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Guidance-only prediction
    Initial,
    /// Refinement from the stage-1 side channel
    Refine,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Initial, Stage::Refine];

    pub fn index(self) -> usize {
        match self {
            Self::Initial => 0,
            Self::Refine => 1,
        }
    }

    /// Key used in checkpoint tensor names
    pub fn checkpoint_key(self) -> &'static str {
        match self {
            Self::Initial => "hg_1",
            Self::Refine => "hg_2",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Reverse time: frame T-1 down to 0
    Backward,
    /// Forward time: frame 0 up to T-1
    Forward,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Iteration {
    First,
    Second,
}

/// One directional propagation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Branch {
    pub direction: Direction,
    pub iteration: Iteration,
}

impl Branch {
    pub const BACKWARD_1: Branch = Branch::new(Direction::Backward, Iteration::First);
    pub const FORWARD_1: Branch = Branch::new(Direction::Forward, Iteration::First);
    pub const BACKWARD_2: Branch = Branch::new(Direction::Backward, Iteration::Second);
    pub const FORWARD_2: Branch = Branch::new(Direction::Forward, Iteration::Second);

    /// Processing order; later branches read the outputs of earlier ones
    pub const ORDER: [Branch; 4] = [
        Self::BACKWARD_1,
        Self::FORWARD_1,
        Self::BACKWARD_2,
        Self::FORWARD_2,
    ];

    pub const fn new(direction: Direction, iteration: Iteration) -> Self {
        Self {
            direction,
            iteration,
        }
    }

    /// Position in [`Branch::ORDER`]
    pub fn index(self) -> usize {
        let iteration = match self.iteration {
            Iteration::First => 0,
            Iteration::Second => 2,
        };
        let direction = match self.direction {
            Direction::Backward => 0,
            Direction::Forward => 1,
        };
        iteration + direction
    }

    /// Branches completed before this one
    pub fn earlier(self) -> &'static [Branch] {
        &Self::ORDER[..self.index()]
    }

    pub fn name(self) -> &'static str {
        match (self.direction, self.iteration) {
            (Direction::Backward, Iteration::First) => "backward_1",
            (Direction::Forward, Iteration::First) => "forward_1",
            (Direction::Backward, Iteration::Second) => "backward_2",
            (Direction::Forward, Iteration::Second) => "forward_2",
        }
    }

    /// Frame visited at traversal step `step` of a `frames`-long sequence
    pub fn frame_at_step(self, step: usize, frames: usize) -> usize {
        match self.direction {
            Direction::Forward => step,
            Direction::Backward => frames - 1 - step,
        }
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Pre-sized `(branch, frame)` feature storage of one stage
///
/// Every slot is written exactly once. Writes are addressed by true frame
/// index, so backward branches end up in frame order without a reversal step.
pub struct BranchArena {
    frames: usize,
    slots: [Vec<Option<Tensor4>>; 4],
}

impl BranchArena {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            slots: std::array::from_fn(|_| vec![None; frames]),
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Store the output of `branch` at `frame`
    pub fn write(&mut self, branch: Branch, frame: usize, feature: Tensor4) -> DepthResult<()> {
        let frames = self.frames;
        let slot = self.slots[branch.index()]
            .get_mut(frame)
            .ok_or_else(|| {
                DepthError::Other(format!(
                    "{} frame {} outside a {}-frame sequence",
                    branch, frame, frames
                ))
            })?;
        if slot.is_some() {
            return Err(DepthError::Other(format!(
                "{} frame {} written twice",
                branch, frame
            )));
        }
        *slot = Some(feature);
        Ok(())
    }

    /// Output of `branch` at `frame`
    pub fn get(&self, branch: Branch, frame: usize) -> DepthResult<&Tensor4> {
        self.slots[branch.index()]
            .get(frame)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                DepthError::Other(format!("{} frame {} read before it was written", branch, frame))
            })
    }

    /// Whether every frame of `branch` has been written
    pub fn is_complete(&self, branch: Branch) -> bool {
        self.slots[branch.index()].iter().all(Option::is_some)
    }
}
