// SPDX-License-Identifier: GPL-3.0-only

//! Hierarchical depth video super-resolution model
//!
//! - [`symmetry`]: mirror-extension detection
//! - [`flow`]: consecutive-frame flow fields
//! - [`features`]: per-frame spatial features
//! - [`propagation`]: the four directional propagation branches
//! - [`reconstruct`]: branch fusion and depth/confidence prediction
//! - [`histogram`]: histogram matching error and positional encoding
//! - [`stage`]: one full stage, run twice by [`hierarchical`]
//! - [`storage`]: compute device and offload tier

pub mod branch;
pub mod features;
pub mod flow;
pub mod hierarchical;
pub mod histogram;
pub mod propagation;
pub mod reconstruct;
pub mod stage;
pub mod storage;
pub mod symmetry;

pub use branch::{Branch, BranchArena, Direction, Iteration, Stage};
pub use flow::{DirectedFlows, FlowEstimator, FlowFields};
pub use hierarchical::{
    HierarchicalDepthModel, ModelOutput, Observation, SensorObservation, blend_confidence,
};
pub use histogram::{histogram_to_cdf, matching_error, positional_encoding, simulate_histogram};
pub use propagation::{PropagationEngine, compose_second_order};
pub use reconstruct::{FrameReconstructor, Reconstruction};
pub use stage::{DepthStage, StageInput, StageSpec};
pub use storage::{ComputeDevice, OffloadPolicy, StorageTier};
pub use symmetry::is_mirror_extended;
