// SPDX-License-Identifier: GPL-3.0-only

//! Compute device and storage tier
//!
//! The storage tier is chosen once per stage call. When it offloads, every
//! stage-level intermediate (flow fields, spatial features, branch outputs)
//! is held in host storage and staged in only for the operation using it, and
//! the components switch from batched to per-frame execution.

use crate::config::DevicePreference;
use crate::errors::{DepthError, DepthResult};
use crate::shaders::FlowWarpProcessor;
use crate::tensor::{Padding, Tensor4, flow_warp};
use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, trace, warn};

/// GPU state shared by clones of a [`ComputeDevice`]
pub struct Accelerator {
    warp: Mutex<FlowWarpProcessor>,
    name: String,
}

/// Where the compute kernels run
#[derive(Clone, Default)]
pub enum ComputeDevice {
    #[default]
    Cpu,
    /// wgpu device running the flow-warp kernel
    Accelerator(Arc<Accelerator>),
}

impl std::fmt::Debug for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => f.write_str("Cpu"),
            Self::Accelerator(acc) => write!(f, "Accelerator({})", acc.name),
        }
    }
}

impl ComputeDevice {
    /// Open a GPU device
    pub fn accelerator() -> DepthResult<Self> {
        let processor = pollster::block_on(FlowWarpProcessor::new())?;
        let name = processor.adapter_name().to_string();
        info!(adapter = %name, "Using GPU accelerator for flow warping");
        Ok(Self::Accelerator(Arc::new(Accelerator {
            warp: Mutex::new(processor),
            name,
        })))
    }

    /// Resolve a configured preference
    pub fn from_preference(preference: DevicePreference) -> DepthResult<Self> {
        match preference {
            DevicePreference::Cpu => Ok(Self::Cpu),
            DevicePreference::Gpu => Self::accelerator(),
            DevicePreference::Auto => match Self::accelerator() {
                Ok(device) => Ok(device),
                Err(e) => {
                    warn!(error = %e, "No usable GPU, falling back to CPU");
                    Ok(Self::Cpu)
                }
            },
        }
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Self::Accelerator(_))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Cpu => "cpu",
            Self::Accelerator(acc) => &acc.name,
        }
    }

    /// Backward warp of `input` by `flow`
    ///
    /// GPU failures fall back to the CPU kernel.
    pub fn warp(&self, input: &Tensor4, flow: &Tensor4, padding: Padding) -> DepthResult<Tensor4> {
        let Self::Accelerator(acc) = self else {
            return flow_warp(input, flow, padding);
        };
        let result = match acc.warp.lock() {
            Ok(mut processor) => pollster::block_on(processor.warp(input, flow, padding)),
            Err(_) => Err(DepthError::Gpu("flow-warp processor lock poisoned".into())),
        };
        match result {
            Ok(output) => Ok(output),
            Err(DepthError::Shape(e)) => Err(DepthError::Shape(e)),
            Err(e) => {
                warn!(error = %e, "GPU warp failed, using CPU");
                flow_warp(input, flow, padding)
            }
        }
    }
}

/// Offload decision override
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OffloadPolicy {
    /// Offload when the sequence exceeds the cache length on an accelerator
    #[default]
    Auto,
    Always,
    Never,
}

/// Residency handle selected once per stage call
#[derive(Debug)]
pub struct StorageTier {
    offload: bool,
    transfers: AtomicUsize,
}

impl StorageTier {
    /// Everything stays compute-resident; components run batched
    pub fn resident() -> Self {
        Self {
            offload: false,
            transfers: AtomicUsize::new(0),
        }
    }

    /// Intermediates live in host storage; components run per frame
    pub fn offloaded() -> Self {
        Self {
            offload: true,
            transfers: AtomicUsize::new(0),
        }
    }

    /// Offload iff the sequence is longer than `cache_length` on an accelerator
    pub fn select(
        frames: usize,
        cache_length: usize,
        device: &ComputeDevice,
        policy: OffloadPolicy,
    ) -> Self {
        let offload = match policy {
            OffloadPolicy::Always => true,
            OffloadPolicy::Never => false,
            OffloadPolicy::Auto => frames > cache_length && device.is_accelerator(),
        };
        if offload {
            Self::offloaded()
        } else {
            Self::resident()
        }
    }

    pub fn is_offloaded(&self) -> bool {
        self.offload
    }

    /// Bring a stored tensor to the compute side for one operation
    pub fn stage_in<'a>(&self, tensor: &'a Tensor4) -> Cow<'a, Tensor4> {
        if !self.offload {
            return Cow::Borrowed(tensor);
        }
        self.transfers.fetch_add(1, Ordering::Relaxed);
        trace!(shape = ?tensor.shape(), "stage in");
        Cow::Owned(tensor.as_standard_layout().into_owned())
    }

    /// Move a computed tensor into storage
    pub fn stage_out(&self, tensor: Tensor4) -> Tensor4 {
        if !self.offload {
            return tensor;
        }
        self.transfers.fetch_add(1, Ordering::Relaxed);
        trace!(shape = ?tensor.shape(), "stage out");
        if tensor.is_standard_layout() {
            tensor
        } else {
            tensor.as_standard_layout().into_owned()
        }
    }

    /// Hint that compute-side temporaries of the last step can be released
    pub fn reclaim(&self) {
        if self.offload {
            trace!("reclaim compute-side temporaries");
        }
    }

    /// Staging transfers performed so far
    pub fn transfers(&self) -> usize {
        self.transfers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_never_offloads_automatically() {
        let tier = StorageTier::select(1000, 200, &ComputeDevice::Cpu, OffloadPolicy::Auto);
        assert!(!tier.is_offloaded());
    }

    #[test]
    fn test_policy_overrides() {
        let cpu = ComputeDevice::Cpu;
        assert!(StorageTier::select(1, 200, &cpu, OffloadPolicy::Always).is_offloaded());
        assert!(!StorageTier::select(1000, 1, &cpu, OffloadPolicy::Never).is_offloaded());
    }

    #[test]
    fn test_staging_counts_transfers_only_when_offloaded() {
        let tensor = Tensor4::ones((1, 2, 3, 3));
        let resident = StorageTier::resident();
        assert!(matches!(resident.stage_in(&tensor), Cow::Borrowed(_)));
        let _ = resident.stage_out(tensor.clone());
        assert_eq!(resident.transfers(), 0);

        let offloaded = StorageTier::offloaded();
        let staged = offloaded.stage_in(&tensor);
        assert_eq!(*staged, tensor);
        let _ = offloaded.stage_out(tensor.clone());
        assert_eq!(offloaded.transfers(), 2);
    }

    #[test]
    fn test_cpu_device_warp() {
        let device = ComputeDevice::Cpu;
        let input = Tensor4::ones((1, 1, 2, 2));
        let flow = Tensor4::zeros((1, 2, 2, 2));
        assert_eq!(device.warp(&input, &flow, Padding::Zeros).unwrap(), input);
        assert_eq!(device.name(), "cpu");
    }
}
