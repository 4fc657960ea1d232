// SPDX-License-Identifier: GPL-3.0-only

//! Shared GPU processor infrastructure
//!
//! - Buffer allocation with dimension caching
//! - Async buffer readback
//! - Workgroup dispatch sizing

use crate::errors::{DepthError, DepthResult};
use crate::gpu::wgpu;

/// Cached tensor dimensions - avoids reallocation when dimensions match
///
/// Used by processors to track if buffers need to be recreated when the
/// `N×C×H×W` extent of their inputs changes.
#[derive(Default, Clone, Copy, PartialEq, Debug)]
pub struct CachedDimensions {
    pub batch: u32,
    pub channels: u32,
    pub height: u32,
    pub width: u32,
}

impl CachedDimensions {
    pub fn new(batch: u32, channels: u32, height: u32, width: u32) -> Self {
        Self {
            batch,
            channels,
            height,
            width,
        }
    }

    /// Check if dimensions have changed and need update
    pub fn needs_update(&self, other: &CachedDimensions) -> bool {
        self != other
    }

    /// Check if dimensions are initialized (non-zero)
    pub fn is_initialized(&self) -> bool {
        self.batch > 0 && self.channels > 0 && self.height > 0 && self.width > 0
    }

    /// Elements of one `N×C×H×W` tensor
    pub fn elements(&self) -> u64 {
        u64::from(self.batch) * u64::from(self.channels) * self.plane()
    }

    /// Pixels of one plane
    pub fn plane(&self) -> u64 {
        u64::from(self.height) * u64::from(self.width)
    }
}

/// Helper for async buffer readback (map, poll, read, unmap)
///
/// # Arguments
/// * `device` - The wgpu device for polling
/// * `buffer` - The buffer to read from (must be MAP_READ)
pub async fn read_buffer_async(
    device: &wgpu::Device,
    buffer: &wgpu::Buffer,
) -> DepthResult<Vec<u8>> {
    let slice = buffer.slice(..);
    let (sender, receiver) = futures::channel::oneshot::channel();

    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });

    let _ = device.poll(wgpu::PollType::wait_indefinitely());

    receiver
        .await
        .map_err(|_| DepthError::Gpu("Failed to receive buffer mapping".to_string()))?
        .map_err(|e| DepthError::Gpu(format!("Failed to map buffer: {:?}", e)))?;

    let data = slice.get_mapped_range().to_vec();
    buffer.unmap();

    Ok(data)
}

/// Number of workgroups needed to cover `dimension`
#[inline]
pub fn compute_dispatch_size(dimension: u32, workgroup_size: u32) -> u32 {
    dimension.div_ceil(workgroup_size)
}
