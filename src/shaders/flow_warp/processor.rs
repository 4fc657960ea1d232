// SPDX-License-Identifier: GPL-3.0-only

//! GPU flow-warp processor
//!
//! Uploads an `N×C×H×W` tensor and its `N×2×H×W` flow as flat storage
//! buffers, dispatches one invocation per output pixel and reads the warped
//! planes back.

use super::FLOW_WARP_SHADER;
use crate::errors::{DepthError, DepthResult};
use crate::gpu::{self, wgpu};
use crate::shaders::{CachedDimensions, compute_dispatch_size, read_buffer_async};
use crate::tensor::{Padding, Tensor4};
use std::sync::Arc;
use tracing::{debug, info};

const WORKGROUP_SIZE: u32 = 16;

/// Warp parameters
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct WarpParams {
    width: u32,
    height: u32,
    channels: u32,
    border: u32,
}

/// GPU flow-warp kernel with cached buffers
pub struct FlowWarpProcessor {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    max_storage_binding: u64,
    adapter_name: String,
    // Cached resources for current dimensions
    cached_dims: CachedDimensions,
    input_buffer: Option<wgpu::Buffer>,
    flow_buffer: Option<wgpu::Buffer>,
    output_buffer: Option<wgpu::Buffer>,
    staging_buffer: Option<wgpu::Buffer>,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl FlowWarpProcessor {
    /// Create a processor on a fresh compute device
    pub async fn new() -> DepthResult<Self> {
        info!("Initializing GPU flow-warp processor");

        let (device, queue, gpu_info) = gpu::create_compute_device("flow_warp_gpu").await?;

        info!(
            adapter_name = %gpu_info.adapter_name,
            adapter_backend = ?gpu_info.backend,
            "GPU device created for flow warp"
        );

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("flow_warp_shader"),
            source: wgpu::ShaderSource::Wgsl(FLOW_WARP_SHADER.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("flow_warp_bind_group_layout"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("flow_warp_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("flow_warp_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("flow_warp_uniform_buffer"),
            size: std::mem::size_of::<WarpParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            uniform_buffer,
            max_storage_binding: gpu_info.max_storage_binding,
            adapter_name: gpu_info.adapter_name,
            cached_dims: CachedDimensions::default(),
            input_buffer: None,
            flow_buffer: None,
            output_buffer: None,
            staging_buffer: None,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Ensure buffers are allocated for the given dimensions
    fn ensure_resources(&mut self, dims: CachedDimensions) {
        if !self.cached_dims.needs_update(&dims) {
            return;
        }

        debug!(
            batch = dims.batch,
            channels = dims.channels,
            height = dims.height,
            width = dims.width,
            "Allocating flow-warp buffers"
        );

        let tensor_bytes = dims.elements() * 4;
        let flow_bytes = u64::from(dims.batch) * 2 * dims.plane() * 4;
        let storage = |label: &'static str, size: u64, usage: wgpu::BufferUsages| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        };

        let input = storage(
            "flow_warp_input",
            tensor_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        );
        let flow = storage(
            "flow_warp_flow",
            flow_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        );
        let output = storage(
            "flow_warp_output",
            tensor_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        );
        let staging = storage(
            "flow_warp_staging",
            tensor_bytes,
            wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        );

        self.input_buffer = Some(input);
        self.flow_buffer = Some(flow);
        self.output_buffer = Some(output);
        self.staging_buffer = Some(staging);
        self.cached_dims = dims;
    }

    /// Warp `input` by `flow`
    pub async fn warp(
        &mut self,
        input: &Tensor4,
        flow: &Tensor4,
        padding: Padding,
    ) -> DepthResult<Tensor4> {
        let (n, c, h, w) = input.dim();
        if flow.dim() != (n, 2, h, w) {
            return Err(DepthError::shape(
                "FlowWarpProcessor",
                format!("flow of {}×2×{}×{}", n, h, w),
                flow.shape(),
            ));
        }
        let to_u32 = |v: usize| {
            u32::try_from(v).map_err(|_| DepthError::Gpu(format!("dimension {} too large", v)))
        };
        let dims = CachedDimensions::new(to_u32(n)?, to_u32(c)?, to_u32(h)?, to_u32(w)?);
        if !dims.is_initialized() {
            return Ok(input.clone());
        }
        if dims.elements() * 4 > self.max_storage_binding {
            return Err(DepthError::Gpu(format!(
                "{} bytes exceed the storage binding limit of {}",
                dims.elements() * 4,
                self.max_storage_binding
            )));
        }

        self.ensure_resources(dims);
        let input_buffer = self.input_buffer.as_ref().ok_or("No input buffer")?;
        let flow_buffer = self.flow_buffer.as_ref().ok_or("No flow buffer")?;
        let output_buffer = self.output_buffer.as_ref().ok_or("No output buffer")?;
        let staging_buffer = self.staging_buffer.as_ref().ok_or("No staging buffer")?;

        let input_data = input.as_standard_layout();
        let flow_data = flow.as_standard_layout();
        let input_slice = input_data
            .as_slice()
            .ok_or("flow warp input is not contiguous")?;
        let flow_slice = flow_data.as_slice().ok_or("flow is not contiguous")?;
        self.queue
            .write_buffer(input_buffer, 0, bytemuck::cast_slice(input_slice));
        self.queue
            .write_buffer(flow_buffer, 0, bytemuck::cast_slice(flow_slice));

        let params = WarpParams {
            width: dims.width,
            height: dims.height,
            channels: dims.channels,
            border: u32::from(padding == Padding::Border),
        };
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&params));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("flow_warp_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: input_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: flow_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: output_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("flow_warp_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("flow_warp_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                compute_dispatch_size(dims.width, WORKGROUP_SIZE),
                compute_dispatch_size(dims.height, WORKGROUP_SIZE),
                dims.batch,
            );
        }
        encoder.copy_buffer_to_buffer(output_buffer, 0, staging_buffer, 0, dims.elements() * 4);
        self.queue.submit(std::iter::once(encoder.finish()));

        let bytes = read_buffer_async(&self.device, staging_buffer).await?;
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        Ok(Tensor4::from_shape_vec((n, c, h, w), values)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::flow_warp;

    #[test]
    fn test_gpu_warp_matches_cpu() {
        // Requires a GPU adapter; skipped otherwise
        let mut processor = match pollster::block_on(FlowWarpProcessor::new()) {
            Ok(processor) => processor,
            Err(e) => {
                println!("Skipping test (no GPU): {}", e);
                return;
            }
        };
        let input = Tensor4::from_shape_fn((2, 3, 9, 7), |(b, c, y, x)| {
            (b * 50 + c * 10 + y * 7 + x) as f32 / 100.0
        });
        let flow = Tensor4::from_shape_fn((2, 2, 9, 7), |(b, c, y, x)| {
            ((b + c + y * x) % 5) as f32 * 0.37 - 0.8
        });
        for padding in [Padding::Zeros, Padding::Border] {
            let gpu = pollster::block_on(processor.warp(&input, &flow, padding)).unwrap();
            let cpu = flow_warp(&input, &flow, padding).unwrap();
            for (a, b) in gpu.iter().zip(cpu.iter()) {
                assert!((a - b).abs() < 1e-4);
            }
        }
    }
}
