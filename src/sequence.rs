// SPDX-License-Identifier: GPL-3.0-only

//! Sequence tensor files and depth map export
//!
//! Sequences are exchanged as safetensors files of little-endian f32
//! `N×T×C×H×W` tensors. Depth frames can additionally be written as 16-bit
//! grayscale PNGs.

use crate::errors::{DepthError, DepthResult, WeightsError};
use crate::tensor::Tensor5;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Named sequence tensors read from one file
pub struct SequenceFile {
    tensors: BTreeMap<String, Tensor5>,
}

impl SequenceFile {
    /// Parse every 5-D f32 tensor of a safetensors buffer
    pub fn from_bytes(bytes: &[u8]) -> DepthResult<Self> {
        let file = SafeTensors::deserialize(bytes)?;
        let mut tensors = BTreeMap::new();
        for (name, view) in file.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(WeightsError::UnsupportedDtype {
                    name,
                    dtype: format!("{:?}", view.dtype()),
                }
                .into());
            }
            let shape = view.shape();
            let [n, t, c, h, w] = shape else {
                return Err(DepthError::shape(
                    "SequenceFile",
                    format!("5-D tensor `{}`", name),
                    shape,
                ));
            };
            let data = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            tensors.insert(name, Tensor5::from_shape_vec((*n, *t, *c, *h, *w), data)?);
        }
        Ok(Self { tensors })
    }

    pub fn open(path: &Path) -> DepthResult<Self> {
        let bytes = std::fs::read(path)?;
        let file = Self::from_bytes(&bytes)?;
        debug!(path = %path.display(), tensors = file.tensors.len(), "Read sequence file");
        Ok(file)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor5> {
        self.tensors.get(name)
    }

    /// Remove and return a tensor, failing when it is absent
    pub fn take(&mut self, name: &str) -> DepthResult<Tensor5> {
        self.tensors
            .remove(name)
            .ok_or_else(|| WeightsError::MissingTensor(name.to_string()).into())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}

/// Serialize named sequences as a safetensors buffer
pub fn sequence_bytes(tensors: &[(&str, &Tensor5)]) -> DepthResult<Vec<u8>> {
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, tensor)| {
            // iter() walks logical order, which is the row-major file layout
            let data: Vec<f32> = tensor.iter().copied().collect();
            (
                name.to_string(),
                tensor.shape().to_vec(),
                bytemuck::cast_slice::<f32, u8>(&data).to_vec(),
            )
        })
        .collect();
    let views = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes).map(|view| (name.clone(), view))
        })
        .collect::<Result<Vec<_>, _>>()?;
    safetensors::tensor::serialize(views, &None).map_err(DepthError::from)
}

pub fn write_sequence_file(path: &Path, tensors: &[(&str, &Tensor5)]) -> DepthResult<()> {
    let bytes = sequence_bytes(tensors)?;
    std::fs::write(path, bytes)?;
    info!(path = %path.display(), tensors = tensors.len(), "Wrote sequence file");
    Ok(())
}

/// Quantize a normalised depth value to 16 bits
pub fn depth_to_u16(value: f32) -> u16 {
    if !value.is_finite() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * u16::MAX as f32).round() as u16
}

/// Write each `N×T×1×H×W` depth frame as `depth_{n}_{t:04}.png`
///
/// Values are clamped to `[0, 1]` before quantization.
pub fn write_depth_pngs(dir: &Path, depth: &Tensor5) -> DepthResult<Vec<PathBuf>> {
    let (n, t, c, h, w) = depth.dim();
    if c != 1 {
        return Err(DepthError::shape("write_depth_pngs", "single-channel depth", depth.shape()));
    }
    std::fs::create_dir_all(dir)?;

    let mut written = Vec::with_capacity(n * t);
    for b in 0..n {
        for f in 0..t {
            let pixels: Vec<u16> = depth
                .slice(ndarray::s![b, f, 0, .., ..])
                .iter()
                .map(|&v| depth_to_u16(v))
                .collect();
            let img = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_raw(
                w as u32, h as u32, pixels,
            )
            .ok_or_else(|| DepthError::Other("Failed to create depth image buffer".into()))?;
            let path = dir.join(format!("depth_{}_{:04}.png", b, f));
            img.save(&path)
                .map_err(|e| DepthError::Io(format!("{}: {}", path.display(), e)))?;
            written.push(path);
        }
    }
    debug!(frames = written.len(), dir = %dir.display(), "Wrote depth PNGs");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_bytes_preserve_layout() {
        let seq = Tensor5::from_shape_fn((1, 2, 1, 2, 3), |(_, t, _, y, x)| {
            (t * 100 + y * 10 + x) as f32
        });
        let bytes = sequence_bytes(&[("depth", &seq)]).unwrap();
        let file = SequenceFile::from_bytes(&bytes).unwrap();
        assert_eq!(file.get("depth"), Some(&seq));
        assert_eq!(file.names().collect::<Vec<_>>(), vec!["depth"]);
    }

    #[test]
    fn test_transposed_view_written_in_logical_order() {
        let base = Tensor5::from_shape_fn((1, 1, 1, 2, 3), |(_, _, _, y, x)| (y * 3 + x) as f32);
        let transposed = base.clone().permuted_axes([0, 1, 2, 4, 3]);
        let bytes = sequence_bytes(&[("t", &transposed)]).unwrap();
        let file = SequenceFile::from_bytes(&bytes).unwrap();
        let read = file.get("t").unwrap();
        assert_eq!(read.dim(), (1, 1, 1, 3, 2));
        assert_eq!(read[[0, 0, 0, 2, 1]], 5.0);
    }

    #[test]
    fn test_non_sequence_tensor_rejected() {
        let data = [0u8; 16];
        let view = TensorView::new(Dtype::F32, vec![2, 2], &data).unwrap();
        let bytes = safetensors::tensor::serialize(vec![("x".to_string(), view)], &None).unwrap();
        assert!(SequenceFile::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_missing_tensor() {
        let mut file = SequenceFile::from_bytes(&sequence_bytes(&[]).unwrap()).unwrap();
        assert!(matches!(
            file.take("guides"),
            Err(DepthError::Weights(WeightsError::MissingTensor(_)))
        ));
    }

    #[test]
    fn test_depth_quantization() {
        assert_eq!(depth_to_u16(0.0), 0);
        assert_eq!(depth_to_u16(1.0), u16::MAX);
        assert_eq!(depth_to_u16(2.5), u16::MAX);
        assert_eq!(depth_to_u16(-1.0), 0);
        assert_eq!(depth_to_u16(f32::NAN), 0);
        assert_eq!(depth_to_u16(0.5), 32768);
    }
}
