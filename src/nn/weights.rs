// SPDX-License-Identifier: GPL-3.0-only

//! Parameter initialisation and safetensors checkpoints

use super::{ParamVisitor, Parameterized};
use crate::errors::{DepthError, DepthResult, WeightsError};
use ndarray::{Array1, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Seeded parameter initialiser
///
/// Convolutions use PyTorch's default uniform bound `1/sqrt(fan_in)`.
pub struct Initializer {
    rng: StdRng,
}

impl Initializer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Convolution weight and bias, scaled by `gain`
    pub fn conv(
        &mut self,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        gain: f32,
    ) -> (Array4<f32>, Array1<f32>) {
        let fan_in = (in_channels * kernel * kernel).max(1) as f32;
        let bound = 1.0 / fan_in.sqrt();
        let weight = Array4::from_shape_simple_fn((out_channels, in_channels, kernel, kernel), || {
            gain * self.rng.random_range(-bound..bound)
        });
        let bias = Array1::from_shape_simple_fn(out_channels, || {
            gain * self.rng.random_range(-bound..bound)
        });
        (weight, bias)
    }
}

/// Tensors of a checkpoint, consumed by name while loading
pub struct WeightStore {
    tensors: BTreeMap<String, (Vec<usize>, Vec<f32>)>,
    consumed: HashSet<String>,
    strict: bool,
}

fn view_to_vec(view: &TensorView<'_>) -> Vec<f32> {
    view.data()
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl WeightStore {
    /// Parse a safetensors buffer, stripping `key_prefix` from tensor names
    pub fn from_bytes(bytes: &[u8], key_prefix: Option<&str>, strict: bool) -> DepthResult<Self> {
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
            let key = match key_prefix {
                Some(prefix) => name.strip_prefix(prefix).unwrap_or(&name).to_string(),
                None => name.clone(),
            };
            tensors.insert(key, (view.shape().to_vec(), view_to_vec(&view)));
        }
        debug!(tensors = tensors.len(), "Parsed checkpoint");
        Ok(Self {
            tensors,
            consumed: HashSet::new(),
            strict,
        })
    }

    /// Read a safetensors checkpoint from disk
    pub fn from_file(path: &Path, key_prefix: Option<&str>, strict: bool) -> DepthResult<Self> {
        info!(path = %path.display(), strict, "Loading checkpoint");
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, key_prefix, strict)
    }

    /// Tensor names and shapes, sorted by name
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.tensors
            .iter()
            .map(|(name, (shape, _))| (name.as_str(), shape.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Copy the named tensor into `target`
    ///
    /// Returns `false` when the tensor is absent and loading is not strict.
    pub fn fill(&mut self, name: &str, shape: &[usize], target: &mut [f32]) -> DepthResult<bool> {
        let Some((stored_shape, data)) = self.tensors.get(name) else {
            if self.strict {
                return Err(WeightsError::MissingTensor(name.to_string()).into());
            }
            warn!(tensor = name, "Tensor missing from checkpoint, keeping initial value");
            return Ok(false);
        };
        if stored_shape.as_slice() != shape {
            return Err(WeightsError::ShapeMismatch {
                name: name.to_string(),
                expected: shape.to_vec(),
                actual: stored_shape.clone(),
            }
            .into());
        }
        target.copy_from_slice(data);
        self.consumed.insert(name.to_string());
        Ok(true)
    }

    /// Load every parameter of `module` under `prefix`
    pub fn load_into(&mut self, module: &mut dyn Parameterized, prefix: &str) -> DepthResult<()> {
        module.visit_params(prefix, &mut |name, shape, data| {
            self.fill(name, shape, data).map(|_| ())
        })
    }

    /// Report tensors that no parameter consumed
    pub fn finish(self) -> DepthResult<()> {
        let unused: Vec<String> = self
            .tensors
            .keys()
            .filter(|name| !self.consumed.contains(*name))
            .cloned()
            .collect();
        if unused.is_empty() {
            return Ok(());
        }
        if self.strict {
            return Err(WeightsError::UnexpectedTensors(unused).into());
        }
        warn!(count = unused.len(), "Ignoring unused checkpoint tensors");
        Ok(())
    }
}

/// Collect every parameter of `module` into a safetensors buffer
pub fn export_state_dict(module: &mut dyn Parameterized, prefix: &str) -> DepthResult<Vec<u8>> {
    let mut entries: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    let visitor: &mut ParamVisitor<'_> = &mut |name, shape, data| {
        entries.push((
            name.to_string(),
            shape.to_vec(),
            bytemuck::cast_slice::<f32, u8>(data).to_vec(),
        ));
        Ok(())
    };
    module.visit_params(prefix, visitor)?;

    let views = entries
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes).map(|view| (name.clone(), view))
        })
        .collect::<Result<Vec<_>, _>>()?;
    safetensors::tensor::serialize(views, &None).map_err(DepthError::from)
}
