// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the depth reconstruction pipeline

use std::fmt;

/// Result type alias using DepthError
pub type DepthResult<T> = Result<T, DepthError>;

/// Main error type
#[derive(Debug, Clone, PartialEq)]
pub enum DepthError {
    /// Invalid configuration (fatal, reported at construction)
    Config(String),
    /// Tensor shape contract violation
    Shape(ShapeError),
    /// Checkpoint loading errors
    Weights(WeightsError),
    /// GPU device or kernel errors
    Gpu(String),
    /// Filesystem errors
    Io(String),
    /// Generic error with message
    Other(String),
}

/// Shape contract violations between pipeline components
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeError {
    /// Which operation detected the mismatch
    pub context: &'static str,
    /// Expected shape description
    pub expected: String,
    /// Actual shape that was received
    pub actual: Vec<usize>,
}

/// Checkpoint-specific errors
#[derive(Debug, Clone, PartialEq)]
pub enum WeightsError {
    /// The checkpoint file could not be parsed
    InvalidFile(String),
    /// A parameter required by the model is missing
    MissingTensor(String),
    /// Parameters in the checkpoint that the model does not use (strict mode)
    UnexpectedTensors(Vec<String>),
    /// Stored shape differs from the parameter shape
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// Only f32 tensors are supported
    UnsupportedDtype { name: String, dtype: String },
}

impl ShapeError {
    pub fn new(context: &'static str, expected: impl Into<String>, actual: &[usize]) -> Self {
        Self {
            context,
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }
}

impl DepthError {
    /// Shorthand for a shape error
    pub fn shape(context: &'static str, expected: impl Into<String>, actual: &[usize]) -> Self {
        DepthError::Shape(ShapeError::new(context, expected, actual))
    }
}

impl fmt::Display for DepthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepthError::Config(msg) => write!(f, "Configuration error: {}", msg),
            DepthError::Shape(e) => write!(f, "Shape error: {}", e),
            DepthError::Weights(e) => write!(f, "Weights error: {}", e),
            DepthError::Gpu(msg) => write!(f, "GPU error: {}", msg),
            DepthError::Io(msg) => write!(f, "I/O error: {}", msg),
            DepthError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, got {:?}",
            self.context, self.expected, self.actual
        )
    }
}

impl fmt::Display for WeightsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightsError::InvalidFile(msg) => write!(f, "Invalid checkpoint: {}", msg),
            WeightsError::MissingTensor(name) => write!(f, "Missing tensor `{}`", name),
            WeightsError::UnexpectedTensors(names) => {
                write!(f, "Unexpected tensors in checkpoint: {}", names.join(", "))
            }
            WeightsError::ShapeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "Tensor `{}` has shape {:?}, expected {:?}",
                name, actual, expected
            ),
            WeightsError::UnsupportedDtype { name, dtype } => {
                write!(f, "Tensor `{}` has unsupported dtype {}", name, dtype)
            }
        }
    }
}

impl std::error::Error for DepthError {}
impl std::error::Error for ShapeError {}
impl std::error::Error for WeightsError {}

impl From<ShapeError> for DepthError {
    fn from(err: ShapeError) -> Self {
        DepthError::Shape(err)
    }
}

impl From<WeightsError> for DepthError {
    fn from(err: WeightsError) -> Self {
        DepthError::Weights(err)
    }
}

impl From<String> for DepthError {
    fn from(msg: String) -> Self {
        DepthError::Other(msg)
    }
}

impl From<&str> for DepthError {
    fn from(msg: &str) -> Self {
        DepthError::Other(msg.to_string())
    }
}

impl From<std::io::Error> for DepthError {
    fn from(err: std::io::Error) -> Self {
        DepthError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DepthError {
    fn from(err: serde_json::Error) -> Self {
        DepthError::Config(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for DepthError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        DepthError::Weights(WeightsError::InvalidFile(err.to_string()))
    }
}

impl From<ndarray::ShapeError> for DepthError {
    fn from(err: ndarray::ShapeError) -> Self {
        DepthError::Other(format!("Array layout error: {}", err))
    }
}
