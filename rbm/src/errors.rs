use thiserror::Error;

use crate::config::OutputMode;

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ModelResult<T> = Result<T, ModelError>;

/// Raised while building layers or stacks. Nothing has been trained when one of these
/// is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Visible size {visible} and kernel {kernel} give hidden size {expected}, not {hidden}")]
    KernelShapeError {
        visible: usize,
        kernel: usize,
        hidden: usize,
        expected: usize,
    },
    #[error("Hidden size {hidden} is not divisible by the pooling ratio {ratio}")]
    PoolingShapeError { hidden: usize, ratio: usize },
    #[error("Dimension {name} must be positive")]
    EmptyDimensionError { name: &'static str },
    #[error("Hyperparameter {name} must be {requirement}, got {value}")]
    HyperParameterError {
        name: &'static str,
        requirement: &'static str,
        value: f64,
    },
    #[error(
        "Layer {layer} expects {expected_channels}x{expected_size}x{expected_size} inputs, \
         the previous layer produces {channels}x{size}x{size}"
    )]
    StackShapeError {
        layer: usize,
        expected_channels: usize,
        expected_size: usize,
        channels: usize,
        size: usize,
    },
    #[error("A stack needs at least one layer")]
    EmptyStackError,
    #[error("Grid axis {axis} is malformed: {reason}")]
    GridError {
        axis: &'static str,
        reason: &'static str,
    },
    #[error("Cannot split {examples} examples into {folds} folds")]
    FoldCountError { folds: usize, examples: usize },
}

/// Raised when a stored model can't be read back into a stack.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model file does not start with the expected magic bytes")]
    ModelMagicError,
    #[error("Model file has format version {found}, only version {supported} is supported")]
    ModelVersionError { found: u32, supported: u32 },
    #[error("Model file holds {found} layers, the stack has {expected}")]
    LayerCountError { expected: usize, found: usize },
    #[error("Layer {layer} in the model file has a different shape than the configured layer")]
    LayerShapeError { layer: usize },
    #[error("Model file stores {found:?} features, the stack is configured for {expected:?}")]
    OutputModeError {
        expected: OutputMode,
        found: OutputMode,
    },
    #[error("Layer {layer}: buffer {buffer} holds {found} values, expected {expected}")]
    BufferLengthError {
        layer: usize,
        buffer: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Model file not accessible. Filesystem reported error\n {0}.")]
    ModelIoError(#[from] std::io::Error),
    #[error("Model file could not be decoded:\n {0}.")]
    ModelEncodingError(#[from] bincode::Error),
    #[error("Model file holds an invalid configuration:\n {0}.")]
    ModelConfigError(#[from] ConfigError),
    #[error("Wrong shape for stored parameters:\n {0}.")]
    ModelShapeError(#[from] ndarray::ShapeError),
}
