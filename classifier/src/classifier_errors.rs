use rbm::ConfigError;
use thiserror::Error;

pub type ClassifierResult<T> = Result<T, ClassifierError>;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("SMO solver did not converge within {iterations} iterations")]
    ConvergenceFailure { iterations: usize },
    #[error("Training data is degenerate: {0}")]
    DegenerateInput(String),
    #[error("Classifier has not been trained yet")]
    NotTrained,
    #[error("Classifier file does not start with the expected magic bytes")]
    ClassifierMagicError,
    #[error("Classifier file has format version {found}, only version {supported} is supported")]
    ClassifierVersionError { found: u32, supported: u32 },
    #[error("Classifier file holds an inconsistent model: {0}")]
    ClassifierModelError(String),
    #[error("Classifier expects {expected} features, got {found}")]
    FeatureLengthError { expected: usize, found: usize },
    #[error("Invalid classifier configuration:\n {0}.")]
    ClassifierConfigError(#[from] ConfigError),
    #[error("Classifier file not accessible. Filesystem reported error\n {0}.")]
    ClassifierIoError(#[from] std::io::Error),
    #[error("Classifier file could not be encoded or decoded:\n {0}.")]
    ClassifierEncodingError(#[from] bincode::Error),
}
