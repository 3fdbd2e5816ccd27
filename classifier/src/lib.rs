//! Supervised stage on top of a pretrained convolutional DBN: a one-vs-one C-SVC trained with
//! SMO, a cross-validated grid search over its RBF parameters, and error rate evaluation.
use ndarray::ArrayView1;

pub mod classifier_errors;
pub mod evaluation;
pub mod grid_search;
pub mod kernel;
mod smo;
pub mod stage;
pub mod svm;

pub use classifier_errors::{ClassifierError, ClassifierResult};
pub use evaluation::{error_rate, test_all, ArgmaxPredictor, Report};
pub use grid_search::{GridPoint, GridSearchResult, GridSpacing, RbfGrid};
pub use kernel::Kernel;
pub use stage::SvmStack;
pub use svm::{Svm, SvmModel, SvmParameters};

pub type Label = usize;

/// Maps the feature vector of one image to a label.
pub trait Predictor: Sync {
    fn predict(&self, features: ArrayView1<f64>) -> Label;
}
