//! Training a classifier on the features of a pretrained stack. The stack itself is only read.
use ndarray::ArrayView4;
use rbm::ConvDbn;

use crate::{
    classifier_errors::ClassifierResult,
    grid_search::{GridSearchResult, RbfGrid},
    svm::{Svm, SvmParameters},
    Label,
};

pub trait SvmStack {
    /// Trains `svm` on the features of `images`.
    fn svm_train(
        &self,
        svm: &mut Svm,
        images: ArrayView4<f64>,
        labels: &[Label],
        parameters: &SvmParameters,
    ) -> ClassifierResult<()>;

    /// Grid search on the features of `images`, `svm` keeps the refit at the best point.
    fn svm_grid_search(
        &self,
        svm: &mut Svm,
        images: ArrayView4<f64>,
        labels: &[Label],
        folds: usize,
        grid: &RbfGrid,
    ) -> ClassifierResult<GridSearchResult>;
}

impl SvmStack for ConvDbn {
    fn svm_train(
        &self,
        svm: &mut Svm,
        images: ArrayView4<f64>,
        labels: &[Label],
        parameters: &SvmParameters,
    ) -> ClassifierResult<()> {
        let features = self.features_batch(images);
        svm.train(features.view(), labels, parameters)
    }

    fn svm_grid_search(
        &self,
        svm: &mut Svm,
        images: ArrayView4<f64>,
        labels: &[Label],
        folds: usize,
        grid: &RbfGrid,
    ) -> ClassifierResult<GridSearchResult> {
        let features = self.features_batch(images);
        svm.grid_search(features.view(), labels, folds, grid)
    }
}
