//! Multi-class C-SVC: one binary machine per pair of classes, majority vote at prediction time.
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use log::{debug, info};
use ndarray::*;
use rayon::prelude::*;
use rbm::ConfigError;
use serde_derive::{Deserialize, Serialize};

use crate::{
    classifier_errors::{ClassifierError, ClassifierResult},
    grid_search::{grid_search, GridSearchResult, RbfGrid},
    kernel::Kernel,
    smo, Label, Predictor,
};

pub const SVM_MAGIC: [u8; 4] = *b"CSVM";
pub const SVM_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SvmParameters {
    pub kernel: Kernel,
    /// Penalty of margin violations.
    pub c: f64,
    /// Stopping tolerance on the maximal KKT violation.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Number of kernel rows the solver keeps around.
    pub cache_rows: usize,
}

impl Default for SvmParameters {
    fn default() -> Self {
        SvmParameters {
            kernel: Kernel::Rbf { gamma: 0.0073 },
            c: 2.8,
            tolerance: 1e-3,
            max_iterations: 10_000_000,
            cache_rows: 1024,
        }
    }
}

impl SvmParameters {
    pub fn rbf(c: f64, gamma: f64) -> Self {
        SvmParameters {
            kernel: Kernel::Rbf { gamma },
            c,
            ..SvmParameters::default()
        }
    }

    pub fn validate(&self) -> ClassifierResult<()> {
        let check = |name: &'static str, requirement: &'static str, value: f64, ok: bool| {
            if ok && value.is_finite() {
                Ok(())
            } else {
                Err(ConfigError::HyperParameterError {
                    name,
                    requirement,
                    value,
                })
            }
        };
        check("C", "finite and positive", self.c, self.c > 0.0)?;
        check(
            "tolerance",
            "finite and positive",
            self.tolerance,
            self.tolerance > 0.0,
        )?;
        if let Kernel::Rbf { gamma } = self.kernel {
            check("gamma", "finite and non-negative", gamma, gamma >= 0.0)?;
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::EmptyDimensionError {
                name: "max_iterations",
            }
            .into());
        }
        Ok(())
    }
}

/// One binary machine, `first` votes for a positive decision value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PairModel {
    first: usize,
    second: usize,
    /// (support vector slot, `a_i * y_i`)
    coefficients: Vec<(usize, f64)>,
    rho: f64,
}

/// A trained multi-class machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvmModel {
    parameters: SvmParameters,
    classes: Vec<Label>,
    /// Length of the feature vectors.
    dimension: usize,
    support_vectors: Vec<Vec<f64>>,
    pairs: Vec<PairModel>,
}

pub(crate) fn check_input(features: ArrayView2<f64>, labels: &[Label]) -> ClassifierResult<()> {
    if features.nrows() == 0 || features.ncols() == 0 {
        return Err(ClassifierError::DegenerateInput(
            "no training examples".to_string(),
        ));
    }
    if features.nrows() != labels.len() {
        return Err(ClassifierError::DegenerateInput(format!(
            "{} feature vectors but {} labels",
            features.nrows(),
            labels.len()
        )));
    }
    if !features.iter().all(|v| v.is_finite()) {
        return Err(ClassifierError::DegenerateInput(
            "non-finite feature values".to_string(),
        ));
    }
    Ok(())
}

impl SvmModel {
    /// Trains one binary machine per pair of classes, in parallel.
    pub fn fit(
        features: ArrayView2<f64>,
        labels: &[Label],
        parameters: &SvmParameters,
    ) -> ClassifierResult<SvmModel> {
        check_input(features, labels)?;
        let rows: Vec<usize> = (0..labels.len()).collect();
        SvmModel::fit_rows(features, labels, &rows, parameters)
    }

    /// Trains on the rows `rows` of `features` and `labels` only. The pairwise solvers read
    /// their examples from `features` in place. The input must have passed [`check_input`].
    pub(crate) fn fit_rows(
        features: ArrayView2<f64>,
        labels: &[Label],
        rows: &[usize],
        parameters: &SvmParameters,
    ) -> ClassifierResult<SvmModel> {
        parameters.validate()?;
        if rows.is_empty() {
            return Err(ClassifierError::DegenerateInput(
                "no training examples".to_string(),
            ));
        }

        let classes: Vec<Label> = rows
            .iter()
            .map(|&i| labels[i])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if classes.len() < 2 {
            return Err(ClassifierError::DegenerateInput(
                "a single class".to_string(),
            ));
        }
        let members: Vec<Vec<usize>> = classes
            .iter()
            .map(|class| rows.iter().copied().filter(|&i| labels[i] == *class).collect())
            .collect();
        let pairs: Vec<(usize, usize)> = (0..classes.len())
            .flat_map(|a| (a + 1..classes.len()).map(move |b| (a, b)))
            .collect();

        let solutions: Vec<ClassifierResult<(Vec<usize>, smo::BinarySolution)>> = pairs
            .par_iter()
            .map(|&(a, b)| -> ClassifierResult<(Vec<usize>, smo::BinarySolution)> {
                let indices: Vec<usize> =
                    members[a].iter().chain(&members[b]).copied().collect();
                let targets: Vec<f64> = members[a]
                    .iter()
                    .map(|_| 1.0)
                    .chain(members[b].iter().map(|_| -1.0))
                    .collect();
                let solution = smo::solve(features, &indices, &targets, parameters)?;
                debug!(
                    "classes {} vs {}: {} iterations",
                    classes[a], classes[b], solution.iterations
                );
                Ok((indices, solution))
            })
            .collect();
        let solutions = solutions
            .into_iter()
            .collect::<ClassifierResult<Vec<_>>>()?;

        let used: BTreeSet<usize> = solutions
            .iter()
            .flat_map(|(indices, solution)| {
                indices
                    .iter()
                    .zip(&solution.coefficients)
                    .filter(|(_, &coefficient)| coefficient != 0.0)
                    .map(|(&index, _)| index)
            })
            .collect();
        let slots: BTreeMap<usize, usize> = used
            .iter()
            .enumerate()
            .map(|(slot, &index)| (index, slot))
            .collect();

        let pair_models = pairs
            .iter()
            .zip(solutions)
            .map(|(&(first, second), (indices, solution))| PairModel {
                first,
                second,
                coefficients: indices
                    .iter()
                    .zip(solution.coefficients)
                    .filter(|(_, coefficient)| *coefficient != 0.0)
                    .map(|(index, coefficient)| (slots[index], coefficient))
                    .collect(),
                rho: solution.rho,
            })
            .collect();

        info!(
            "SVM trained on {} examples, {} classes, {} support vectors",
            rows.len(),
            classes.len(),
            used.len()
        );
        Ok(SvmModel {
            parameters: *parameters,
            classes,
            dimension: features.ncols(),
            support_vectors: used.iter().map(|&i| features.row(i).to_vec()).collect(),
            pairs: pair_models,
        })
    }

    /// Checks the indices of a decoded model, so that prediction can't go out of bounds.
    fn validate(&self) -> ClassifierResult<()> {
        let inconsistent = |reason: String| Err(ClassifierError::ClassifierModelError(reason));
        self.parameters.validate()?;
        if self.classes.len() < 2 {
            return inconsistent(format!("{} classes", self.classes.len()));
        }
        if let Some(sv) = self.support_vectors.iter().find(|sv| sv.len() != self.dimension) {
            return inconsistent(format!(
                "support vector of length {}, expected {}",
                sv.len(),
                self.dimension
            ));
        }
        for pair in &self.pairs {
            if pair.first >= self.classes.len() || pair.second >= self.classes.len() {
                return inconsistent(format!(
                    "pair ({}, {}) of {} classes",
                    pair.first,
                    pair.second,
                    self.classes.len()
                ));
            }
            if let Some(&(slot, _)) = pair
                .coefficients
                .iter()
                .find(|&&(slot, _)| slot >= self.support_vectors.len())
            {
                return inconsistent(format!(
                    "support vector slot {} of {}",
                    slot,
                    self.support_vectors.len()
                ));
            }
        }
        Ok(())
    }

    pub fn parameters(&self) -> &SvmParameters {
        &self.parameters
    }

    /// Labels seen during training, sorted.
    pub fn classes(&self) -> &[Label] {
        &self.classes
    }

    /// Length of the feature vectors the model was trained on.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn support_vector_count(&self) -> usize {
        self.support_vectors.len()
    }

    /// Decision values of all pairwise machines, in (0 vs 1, 0 vs 2, ..., 1 vs 2, ...) order.
    pub fn decision_values(&self, features: ArrayView1<f64>) -> Vec<f64> {
        debug_assert_eq!(features.len(), self.dimension);
        let kernel = self.parameters.kernel;
        let kernel_values: Vec<f64> = self
            .support_vectors
            .iter()
            .map(|sv| kernel.evaluate(ArrayView1::from(&sv[..]), features))
            .collect();
        self.pairs
            .iter()
            .map(|pair| {
                pair.coefficients
                    .iter()
                    .map(|&(slot, coefficient)| coefficient * kernel_values[slot])
                    .sum::<f64>()
                    - pair.rho
            })
            .collect()
    }
}

impl Predictor for SvmModel {
    /// Majority vote of the pairwise machines, ties go to the smaller label.
    fn predict(&self, features: ArrayView1<f64>) -> Label {
        let mut votes = vec![0usize; self.classes.len()];
        for (pair, decision) in self.pairs.iter().zip(self.decision_values(features)) {
            if decision > 0.0 {
                votes[pair.first] += 1;
            } else {
                votes[pair.second] += 1;
            }
        }
        let mut winner = 0;
        for (class, &count) in votes.iter().enumerate() {
            if count > votes[winner] {
                winner = class;
            }
        }
        self.classes[winner]
    }
}

/// Classifier stage of a stack. Holds no model until trained or loaded.
#[derive(Debug, Clone, Default)]
pub struct Svm {
    model: Option<SvmModel>,
}

impl Svm {
    pub fn new() -> Self {
        Svm { model: None }
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<&SvmModel> {
        self.model.as_ref()
    }

    /// Trains on one feature vector per row. A failed training keeps the previous model.
    pub fn train(
        &mut self,
        features: ArrayView2<f64>,
        labels: &[Label],
        parameters: &SvmParameters,
    ) -> ClassifierResult<()> {
        self.model = Some(SvmModel::fit(features, labels, parameters)?);
        Ok(())
    }

    pub fn predict(&self, features: ArrayView1<f64>) -> ClassifierResult<Label> {
        let model = self.model.as_ref().ok_or(ClassifierError::NotTrained)?;
        if features.len() != model.dimension {
            return Err(ClassifierError::FeatureLengthError {
                expected: model.dimension,
                found: features.len(),
            });
        }
        Ok(model.predict(features))
    }

    /// Cross-validated search over `grid`, then a final fit with the best point on all data.
    pub fn grid_search(
        &mut self,
        features: ArrayView2<f64>,
        labels: &[Label],
        folds: usize,
        grid: &RbfGrid,
    ) -> ClassifierResult<GridSearchResult> {
        let base = SvmParameters::default();
        let result = grid_search(features, labels, folds, grid, &base)?;
        let best = SvmParameters::rbf(result.best.c, result.best.gamma);
        self.train(features, labels, &best)?;
        Ok(result)
    }

    pub fn store<W: Write>(&self, mut writer: W) -> ClassifierResult<()> {
        let model = self.model.as_ref().ok_or(ClassifierError::NotTrained)?;
        writer.write_all(&SVM_MAGIC)?;
        bincode::serialize_into(&mut writer, &SVM_VERSION)?;
        bincode::serialize_into(&mut writer, model)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load<R: Read>(mut reader: R) -> ClassifierResult<Svm> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != SVM_MAGIC {
            return Err(ClassifierError::ClassifierMagicError);
        }
        let version: u32 = bincode::deserialize_from(&mut reader)?;
        if version != SVM_VERSION {
            return Err(ClassifierError::ClassifierVersionError {
                found: version,
                supported: SVM_VERSION,
            });
        }
        let model: SvmModel = bincode::deserialize_from(&mut reader)?;
        model.validate()?;
        Ok(Svm { model: Some(model) })
    }
}
