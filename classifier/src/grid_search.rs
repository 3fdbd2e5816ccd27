//! Cross-validated grid search over the penalty `C` and the RBF width `gamma`.
use log::{info, warn};
use ndarray::*;
use rayon::prelude::*;
use rbm::{ConfigError, ConfigResult};
use serde_derive::{Deserialize, Serialize};

use crate::{
    classifier_errors::ClassifierResult,
    kernel::Kernel,
    svm::{check_input, SvmModel, SvmParameters},
    Label, Predictor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridSpacing {
    /// Evenly spaced values.
    Linear,
    /// Values evenly spaced on a log scale, the first value has to be positive.
    Logarithmic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RbfGrid {
    pub spacing: GridSpacing,
    pub c_first: f64,
    pub c_last: f64,
    pub c_steps: usize,
    pub gamma_first: f64,
    pub gamma_last: f64,
    pub gamma_steps: usize,
}

impl Default for RbfGrid {
    fn default() -> Self {
        RbfGrid {
            spacing: GridSpacing::Linear,
            c_first: 0.5,
            c_last: 18.0,
            c_steps: 12,
            gamma_first: 0.0,
            gamma_last: 1.0,
            gamma_steps: 12,
        }
    }
}

fn axis(
    name: &'static str,
    spacing: GridSpacing,
    first: f64,
    last: f64,
    steps: usize,
) -> ConfigResult<Vec<f64>> {
    let error = |reason| ConfigError::GridError { axis: name, reason };
    if steps == 0 {
        return Err(error("zero steps"));
    }
    if !(first.is_finite() && last.is_finite()) {
        return Err(error("bounds must be finite"));
    }
    if last < first {
        return Err(error("last value is smaller than the first"));
    }
    if steps == 1 {
        return Ok(vec![first]);
    }
    let fraction = |i: usize| i as f64 / (steps - 1) as f64;
    match spacing {
        GridSpacing::Linear => Ok((0..steps)
            .map(|i| first + (last - first) * fraction(i))
            .collect()),
        GridSpacing::Logarithmic => {
            if first <= 0.0 {
                return Err(error("first value must be positive on a logarithmic axis"));
            }
            let (low, high) = (first.ln(), last.ln());
            Ok((0..steps)
                .map(|i| (low + (high - low) * fraction(i)).exp())
                .collect())
        }
    }
}

impl RbfGrid {
    pub fn c_values(&self) -> ConfigResult<Vec<f64>> {
        let values = axis("C", self.spacing, self.c_first, self.c_last, self.c_steps)?;
        if values[0] <= 0.0 {
            return Err(ConfigError::GridError {
                axis: "C",
                reason: "values must be positive",
            });
        }
        Ok(values)
    }

    pub fn gamma_values(&self) -> ConfigResult<Vec<f64>> {
        let values = axis(
            "gamma",
            self.spacing,
            self.gamma_first,
            self.gamma_last,
            self.gamma_steps,
        )?;
        if values[0] < 0.0 {
            return Err(ConfigError::GridError {
                axis: "gamma",
                reason: "values must be non-negative",
            });
        }
        Ok(values)
    }

    /// All (C, gamma) points, C in the outer loop.
    pub fn points(&self) -> ConfigResult<Vec<(f64, f64)>> {
        let gammas = self.gamma_values()?;
        Ok(self
            .c_values()?
            .into_iter()
            .flat_map(|c| gammas.iter().map(move |&gamma| (c, gamma)))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridPoint {
    pub c: f64,
    pub gamma: f64,
    /// Cross-validated error rate.
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridSearchResult {
    pub best: GridPoint,
    /// Every evaluated point, in grid order.
    pub points: Vec<GridPoint>,
}

fn check_folds(folds: usize, examples: usize) -> ConfigResult<()> {
    if folds < 2 || folds > examples {
        Err(ConfigError::FoldCountError { folds, examples })
    } else {
        Ok(())
    }
}

/// Error rate of `parameters` under `folds`-fold cross-validation. Example `i` is held out in
/// fold `i % folds`. Folds are trained in parallel on the shared feature matrix; a fold whose
/// training fails counts all of its held-out examples as misclassified.
pub fn cross_validate(
    features: ArrayView2<f64>,
    labels: &[Label],
    folds: usize,
    parameters: &SvmParameters,
) -> ClassifierResult<f64> {
    check_input(features, labels)?;
    check_folds(folds, labels.len())?;

    let errors: Vec<usize> = (0..folds)
        .into_par_iter()
        .map(|fold| {
            let (test, train): (Vec<usize>, Vec<usize>) =
                (0..labels.len()).partition(|i| i % folds == fold);
            match SvmModel::fit_rows(features, labels, &train, parameters) {
                Ok(model) => test
                    .iter()
                    .filter(|&&i| model.predict(features.row(i)) != labels[i])
                    .count(),
                Err(e) => {
                    warn!("Fold {} failed: {}", fold, e);
                    test.len()
                }
            }
        })
        .collect();
    Ok(errors.iter().sum::<usize>() as f64 / labels.len() as f64)
}

/// Scores every point of `grid` by cross-validation. The best point is the first one with the
/// smallest error rate in grid order. `base` supplies everything but C and gamma.
pub fn grid_search(
    features: ArrayView2<f64>,
    labels: &[Label],
    folds: usize,
    grid: &RbfGrid,
    base: &SvmParameters,
) -> ClassifierResult<GridSearchResult> {
    let candidates = grid.points()?;
    check_input(features, labels)?;
    check_folds(folds, labels.len())?;

    let mut points = Vec::with_capacity(candidates.len());
    let mut best: Option<GridPoint> = None;
    for (c, gamma) in candidates {
        let parameters = SvmParameters {
            kernel: Kernel::Rbf { gamma },
            c,
            ..*base
        };
        let error_rate = cross_validate(features, labels, folds, &parameters)?;
        info!("C={} gamma={} -> error rate {:.5}", c, gamma, error_rate);
        let point = GridPoint {
            c,
            gamma,
            error_rate,
        };
        if best.map_or(true, |b| error_rate < b.error_rate) {
            best = Some(point);
        }
        points.push(point);
    }

    // the grid is never empty, both axes have at least one step
    let best = best.ok_or(ConfigError::GridError {
        axis: "C",
        reason: "no grid points",
    })?;
    info!(
        "Best: C={} gamma={} with error rate {:.5}",
        best.c, best.gamma, best.error_rate
    );
    Ok(GridSearchResult { best, points })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier_errors::ClassifierError;
    use crate::svm::Svm;

    /// Two concentric rings, separable with an RBF kernel but not with a constant one.
    fn rings(n: usize) -> (Array2<f64>, Vec<Label>) {
        let mut features = Array2::zeros((n, 2));
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let angle = i as f64 * 2.399;
            let label = if i % 3 == 0 { 1 } else { 0 };
            let radius = if label == 1 { 4.0 } else { 1.0 };
            features[[i, 0]] = radius * angle.cos();
            features[[i, 1]] = radius * angle.sin();
            labels.push(label);
        }
        (features, labels)
    }

    #[test]
    fn test_axis_values() {
        let grid = RbfGrid::default();
        let c = grid.c_values().unwrap();
        assert_eq!(c.len(), 12);
        assert_eq!(c[0], 0.5);
        assert!((c[11] - 18.0).abs() < 1e-12);
        assert_eq!(grid.gamma_values().unwrap()[0], 0.0);
        assert_eq!(grid.points().unwrap().len(), 144);
        assert_eq!(grid.points().unwrap()[1], (0.5, 1.0 / 11.0));

        let log = RbfGrid {
            spacing: GridSpacing::Logarithmic,
            c_first: 0.01,
            c_last: 100.0,
            c_steps: 5,
            gamma_first: 1.0,
            gamma_last: 1.0,
            gamma_steps: 1,
        };
        let c = log.c_values().unwrap();
        assert!((c[2] - 1.0).abs() < 1e-12);
        assert!((c[4] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_grids() {
        let reversed = RbfGrid {
            c_first: 2.0,
            c_last: 1.0,
            ..RbfGrid::default()
        };
        assert!(matches!(
            reversed.points(),
            Err(ConfigError::GridError { axis: "C", .. })
        ));

        let empty = RbfGrid {
            gamma_steps: 0,
            ..RbfGrid::default()
        };
        assert!(empty.points().is_err());

        let log = RbfGrid {
            spacing: GridSpacing::Logarithmic,
            ..RbfGrid::default()
        };
        assert!(matches!(
            log.gamma_values(),
            Err(ConfigError::GridError { axis: "gamma", .. })
        ));
    }

    #[test]
    fn test_cross_validation() {
        let (features, labels) = rings(80);
        let good =
            cross_validate(features.view(), &labels, 4, &SvmParameters::rbf(10.0, 0.5)).unwrap();
        assert!(good < 0.1, "error rate {}", good);

        // a constant kernel predicts the same class everywhere
        let bad =
            cross_validate(features.view(), &labels, 4, &SvmParameters::rbf(10.0, 0.0)).unwrap();
        assert!(bad > good && bad <= 1.0);

        assert!(matches!(
            cross_validate(features.view(), &labels, 1, &SvmParameters::default()),
            Err(ClassifierError::ClassifierConfigError(
                ConfigError::FoldCountError { folds: 1, examples: 80 }
            ))
        ));
    }

    #[test]
    fn test_failed_folds_count_as_errors() {
        // every fold with 2 folds holds out exactly one class
        let features = array![[0.0], [1.0], [0.1], [1.1]];
        let labels = [0, 1, 0, 1];
        let error = cross_validate(features.view(), &labels, 2, &SvmParameters::default()).unwrap();
        assert_eq!(error, 1.0);
    }

    #[test]
    fn test_grid_search_picks_first_best() {
        let (features, labels) = rings(60);
        let grid = RbfGrid {
            spacing: GridSpacing::Linear,
            c_first: 1.0,
            c_last: 10.0,
            c_steps: 2,
            gamma_first: 0.0,
            gamma_last: 1.0,
            gamma_steps: 3,
        };
        let result =
            grid_search(features.view(), &labels, 4, &grid, &SvmParameters::default()).unwrap();
        assert_eq!(result.points.len(), 6);
        let minimum = result
            .points
            .iter()
            .map(|p| p.error_rate)
            .fold(f64::INFINITY, f64::min);
        let first = result
            .points
            .iter()
            .find(|p| p.error_rate == minimum)
            .unwrap();
        assert_eq!(&result.best, first);

        let mut svm = Svm::new();
        let refit = svm.grid_search(features.view(), &labels, 4, &grid).unwrap();
        assert_eq!(refit.best, result.best);
        let model = svm.model().unwrap();
        assert_eq!(model.parameters().c, result.best.c);
    }
}
