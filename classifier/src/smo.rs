//! Sequential minimal optimization for the binary C-SVC dual
//!
//! `min 1/2 a^T Q a - e^T a` subject to `0 <= a_i <= C`, `y^T a = 0`, with `Q_ij = y_i y_j K_ij`.
//!
//! Working pairs are the maximal violating pair (Keerthi et al., 2001), the pair update and the
//! bias follow Fan, Chen and Lin (2005), <https://www.jmlr.org/papers/v6/fan05a.html>.
use ndarray::ArrayView2;

use crate::{
    classifier_errors::{ClassifierError, ClassifierResult},
    kernel::KernelCache,
    svm::SvmParameters,
};

/// Replaces non-positive curvature along the working pair.
const TAU: f64 = 1e-12;

pub(crate) struct BinarySolution {
    /// `a_i * y_i` for every training example, in the order of the solved indices.
    pub coefficients: Vec<f64>,
    /// Bias, the decision function is `sum_i coefficients_i K(x_i, x) - rho`.
    pub rho: f64,
    pub iterations: usize,
}

/// Solves the dual for the examples `indices` of `data`, `targets[t]` in {+1, -1} belongs to
/// example `indices[t]`.
pub(crate) fn solve(
    data: ArrayView2<f64>,
    indices: &[usize],
    targets: &[f64],
    parameters: &SvmParameters,
) -> ClassifierResult<BinarySolution> {
    debug_assert_eq!(indices.len(), targets.len());
    let n = targets.len();
    let c = parameters.c;
    let mut cache = KernelCache::new(data.view(), indices, parameters.kernel, parameters.cache_rows);
    let diagonal = cache.diagonal();

    let mut alpha = vec![0.0; n];
    let mut gradient = vec![-1.0; n];
    let mut iterations = 0;

    while let Some((i, j, gap)) = select_pair(&alpha, &gradient, targets, c) {
        if gap < parameters.tolerance {
            break;
        }
        if iterations >= parameters.max_iterations {
            return Err(ClassifierError::ConvergenceFailure { iterations });
        }
        iterations += 1;

        let row_i = cache.row(i);
        let row_j = cache.row(j);
        let (yi, yj) = (targets[i], targets[j]);
        let (old_i, old_j) = (alpha[i], alpha[j]);
        let curvature = diagonal[i] + diagonal[j] - 2.0 * row_i[j];
        let curvature = if curvature <= 0.0 { TAU } else { curvature };

        if yi != yj {
            let delta = (-gradient[i] - gradient[j]) / curvature;
            let diff = alpha[i] - alpha[j];
            alpha[i] += delta;
            alpha[j] += delta;
            if diff > 0.0 {
                if alpha[j] < 0.0 {
                    alpha[j] = 0.0;
                    alpha[i] = diff;
                }
                if alpha[i] > c {
                    alpha[i] = c;
                    alpha[j] = c - diff;
                }
            } else {
                if alpha[i] < 0.0 {
                    alpha[i] = 0.0;
                    alpha[j] = -diff;
                }
                if alpha[j] > c {
                    alpha[j] = c;
                    alpha[i] = c + diff;
                }
            }
        } else {
            let delta = (gradient[i] - gradient[j]) / curvature;
            let sum = alpha[i] + alpha[j];
            alpha[i] -= delta;
            alpha[j] += delta;
            if sum > c {
                if alpha[i] > c {
                    alpha[i] = c;
                    alpha[j] = sum - c;
                }
                if alpha[j] > c {
                    alpha[j] = c;
                    alpha[i] = sum - c;
                }
            } else {
                if alpha[j] < 0.0 {
                    alpha[j] = 0.0;
                    alpha[i] = sum;
                }
                if alpha[i] < 0.0 {
                    alpha[i] = 0.0;
                    alpha[j] = sum;
                }
            }
        }

        let delta_i = (alpha[i] - old_i) * yi;
        let delta_j = (alpha[j] - old_j) * yj;
        for t in 0..n {
            gradient[t] += targets[t] * (row_i[t] * delta_i + row_j[t] * delta_j);
        }
    }

    Ok(BinarySolution {
        coefficients: alpha.iter().zip(targets).map(|(a, y)| a * y).collect(),
        rho: bias(&alpha, &gradient, targets, c),
        iterations,
    })
}

/// Maximal violating pair and its violation `max_{I_up} -y G - min_{I_low} -y G`.
fn select_pair(
    alpha: &[f64],
    gradient: &[f64],
    targets: &[f64],
    c: f64,
) -> Option<(usize, usize, f64)> {
    let mut up: Option<(usize, f64)> = None;
    let mut low: Option<(usize, f64)> = None;
    for (t, ((&a, &g), &y)) in alpha.iter().zip(gradient).zip(targets).enumerate() {
        let value = -y * g;
        let in_up = (y > 0.0 && a < c) || (y < 0.0 && a > 0.0);
        let in_low = (y > 0.0 && a > 0.0) || (y < 0.0 && a < c);
        if in_up && up.map_or(true, |(_, best)| value > best) {
            up = Some((t, value));
        }
        if in_low && low.map_or(true, |(_, best)| value < best) {
            low = Some((t, value));
        }
    }
    match (up, low) {
        (Some((i, max)), Some((j, min))) => Some((i, j, max - min)),
        _ => None,
    }
}

/// Mean of `y G` over the free examples, the middle of the feasible interval without any.
fn bias(alpha: &[f64], gradient: &[f64], targets: &[f64], c: f64) -> f64 {
    let mut upper = f64::INFINITY;
    let mut lower = f64::NEG_INFINITY;
    let mut free_sum = 0.0;
    let mut free = 0;
    for ((&a, &g), &y) in alpha.iter().zip(gradient).zip(targets) {
        let yg = y * g;
        if a >= c {
            if y < 0.0 {
                upper = upper.min(yg);
            } else {
                lower = lower.max(yg);
            }
        } else if a <= 0.0 {
            if y > 0.0 {
                upper = upper.min(yg);
            } else {
                lower = lower.max(yg);
            }
        } else {
            free += 1;
            free_sum += yg;
        }
    }
    if free > 0 {
        free_sum / free as f64
    } else {
        match (upper.is_finite(), lower.is_finite()) {
            (true, true) => (upper + lower) / 2.0,
            (true, false) => upper,
            (false, true) => lower,
            (false, false) => 0.0,
        }
    }
}
