//! Activation and sampling functions of the energy layers: the logistic function, Bernoulli
//! and gaussian sampling, and probabilistic max pooling.
//!
//! All sampling functions clamp their probabilities into the open interval (0, 1) first, so
//! saturated or NaN probabilities never produce a degenerate draw.
use ndarray::*;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{tensor::FeatureMap, ImagePrecision};

/// Smallest probability a sampler will see.
pub const PROBABILITY_EPSILON: f64 = 1e-12;

pub fn sigmoid(x: ImagePrecision) -> ImagePrecision {
    1.0 / (1.0 + (-x).exp())
}

/// Logistic function applied to every element.
pub fn sigmoid_map<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(sigmoid)
}

/// Clamps into [eps, 1 - eps], NaN becomes eps.
pub fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        PROBABILITY_EPSILON
    } else {
        p.max(PROBABILITY_EPSILON).min(1.0 - PROBABILITY_EPSILON)
    }
}

/// Draws a binary state for every unit.
pub fn bernoulli_sample<R, D>(
    probabilities: ArrayView<ImagePrecision, D>,
    rng: &mut R,
) -> Array<ImagePrecision, D>
where
    R: Rng + ?Sized,
    D: Dimension,
{
    probabilities.mapv(|p| {
        if rng.gen::<f64>() < clamp_probability(p) {
            1.0
        } else {
            0.0
        }
    })
}

/// Adds unit variance gaussian noise to every mean.
pub fn gaussian_sample<R, D>(
    means: ArrayView<ImagePrecision, D>,
    rng: &mut R,
) -> Array<ImagePrecision, D>
where
    R: Rng + ?Sized,
    D: Dimension,
{
    means.mapv(|m| m + rng.sample::<f64, _>(StandardNormal))
}

/// Probabilistic max pooling over non-overlapping `ratio x ratio` blocks of
/// (filters, height, width) energies.
///
/// Every block together with an extra "off" state forms one softmax:
/// `P(h_i = 1) = exp(I_i) / (1 + sum_j exp(I_j))` and `P(off) = 1 / (1 + sum_j exp(I_j))`.
/// Returns the unit probabilities (same shape as the energies) and the off probabilities
/// (one per block, shape (filters, height / ratio, width / ratio)).
pub fn max_pool_probabilities<'a, V>(energies: V, ratio: usize) -> (FeatureMap, FeatureMap)
where
    V: AsArray<'a, ImagePrecision, Ix3>,
{
    let energies: ArrayView3<ImagePrecision> = energies.into();
    let (k, h, w) = energies.dim();
    let mut units = Array3::zeros((k, h, w));
    let mut off = Array3::zeros((k, h / ratio, w / ratio));

    for f in 0..k {
        for bi in 0..h / ratio {
            for bj in 0..w / ratio {
                let rows = bi * ratio..(bi + 1) * ratio;
                let cols = bj * ratio..(bj + 1) * ratio;
                let block = energies.slice(s![f, rows.clone(), cols.clone()]);

                // the off state has energy 0
                let max = block.fold(0.0f64, |acc, &e| acc.max(e));
                let exps = block.mapv(|e| (e - max).exp());
                let off_exp = (-max).exp();
                let normalizer = off_exp + exps.sum();

                units
                    .slice_mut(s![f, rows, cols])
                    .assign(&(exps / normalizer));
                off[[f, bi, bj]] = off_exp / normalizer;
            }
        }
    }
    (units, off)
}

/// Samples pooled hidden units given their unit probabilities: in every block at most one unit
/// is switched on, none with the remaining probability mass.
pub fn max_pool_sample<R>(
    probabilities: ArrayView3<ImagePrecision>,
    ratio: usize,
    rng: &mut R,
) -> FeatureMap
where
    R: Rng + ?Sized,
{
    let (k, h, w) = probabilities.dim();
    let mut sample = Array3::zeros((k, h, w));

    for f in 0..k {
        for bi in 0..h / ratio {
            for bj in 0..w / ratio {
                let u = rng.gen::<f64>();
                let mut cumulative = 0.0;
                'block: for i in bi * ratio..(bi + 1) * ratio {
                    for j in bj * ratio..(bj + 1) * ratio {
                        let p = probabilities[[f, i, j]];
                        cumulative += if p.is_nan() { 0.0 } else { p.max(0.0).min(1.0) };
                        if u < cumulative.min(1.0 - PROBABILITY_EPSILON) {
                            sample[[f, i, j]] = 1.0;
                            break 'block;
                        }
                    }
                }
            }
        }
    }
    sample
}
