//! Feature maps, filter banks and batches, plus the glue to move between flat image vectors
//! and 4D batches.
use ndarray::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::ImagePrecision;

/// One image or one set of hidden maps, (channels, height, width).
pub type FeatureMap = Array3<ImagePrecision>;
/// Batch of feature maps, (examples, channels, height, width).
pub type FeatureBatch = Array4<ImagePrecision>;
/// Filters of a layer, (filters, channels, kernel height, kernel width).
pub type FilterBank = Array4<crate::WeightPrecision>;

/// Builds a batch out of flat, row-major images of `channels x size x size` values each.
pub fn images_to_batch(
    images: &[Vec<ImagePrecision>],
    channels: usize,
    size: usize,
) -> Result<FeatureBatch, ShapeError> {
    let flat: Vec<ImagePrecision> = images.iter().flatten().copied().collect();
    Array::from_shape_vec((images.len(), channels, size, size), flat)
}

/// Flattens every example of a batch into one row.
pub fn flatten_batch(batch: ArrayView4<ImagePrecision>) -> Array2<ImagePrecision> {
    let (n, c, h, w) = batch.dim();
    Array2::from_shape_fn((n, c * h * w), |(i, idx)| {
        batch[[i, idx / (h * w), (idx / w) % h, idx % w]]
    })
}

/// Stacks equally shaped maps into a batch.
pub fn stack_maps(maps: &[FeatureMap], shape: (usize, usize, usize)) -> FeatureBatch {
    let mut batch = Array4::zeros((maps.len(), shape.0, shape.1, shape.2));
    for (mut slot, map) in batch.outer_iter_mut().zip(maps) {
        slot.assign(map);
    }
    batch
}

/// Applies `f` to every example of the batch in parallel. The results keep the order of the
/// batch.
pub fn map_batch<F>(
    batch: ArrayView4<ImagePrecision>,
    shape: (usize, usize, usize),
    f: F,
) -> FeatureBatch
where
    F: Fn(ArrayView3<ImagePrecision>) -> FeatureMap + Sync,
{
    let maps: Vec<FeatureMap> = (0..batch.len_of(Axis(0)))
        .into_par_iter()
        .map(|i| f(batch.index_axis(Axis(0), i)))
        .collect();
    stack_maps(&maps, shape)
}

/// Like [`map_batch`], but hands every example its own random generator. The generators are
/// derived from `base_seed` and the example index, so results don't depend on scheduling.
pub fn map_batch_sampled<F>(
    batch: ArrayView4<ImagePrecision>,
    shape: (usize, usize, usize),
    base_seed: u64,
    f: F,
) -> FeatureBatch
where
    F: Fn(ArrayView3<ImagePrecision>, &mut ChaCha8Rng) -> FeatureMap + Sync,
{
    let maps: Vec<FeatureMap> = (0..batch.len_of(Axis(0)))
        .into_par_iter()
        .map(|i| {
            let mut rng = example_rng(base_seed, i);
            f(batch.index_axis(Axis(0), i), &mut rng)
        })
        .collect();
    stack_maps(&maps, shape)
}

/// Random generator of the `index`-th example of a batch.
pub fn example_rng(base_seed: u64, index: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(base_seed.wrapping_add(index as u64))
}
