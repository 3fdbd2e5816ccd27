//! Valid cross-correlations of multi-channel maps with a filter bank, the transposed ("full")
//! operation used to reconstruct visible maps, and the correlation of visible and hidden maps
//! that yields weight statistics.
//!
//! Everything goes through an im2col patch matrix, so the heavy lifting is a matrix product.
//! More on the technique:
//! <https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster>
use ndarray::*;

use crate::{tensor::FeatureMap, tensor::FilterBank, ImagePrecision, WeightPrecision};

/// Unrolls every `kernel x kernel` patch of the input into one row.
///
/// The input has shape (channels, height, width), the result has shape
/// (out_height * out_width, channels * kernel * kernel) with
/// `out = in - kernel + 1`. Rows are ordered row-major over the output positions,
/// columns in (channel, row, column) order, which is the order of a flattened filter.
pub fn im2col<'a, V>(input: V, kernel: usize) -> Array2<ImagePrecision>
where
    V: AsArray<'a, ImagePrecision, Ix3>,
{
    let input: ArrayView3<ImagePrecision> = input.into();
    let (channels, height, width) = input.dim();
    let out_height = height - kernel + 1;
    let out_width = width - kernel + 1;

    let mut cols = Array2::zeros((out_height * out_width, channels * kernel * kernel));
    for i in 0..out_height {
        for j in 0..out_width {
            let patch = input.slice(s![.., i..i + kernel, j..j + kernel]);
            let mut row = cols.row_mut(i * out_width + j);
            for (dst, src) in row.iter_mut().zip(patch.iter()) {
                *dst = *src;
            }
        }
    }
    cols
}

/// Inverse of [`im2col`]: adds every row back onto the patch it came from.
pub fn col2im<'a, T>(
    cols: T,
    channels: usize,
    kernel: usize,
    out_height: usize,
    out_width: usize,
) -> FeatureMap
where
    T: AsArray<'a, ImagePrecision, Ix2>,
{
    let cols: ArrayView2<ImagePrecision> = cols.into();
    let mut image = Array3::zeros((channels, out_height + kernel - 1, out_width + kernel - 1));
    for i in 0..out_height {
        for j in 0..out_width {
            let row = cols.row(i * out_width + j);
            let mut patch = image.slice_mut(s![.., i..i + kernel, j..j + kernel]);
            for (dst, src) in patch.iter_mut().zip(row.iter()) {
                *dst += *src;
            }
        }
    }
    image
}

/// Flattens a filter bank into a (filters, channels * kernel * kernel) matrix.
pub fn filter_matrix(filters: &FilterBank) -> Array2<WeightPrecision> {
    let (k, c, kh, kw) = filters.dim();
    Array2::from_shape_fn((k, c * kh * kw), |(f, idx)| {
        filters[[f, idx / (kh * kw), (idx / kw) % kh, idx % kw]]
    })
}

/// Reshapes a (filters, channels * kernel * kernel) matrix back into a filter bank.
pub fn matrix_to_filters(
    matrix: &Array2<WeightPrecision>,
    channels: usize,
    kernel: usize,
) -> FilterBank {
    let k = matrix.len_of(Axis(0));
    Array4::from_shape_fn((k, channels, kernel, kernel), |(f, c, a, b)| {
        matrix[[f, (c * kernel + a) * kernel + b]]
    })
}

/// Lays out (filters, height, width) maps as a (height * width, filters) matrix,
/// matching the row order of [`im2col`].
pub fn hidden_matrix<'a, V>(hidden: V) -> Array2<ImagePrecision>
where
    V: AsArray<'a, ImagePrecision, Ix3>,
{
    let hidden: ArrayView3<ImagePrecision> = hidden.into();
    let (k, h, w) = hidden.dim();
    Array2::from_shape_fn((h * w, k), |(p, f)| hidden[[f, p / w, p % w]])
}

/// Valid cross-correlation of an unrolled input with every filter.
/// `cols` comes from [`im2col`], `filters` from [`filter_matrix`].
/// Returns (filters, out_size, out_size) maps.
pub fn correlate_valid(
    cols: &Array2<ImagePrecision>,
    filters: &Array2<WeightPrecision>,
    out_size: usize,
) -> FeatureMap {
    let product = cols.dot(&filters.t());
    let k = filters.len_of(Axis(0));
    Array3::from_shape_fn((k, out_size, out_size), |(f, i, j)| {
        product[[i * out_size + j, f]]
    })
}

/// Full convolution of hidden maps with the filters, the transpose of [`correlate_valid`].
/// Maps (filters, h, w) back onto (channels, h + kernel - 1, w + kernel - 1).
pub fn convolve_full<'a, V>(
    hidden: V,
    filters: &Array2<WeightPrecision>,
    channels: usize,
    kernel: usize,
) -> FeatureMap
where
    V: AsArray<'a, ImagePrecision, Ix3>,
{
    let hidden: ArrayView3<ImagePrecision> = hidden.into();
    let (_, h, w) = hidden.dim();
    let cols = hidden_matrix(hidden).dot(filters);
    col2im(&cols, channels, kernel, h, w)
}

/// Correlation of an unrolled visible map with hidden maps, summed over all positions.
/// Returns a (filters, channels * kernel * kernel) matrix, laid out like [`filter_matrix`].
pub fn weight_statistics<'a, V>(cols: &Array2<ImagePrecision>, hidden: V) -> Array2<WeightPrecision>
where
    V: AsArray<'a, ImagePrecision, Ix3>,
{
    hidden_matrix(hidden).t().dot(cols)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Naive implementation of the 2d cross-correlation for reference.
    fn correlate_naive(image: &Array3<f64>, filters: &Array4<f64>) -> Array3<f64> {
        let (k, c, kh, kw) = filters.dim();
        let (_, h, w) = image.dim();
        let mut out = Array3::zeros((k, h - kh + 1, w - kw + 1));
        for f in 0..k {
            for i in 0..h - kh + 1 {
                for j in 0..w - kw + 1 {
                    let mut acc = 0.;
                    for ch in 0..c {
                        for a in 0..kh {
                            for b in 0..kw {
                                acc += image[[ch, i + a, j + b]] * filters[[f, ch, a, b]];
                            }
                        }
                    }
                    out[[f, i, j]] = acc;
                }
            }
        }
        out
    }

    #[test]
    fn test_valid_correlation() {
        let test_img = array![[[0., 1., 0.], [0., 0., 0.], [-1., 0., 0.]]];
        let kernel = Array::from_shape_vec((1, 1, 2, 2), vec![0., 1., -1., 0.]).unwrap();

        let cols = im2col(&test_img, 2);
        let out = correlate_valid(&cols, &filter_matrix(&kernel), 2);

        assert_eq!(out, array![[[1., 0.], [1., 0.]]]);
    }

    #[test]
    fn test_multichannel_correlation() {
        let test_img = array![
            [
                [1.0, 2.0, 3.0, 4.0],
                [4.0, 5.0, 6.0, 7.0],
                [7.0, 8.0, 9.0, 9.0],
                [7.0, 8.0, 9.0, 9.0]
            ],
            [
                [1.0, 2.0, 3.0, 4.0],
                [4.0, 5.0, 6.0, 7.0],
                [7.0, 8.0, 9.0, 9.0],
                [7.0, 8.0, 9.0, 9.0]
            ],
            [
                [1.0, 2.0, 3.0, 4.0],
                [4.0, 5.0, 6.0, 7.0],
                [7.0, 8.0, 9.0, 9.0],
                [7.0, 8.0, 9.0, 9.0]
            ]
        ];
        let kernel = Array::from_shape_vec(
            (1, 3, 2, 2),
            vec![1., 2., 1., 2., 1., 2., 1., 2., 1., 2., 1., 2.],
        )
        .unwrap();
        let output = arr3(&[[
            [57.0, 75.0, 93.0],
            [111.0, 129.0, 141.0],
            [138.0, 156.0, 162.0],
        ]]);

        let cols = im2col(&test_img, 2);
        assert_eq!(correlate_valid(&cols, &filter_matrix(&kernel), 3), output);
    }

    #[test]
    fn test_correlation_matches_naive() {
        let image = Array::from_shape_fn((2, 6, 6), |(c, i, j)| ((c + 2 * i + 3 * j) % 5) as f64);
        let filters = Array::from_shape_fn((3, 2, 3, 3), |(f, c, a, b)| {
            (f + c) as f64 - (a * b) as f64 * 0.5
        });

        let cols = im2col(&image, 3);
        let fast = correlate_valid(&cols, &filter_matrix(&filters), 4);
        assert_eq!(fast, correlate_naive(&image, &filters));
    }

    #[test]
    fn test_full_convolution() {
        let hidden = array![[[55.0, 52.0], [57.0, 50.0]]];
        let kernel = Array::from_shape_vec((1, 1, 2, 2), vec![1., 2., 3., 4.]).unwrap();

        let out = convolve_full(&hidden, &filter_matrix(&kernel), 1, 2);
        let expected = arr3(&[[
            [55.0, 162.0, 104.0],
            [222.0, 540.0, 308.0],
            [171.0, 378.0, 200.0],
        ]]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_full_convolution_is_transpose() {
        // <corr(v, W), h> == <v, full(h, W)> for all v, h
        let v = Array::from_shape_fn((2, 5, 5), |(c, i, j)| ((c * 7 + i * 3 + j) % 4) as f64);
        let h = Array::from_shape_fn((3, 3, 3), |(f, i, j)| ((f + i * j) % 3) as f64 - 1.);
        let filters = Array::from_shape_fn((3, 2, 3, 3), |(f, c, a, b)| {
            (f * 5 + c * 3 + a + b) as f64 * 0.1
        });
        let matrix = filter_matrix(&filters);

        let forward = correlate_valid(&im2col(&v, 3), &matrix, 3);
        let backward = convolve_full(&h, &matrix, 2, 3);
        let lhs = (&forward * &h).sum();
        let rhs = (&v * &backward).sum();
        assert!((lhs - rhs).abs() < 1e-9);
    }

    #[test]
    fn test_weight_statistics() {
        let v = Array::from_shape_fn((1, 4, 4), |(_, i, j)| (i * 4 + j) as f64);
        let h = Array::from_shape_fn((2, 3, 3), |(f, i, j)| {
            if (i + j + f) % 2 == 0 {
                1.
            } else {
                0.
            }
        });

        let stats = matrix_to_filters(&weight_statistics(&im2col(&v, 2), &h), 1, 2);
        for f in 0..2 {
            for a in 0..2 {
                for b in 0..2 {
                    let mut expected = 0.;
                    for i in 0..3 {
                        for j in 0..3 {
                            expected += v[[0, i + a, j + b]] * h[[f, i, j]];
                        }
                    }
                    assert_eq!(stats[[f, 0, a, b]], expected);
                }
            }
        }
    }

    #[test]
    fn test_filter_matrix_roundtrip() {
        let filters =
            Array::from_shape_fn((2, 3, 2, 2), |(f, c, a, b)| (f * 12 + c * 4 + a * 2 + b) as f64);
        let matrix = filter_matrix(&filters);
        assert_eq!(matrix.row(1)[0], 12.);
        assert_eq!(matrix_to_filters(&matrix, 3, 2), filters);
    }
}
