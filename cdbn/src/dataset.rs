//! Labelled image datasets: MNIST IDX files or `.npz` archives, read into flat
//! row-major images of `size x size` pixels.
use std::{
    fs::{self, File},
    io,
    path::Path,
};

use classifier::Label;
use log::{debug, info};
use ndarray::{Array, ArrayD, ShapeError};
use ndarray_npy::{NpzReader, ReadNpzError};
use rand::{seq::SliceRandom, Rng};
use rbm::tensor::{images_to_batch, FeatureBatch};
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("The training set is empty")]
    Empty,
    #[error("Could not read dataset")]
    Io(#[from] io::Error),
    #[error("Could not read npz archive")]
    Npz(#[from] ReadNpzError),
    #[error("{file} is malformed: {reason}")]
    Format { file: String, reason: String },
    #[error("{images} images but {labels} labels")]
    LabelCount { images: usize, labels: usize },
    #[error("Images do not fit the expected shape")]
    Shape(#[from] ShapeError),
    #[error("The model expects {expected}x{expected} images, the dataset has {found}x{found}")]
    ImageSize { expected: usize, found: usize },
}

const IMAGE_MAGIC: u32 = 2051;
const LABEL_MAGIC: u32 = 2049;

pub const TRAINING_IMAGES: &str = "train-images-idx3-ubyte";
pub const TRAINING_LABELS: &str = "train-labels-idx1-ubyte";
pub const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
pub const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

/// Pixels strictly above this become 1 when binarizing.
pub const BINARIZE_THRESHOLD: f64 = 30.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub training_images: Vec<Vec<f64>>,
    pub training_labels: Vec<Label>,
    pub test_images: Vec<Vec<f64>>,
    pub test_labels: Vec<Label>,
    /// Side length of the square images.
    pub size: usize,
}

impl Dataset {
    fn new(
        training: (Vec<Vec<f64>>, Vec<Label>),
        test: (Vec<Vec<f64>>, Vec<Label>),
        size: usize,
        limit: Option<usize>,
    ) -> DatasetResult<Dataset> {
        let (mut training_images, mut training_labels) = training;
        let (test_images, test_labels) = test;
        for (images, labels) in [
            (training_images.len(), training_labels.len()),
            (test_images.len(), test_labels.len()),
        ] {
            if images != labels {
                return Err(DatasetError::LabelCount { images, labels });
            }
        }
        if let Some(limit) = limit {
            training_images.truncate(limit);
            training_labels.truncate(limit);
        }
        if training_images.is_empty() {
            return Err(DatasetError::Empty);
        }
        info!(
            "Read {} training and {} test images of {}x{}",
            training_images.len(),
            test_images.len(),
            size,
            size
        );
        Ok(Dataset {
            training_images,
            training_labels,
            test_images,
            test_labels,
            size,
        })
    }

    /// The training images as a single channel batch.
    pub fn training_batch(&self) -> DatasetResult<FeatureBatch> {
        Ok(images_to_batch(&self.training_images, 1, self.size)?)
    }

    pub fn test_batch(&self) -> DatasetResult<FeatureBatch> {
        Ok(images_to_batch(&self.test_images, 1, self.size)?)
    }

    /// Fails unless the images are single channel `size x size`.
    pub fn check_input_shape(&self, shape: (usize, usize, usize)) -> DatasetResult<()> {
        let (channels, height, width) = shape;
        if channels != 1 || height != self.size || width != self.size {
            return Err(DatasetError::ImageSize {
                expected: height,
                found: self.size,
            });
        }
        Ok(())
    }
}

fn malformed(file: &Path, reason: impl Into<String>) -> DatasetError {
    DatasetError::Format {
        file: file.display().to_string(),
        reason: reason.into(),
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let word = bytes.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

/// Reads an IDX3 image file, returns the images and their side length.
fn read_idx_images(path: &Path) -> DatasetResult<(Vec<Vec<f64>>, usize)> {
    let bytes = fs::read(path)?;
    let header = |offset| read_u32(&bytes, offset).ok_or_else(|| malformed(path, "short header"));
    if header(0)? != IMAGE_MAGIC {
        return Err(malformed(path, "not an IDX image file"));
    }
    let count = header(4)? as usize;
    let rows = header(8)? as usize;
    let columns = header(12)? as usize;
    if rows != columns {
        return Err(malformed(path, format!("{}x{} images are not square", rows, columns)));
    }
    let pixels = &bytes[16..];
    let len = rows
        .checked_mul(columns)
        .ok_or_else(|| malformed(path, "image size overflows"))?;
    let total = count
        .checked_mul(len)
        .ok_or_else(|| malformed(path, "pixel count overflows"))?;
    if pixels.len() < total {
        return Err(malformed(path, "truncated pixel data"));
    }
    let images = pixels
        .chunks_exact(len.max(1))
        .take(count)
        .map(|image| image.iter().map(|&p| p as f64).collect())
        .collect();
    debug!("{}: {} images", path.display(), count);
    Ok((images, rows))
}

fn read_idx_labels(path: &Path) -> DatasetResult<Vec<Label>> {
    let bytes = fs::read(path)?;
    if read_u32(&bytes, 0) != Some(LABEL_MAGIC) {
        return Err(malformed(path, "not an IDX label file"));
    }
    let count = read_u32(&bytes, 4).ok_or_else(|| malformed(path, "short header"))? as usize;
    let labels = &bytes[8..];
    if labels.len() < count {
        return Err(malformed(path, "truncated label data"));
    }
    Ok(labels[..count].iter().map(|&l| l as Label).collect())
}

/// Reads the four MNIST IDX files from `dir`. `limit` truncates the training set.
pub fn read_mnist(dir: &Path, limit: Option<usize>) -> DatasetResult<Dataset> {
    let (training_images, size) = read_idx_images(&dir.join(TRAINING_IMAGES))?;
    let training_labels = read_idx_labels(&dir.join(TRAINING_LABELS))?;
    let (test_images, test_size) = read_idx_images(&dir.join(TEST_IMAGES))?;
    let test_labels = read_idx_labels(&dir.join(TEST_LABELS))?;
    if !test_images.is_empty() && test_size != size {
        return Err(malformed(
            &dir.join(TEST_IMAGES),
            format!("{}x{} images next to {}x{} training images", test_size, test_size, size, size),
        ));
    }
    Dataset::new(
        (training_images, training_labels),
        (test_images, test_labels),
        size,
        limit,
    )
}

fn read_npz_array<R: io::Read + io::Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> DatasetResult<ArrayD<u8>> {
    match npz.by_name(name) {
        Ok(array) => Ok(array),
        Err(_) => Ok(npz.by_name(&format!("{}.npy", name))?),
    }
}

fn npz_images(path: &Path, array: ArrayD<u8>) -> DatasetResult<(Vec<Vec<f64>>, usize)> {
    let shape = array.shape().to_vec();
    let (count, size) = match shape[..] {
        [n, h, w] if h == w => (n, h),
        [n, len] => {
            let side = (len as f64).sqrt().round() as usize;
            if side * side != len {
                return Err(malformed(path, format!("{} pixels are not a square image", len)));
            }
            (n, side)
        }
        _ => return Err(malformed(path, format!("unexpected image shape {:?}", shape))),
    };
    let flat = Array::from_shape_vec((count, size * size), array.iter().copied().collect())?;
    let images = flat
        .outer_iter()
        .map(|row| row.iter().map(|&p| p as f64).collect())
        .collect();
    Ok((images, size))
}

/// Reads an archive with the `u8` arrays `training_images`, `training_labels`, `test_images`
/// and `test_labels`. Images are either (n, size, size) or (n, size * size).
pub fn read_npz(path: &Path, limit: Option<usize>) -> DatasetResult<Dataset> {
    let mut npz = NpzReader::new(File::open(path)?)?;
    let (training_images, size) = npz_images(path, read_npz_array(&mut npz, "training_images")?)?;
    let (test_images, test_size) = npz_images(path, read_npz_array(&mut npz, "test_images")?)?;
    if !test_images.is_empty() && test_size != size {
        return Err(malformed(path, "test and training images differ in size"));
    }
    let labels = |array: ArrayD<u8>| array.iter().map(|&l| l as Label).collect::<Vec<_>>();
    let training_labels = labels(read_npz_array(&mut npz, "training_labels")?);
    let test_labels = labels(read_npz_array(&mut npz, "test_labels")?);
    Dataset::new(
        (training_images, training_labels),
        (test_images, test_labels),
        size,
        limit,
    )
}

/// Reads an `.npz` archive or a directory of IDX files, depending on `path`.
pub fn read_dataset(path: &Path, limit: Option<usize>) -> DatasetResult<Dataset> {
    if path.extension().map_or(false, |e| e == "npz") {
        read_npz(path, limit)
    } else {
        read_mnist(path, limit)
    }
}

pub fn binarize_each(images: &mut [Vec<f64>]) {
    for image in images {
        for pixel in image.iter_mut() {
            *pixel = if *pixel > BINARIZE_THRESHOLD { 1.0 } else { 0.0 };
        }
    }
}

/// Binarizes training and test images.
pub fn binarize_dataset(dataset: &mut Dataset) {
    binarize_each(&mut dataset.training_images);
    binarize_each(&mut dataset.test_images);
}

/// Applies one random permutation to the training images and their labels.
pub fn shuffle_dataset<R: Rng + ?Sized>(dataset: &mut Dataset, rng: &mut R) {
    let mut order: Vec<usize> = (0..dataset.training_images.len()).collect();
    order.shuffle(rng);
    dataset.training_images = order
        .iter()
        .map(|&i| dataset.training_images[i].clone())
        .collect();
    dataset.training_labels = order.iter().map(|&i| dataset.training_labels[i]).collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};
    use ndarray_npy::NpzWriter;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::io::Write;

    fn write_idx(dir: &Path, images: &[[u8; 4]], labels: &[u8], prefix: (&str, &str)) {
        let mut file = File::create(dir.join(prefix.0)).unwrap();
        for word in &[IMAGE_MAGIC, images.len() as u32, 2, 2] {
            file.write_all(&word.to_be_bytes()).unwrap();
        }
        for image in images {
            file.write_all(image).unwrap();
        }
        let mut file = File::create(dir.join(prefix.1)).unwrap();
        for word in &[LABEL_MAGIC, labels.len() as u32] {
            file.write_all(&word.to_be_bytes()).unwrap();
        }
        file.write_all(labels).unwrap();
    }

    fn mnist_dir(training: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let images: Vec<[u8; 4]> = (0..training as u8).map(|i| [i, 0, 200, 31]).collect();
        let labels: Vec<u8> = (0..training as u8).map(|i| i % 10).collect();
        write_idx(dir.path(), &images, &labels, (TRAINING_IMAGES, TRAINING_LABELS));
        write_idx(dir.path(), &[[255, 0, 0, 0]], &[7], (TEST_IMAGES, TEST_LABELS));
        dir
    }

    #[test]
    fn test_read_mnist() {
        let dir = mnist_dir(5);
        let dataset = read_mnist(dir.path(), None).unwrap();
        assert_eq!(dataset.size, 2);
        assert_eq!(dataset.training_images.len(), 5);
        assert_eq!(dataset.training_images[3], vec![3.0, 0.0, 200.0, 31.0]);
        assert_eq!(dataset.training_labels, vec![0, 1, 2, 3, 4]);
        assert_eq!(dataset.test_labels, vec![7]);
        assert_eq!(dataset.training_batch().unwrap().dim(), (5, 1, 2, 2));
        assert!(dataset.check_input_shape((1, 2, 2)).is_ok());
        assert!(matches!(
            dataset.check_input_shape((1, 28, 28)),
            Err(DatasetError::ImageSize { expected: 28, found: 2 })
        ));

        let limited = read_mnist(dir.path(), Some(2)).unwrap();
        assert_eq!(limited.training_images.len(), 2);
        assert_eq!(limited.test_images.len(), 1);
    }

    #[test]
    fn test_empty_and_missing() {
        let dir = mnist_dir(0);
        assert!(matches!(read_mnist(dir.path(), None), Err(DatasetError::Empty)));
        assert!(matches!(read_mnist(dir.path(), Some(0)), Err(DatasetError::Empty)));

        let nothing = tempfile::tempdir().unwrap();
        assert!(matches!(read_dataset(nothing.path(), None), Err(DatasetError::Io(_))));
    }

    #[test]
    fn test_bad_magic() {
        let dir = mnist_dir(2);
        fs::write(dir.path().join(TRAINING_LABELS), [0u8; 12]).unwrap();
        assert!(matches!(
            read_mnist(dir.path(), None),
            Err(DatasetError::Format { .. })
        ));
    }

    #[test]
    fn test_oversized_header() {
        let dir = mnist_dir(2);
        let mut header = Vec::new();
        for word in &[IMAGE_MAGIC, u32::MAX, u32::MAX, u32::MAX] {
            header.extend_from_slice(&word.to_be_bytes());
        }
        fs::write(dir.path().join(TRAINING_IMAGES), &header).unwrap();
        assert!(matches!(
            read_mnist(dir.path(), None),
            Err(DatasetError::Format { .. })
        ));
    }

    #[test]
    fn test_read_npz() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("digits.npz");
        let mut npz = NpzWriter::new(File::create(&path).unwrap());
        let training = Array3::from_shape_fn((3, 2, 2), |(n, i, j)| (n * 4 + i * 2 + j) as u8);
        let test = Array2::from_elem((1, 4), 255u8);
        npz.add_array("training_images", &training).unwrap();
        npz.add_array("training_labels", &ndarray::arr1(&[1u8, 2, 3])).unwrap();
        npz.add_array("test_images", &test).unwrap();
        npz.add_array("test_labels", &ndarray::arr1(&[9u8])).unwrap();
        npz.finish().unwrap();

        let dataset = read_dataset(&path, None).unwrap();
        assert_eq!(dataset.size, 2);
        assert_eq!(dataset.training_images[1], vec![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(dataset.training_labels, vec![1, 2, 3]);
        assert_eq!(dataset.test_images, vec![vec![255.0; 4]]);
        assert_eq!(dataset.test_labels, vec![9]);
    }

    #[test]
    fn test_binarize_and_shuffle() {
        let dir = mnist_dir(10);
        let mut dataset = read_mnist(dir.path(), None).unwrap();
        binarize_dataset(&mut dataset);
        assert_eq!(dataset.training_images[3], vec![0.0, 0.0, 1.0, 1.0]);
        assert_eq!(dataset.test_images[0], vec![1.0, 0.0, 0.0, 0.0]);

        let mut raw = read_mnist(dir.path(), None).unwrap();
        let before = raw.clone();
        shuffle_dataset(&mut raw, &mut ChaCha8Rng::seed_from_u64(3));
        assert_ne!(raw.training_labels, before.training_labels);
        // images and labels move together
        for (image, &label) in raw.training_images.iter().zip(&raw.training_labels) {
            assert_eq!(image[0] as usize % 10, label);
        }
        let mut sorted = raw.training_labels.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, before.training_labels);
    }
}
