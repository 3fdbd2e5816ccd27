//! Error rates of a stack with a predictor on its final representation.
use std::fmt::{self, Display};

use ndarray::*;
use rayon::prelude::*;
use rbm::ConvDbn;

use crate::{Label, Predictor};

/// Predicts the index of the strongest feature. Used when no classifier has been trained.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArgmaxPredictor;

impl Predictor for ArgmaxPredictor {
    fn predict(&self, features: ArrayView1<f64>) -> Label {
        let mut best = 0;
        for (i, &value) in features.iter().enumerate() {
            if value > features[best] {
                best = i;
            }
        }
        best
    }
}

/// Fraction of rows of `features` the predictor gets wrong. 0 for an empty set.
pub fn feature_error_rate<P: Predictor>(
    predictor: &P,
    features: ArrayView2<f64>,
    labels: &[Label],
) -> f64 {
    debug_assert_eq!(features.nrows(), labels.len());
    if labels.is_empty() {
        return 0.0;
    }
    let errors: usize = (0..labels.len())
        .into_par_iter()
        .filter(|&i| predictor.predict(features.row(i)) != labels[i])
        .count();
    errors as f64 / labels.len() as f64
}

/// Fraction of `images` whose feature vector the predictor maps to the wrong label. Feature
/// vectors are computed image by image and dropped after prediction.
pub fn error_rate<P: Predictor>(
    dbn: &ConvDbn,
    predictor: &P,
    images: ArrayView4<f64>,
    labels: &[Label],
) -> f64 {
    debug_assert_eq!(images.len_of(Axis(0)), labels.len());
    if labels.is_empty() {
        return 0.0;
    }
    let errors: usize = (0..labels.len())
        .into_par_iter()
        .filter(|&i| {
            let features = dbn.features(images.index_axis(Axis(0), i));
            predictor.predict(features.view()) != labels[i]
        })
        .count();
    errors as f64 / labels.len() as f64
}

/// Error rates on the training and on the held-out set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub training: f64,
    pub test: f64,
}

impl Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Training error rate: {:.5}", self.training)?;
        write!(f, "Test error rate: {:.5}", self.test)
    }
}

pub fn test_all<P: Predictor>(
    dbn: &ConvDbn,
    predictor: &P,
    training: (ArrayView4<f64>, &[Label]),
    test: (ArrayView4<f64>, &[Label]),
) -> Report {
    Report {
        training: error_rate(dbn, predictor, training.0, training.1),
        test: error_rate(dbn, predictor, test.0, test.1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbm::{LayerConfig, StackConfig};

    struct Constant(Label);

    impl Predictor for Constant {
        fn predict(&self, _: ArrayView1<f64>) -> Label {
            self.0
        }
    }

    #[test]
    fn test_argmax() {
        assert_eq!(ArgmaxPredictor.predict(array![0.1, 0.7, 0.2].view()), 1);
        // ties go to the first index
        assert_eq!(ArgmaxPredictor.predict(array![0.5, 0.2, 0.5].view()), 0);
    }

    #[test]
    fn test_feature_error_rate() {
        let features = Array2::zeros((4, 3));
        assert_eq!(
            feature_error_rate(&Constant(1), features.view(), &[1, 1, 0, 2]),
            0.5
        );
        assert_eq!(
            feature_error_rate(&Constant(1), Array2::zeros((0, 3)).view(), &[]),
            0.0
        );
    }

    /// Counts how often it is asked, answers with the label of the strongest feature.
    struct Counting(std::sync::atomic::AtomicUsize);

    impl Predictor for Counting {
        fn predict(&self, features: ArrayView1<f64>) -> Label {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            ArgmaxPredictor.predict(features)
        }
    }

    #[test]
    fn test_error_rate_matches_feature_matrix() {
        let dbn = ConvDbn::new(StackConfig::new(vec![LayerConfig::new(6, 1, 4, 3)]).with_seed(2))
            .unwrap();
        let images = Array4::from_shape_fn((7, 1, 6, 6), |(e, _, i, j)| ((e + i * j) % 2) as f64);
        let labels: Vec<Label> = (0..7).map(|e| e % 3).collect();
        let counting = Counting(Default::default());
        let streamed = error_rate(&dbn, &counting, images.view(), &labels);
        assert_eq!(counting.0.into_inner(), 7);

        let features = dbn.features_batch(images.view());
        let batched = feature_error_rate(&ArgmaxPredictor, features.view(), &labels);
        assert_eq!(streamed, batched);
    }

    #[test]
    fn test_report() {
        let dbn = ConvDbn::new(StackConfig::new(vec![LayerConfig::new(6, 1, 4, 2)]).with_seed(1))
            .unwrap();
        let images = Array4::from_elem((3, 1, 6, 6), 1.0);
        let labels: [Label; 3] = [0, 0, 1];
        let report = test_all(
            &dbn,
            &Constant(0),
            (images.view(), &labels),
            (images.slice(s![..0, .., .., ..]), &[]),
        );
        assert!((report.training - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(report.test, 0.0);
        assert!(report.to_string().starts_with("Training error rate: 0.33333"));
    }
}
