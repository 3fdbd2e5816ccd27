//! Contrastive divergence training of a single convolutional RBM.
//!
//! Statistics of the examples of a mini-batch are gathered in parallel, every example with a
//! random generator derived from a per-batch seed, and reduced in batch order, so the update
//! does not depend on the number of threads.
use log::{debug, info};
use ndarray::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    config::{DecayKind, Sparsity},
    convolutions::{im2col, matrix_to_filters, weight_statistics},
    crbm::ConvRbm,
    tensor::{example_rng, stack_maps, FeatureMap},
    WeightPrecision,
};

/// Summary of one mini-batch.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BatchStatistics {
    /// Mean squared difference between the batch and its reconstruction.
    pub reconstruction_error: f64,
    /// Mean hidden activation probability.
    pub sparsity: f64,
}

/// Summary of one epoch, averaged over all examples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub reconstruction_error: f64,
    pub sparsity: f64,
}

/// Positive minus negative statistics of one example.
struct ExampleStatistics {
    weights: Array2<WeightPrecision>,
    hidden: Array1<f64>,
    visible: Array1<f64>,
    activation: Array1<f64>,
    error: f64,
    chain: Option<FeatureMap>,
}

/// Trains a [`ConvRbm`] with CD-k or PCD-k. Holds the momentum increments and the epoch counter,
/// so one trainer should be used for all epochs of a layer.
pub struct CdTrainer {
    rng: ChaCha8Rng,
    weight_increment: Array2<WeightPrecision>,
    hidden_increment: Array1<WeightPrecision>,
    visible_increment: Array1<WeightPrecision>,
    epoch: usize,
    examples: usize,
    error_sum: f64,
    sparsity_sum: f64,
}

impl CdTrainer {
    pub fn new(layer: &ConvRbm, seed: u64) -> CdTrainer {
        let config = layer.config();
        let k = config.kernel_size;
        CdTrainer {
            rng: ChaCha8Rng::seed_from_u64(seed),
            weight_increment: Array2::zeros((config.filters, config.channels * k * k)),
            hidden_increment: Array1::zeros(config.filters),
            visible_increment: Array1::zeros(config.channels),
            epoch: 0,
            examples: 0,
            error_sum: 0.0,
            sparsity_sum: 0.0,
        }
    }

    /// Number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Trains `layer` for `epochs` epochs on `images`, in dataset order.
    pub fn train(
        layer: &mut ConvRbm,
        images: ArrayView4<f64>,
        epochs: usize,
        seed: u64,
    ) -> Vec<EpochReport> {
        let mut trainer = CdTrainer::new(layer, seed);
        (0..epochs)
            .map(|_| trainer.train_epoch(layer, images))
            .collect()
    }

    /// One pass over `images` in mini-batches of the configured size.
    pub fn train_epoch(&mut self, layer: &mut ConvRbm, images: ArrayView4<f64>) -> EpochReport {
        let batch_size = layer.config().hyper.batch_size;
        for batch in images.axis_chunks_iter(Axis(0), batch_size) {
            self.train_batch(layer, batch);
        }
        self.end_epoch()
    }

    /// Closes the current epoch and returns its averaged statistics.
    pub fn end_epoch(&mut self) -> EpochReport {
        let examples = self.examples.max(1) as f64;
        let report = EpochReport {
            epoch: self.epoch,
            reconstruction_error: self.error_sum / examples,
            sparsity: self.sparsity_sum / examples,
        };
        info!(
            "epoch {} - reconstruction error: {:.5} - sparsity: {:.5}",
            report.epoch, report.reconstruction_error, report.sparsity
        );
        self.epoch += 1;
        self.examples = 0;
        self.error_sum = 0.0;
        self.sparsity_sum = 0.0;
        report
    }

    /// One CD update on a mini-batch.
    pub fn train_batch(&mut self, layer: &mut ConvRbm, batch: ArrayView4<f64>) -> BatchStatistics {
        let n = batch.len_of(Axis(0));
        if n == 0 {
            return BatchStatistics::default();
        }
        let config = *layer.config();
        let hyper = config.hyper;
        debug_assert_eq!(batch.index_axis(Axis(0), 0).dim(), layer.input_shape());

        let filters = layer.filter_matrix();
        let base_seed: u64 = self.rng.gen();
        let persistent = hyper.cd.is_persistent();

        let statistics: Vec<ExampleStatistics> = {
            let layer = &*layer;
            let chain = if persistent { layer.chain.as_ref() } else { None };
            (0..n)
                .into_par_iter()
                .map(|i| {
                    let mut rng = example_rng(base_seed, i);
                    let state = chain
                        .filter(|c| i < c.len_of(Axis(0)))
                        .map(|c| c.index_axis(Axis(0), i));
                    example_statistics(
                        layer,
                        &filters,
                        batch.index_axis(Axis(0), i),
                        state,
                        persistent,
                        &mut rng,
                    )
                })
                .collect()
        };

        let mut weights = Array2::<f64>::zeros(filters.dim());
        let mut hidden = Array1::<f64>::zeros(config.filters);
        let mut visible = Array1::<f64>::zeros(config.channels);
        let mut activation = Array1::<f64>::zeros(config.filters);
        let mut error = 0.0;
        let mut chain = Vec::with_capacity(if persistent { n } else { 0 });
        for example in statistics {
            weights += &example.weights;
            hidden += &example.hidden;
            visible += &example.visible;
            activation += &example.activation;
            error += example.error;
            chain.extend(example.chain);
        }
        let scale = 1.0 / n as f64;
        weights *= scale;
        hidden *= scale;
        visible *= scale;
        activation *= scale;
        error *= scale;

        let decay = hyper.sparsity.map_or(Sparsity::DEFAULT_DECAY, |s| s.decay());
        let running = match layer.mean_activation.take() {
            Some(previous) => previous * decay + &activation * (1.0 - decay),
            None => activation.clone(),
        };

        if let Some(sparsity) = hyper.sparsity {
            let q = match sparsity {
                Sparsity::Lee { .. } => &activation,
                Sparsity::GlobalTarget { .. } => &running,
            };
            hidden.zip_mut_with(q, |g, &q| {
                *g += sparsity.penalty() * (sparsity.target() - q)
            });
        }
        layer.mean_activation = Some(running);

        if let Some(decay) = hyper.weight_decay {
            let penalty = |w: f64| match decay.kind {
                DecayKind::L1 | DecayKind::L1Full => decay.cost * w.signum(),
                DecayKind::L2 | DecayKind::L2Full => decay.cost * w,
            };
            weights -= &filters.mapv(penalty);
            if decay.includes_biases() {
                hidden -= &layer.hidden_bias.mapv(penalty);
            }
        }

        let momentum = hyper.momentum.map_or(0.0, |m| m.at_epoch(self.epoch));
        let lr = hyper.learning_rate;
        self.weight_increment.mapv_inplace(|x| x * momentum);
        self.weight_increment.scaled_add(lr, &weights);
        self.hidden_increment.mapv_inplace(|x| x * momentum);
        self.hidden_increment.scaled_add(lr, &hidden);
        self.visible_increment.mapv_inplace(|x| x * momentum);
        self.visible_increment.scaled_add(lr, &visible);

        layer.filters += &matrix_to_filters(
            &self.weight_increment,
            config.channels,
            config.kernel_size,
        );
        layer.hidden_bias += &self.hidden_increment;
        layer.visible_bias += &self.visible_increment;

        if persistent {
            let state = stack_maps(&chain, layer.hidden_shape());
            let reuse = layer
                .chain
                .as_ref()
                .map_or(false, |c| c.len_of(Axis(0)) >= n);
            if reuse {
                if let Some(old) = layer.chain.as_mut() {
                    old.slice_mut(s![..n, .., .., ..]).assign(&state);
                }
            } else {
                layer.chain = Some(state);
            }
        }

        let sparsity = activation.mean().unwrap_or(0.0);
        self.examples += n;
        self.error_sum += error * n as f64;
        self.sparsity_sum += sparsity * n as f64;
        debug!(
            "batch of {} - reconstruction error: {:.5} - sparsity: {:.5}",
            n, error, sparsity
        );
        BatchStatistics {
            reconstruction_error: error,
            sparsity,
        }
    }
}

fn spatial_means(maps: &FeatureMap) -> Array1<f64> {
    maps.outer_iter()
        .map(|map| map.mean().unwrap_or(0.0))
        .collect()
}

/// Runs the positive and the negative phase on one example.
fn example_statistics(
    layer: &ConvRbm,
    filters: &Array2<WeightPrecision>,
    visible: ArrayView3<f64>,
    chain: Option<ArrayView3<f64>>,
    persistent: bool,
    rng: &mut ChaCha8Rng,
) -> ExampleStatistics {
    let kernel = layer.config().kernel_size;
    let steps = layer.config().hyper.cd.steps();

    let cols = im2col(visible, kernel);
    let positive = layer.hidden_from_cols(&cols, filters);

    let mut state = match chain {
        Some(state) => state.to_owned(),
        None => layer.sample_hidden_map(positive.view(), rng),
    };
    let mut reconstruction = layer.visible_from_hidden(state.view(), filters);
    let mut negative_cols = im2col(&reconstruction, kernel);
    let mut negative = layer.hidden_from_cols(&negative_cols, filters);
    for _ in 1..steps {
        state = layer.sample_hidden_map(negative.view(), rng);
        reconstruction = layer.visible_from_hidden(state.view(), filters);
        negative_cols = im2col(&reconstruction, kernel);
        negative = layer.hidden_from_cols(&negative_cols, filters);
    }

    let visible = visible.to_owned();
    let error = (&visible - &reconstruction)
        .mapv(|d| d * d)
        .mean()
        .unwrap_or(0.0);
    let activation = spatial_means(&positive);
    ExampleStatistics {
        weights: weight_statistics(&cols, &positive) - weight_statistics(&negative_cols, &negative),
        hidden: &activation - &spatial_means(&negative),
        visible: spatial_means(&visible) - spatial_means(&reconstruction),
        activation,
        error,
        chain: if persistent {
            Some(layer.sample_hidden_map(negative.view(), rng))
        } else {
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CdKind, DecayKind, LayerConfig, Momentum, WeightDecay};

    fn stripes(n: usize, size: usize) -> Array4<f64> {
        Array::from_shape_fn((n, 1, size, size), |(e, _, i, j)| {
            if (i + j + e) % 4 < 2 {
                1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_sparsity_converges_to_target() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let config = LayerConfig::new(8, 1, 6, 4)
            .with_batch_size(10)
            .with_learning_rate(0.1)
            .with_pbias(0.05, 20.0);
        let mut layer = ConvRbm::new(config, &mut rng).unwrap();
        let images = Array4::zeros((100, 1, 8, 8));

        let reports = CdTrainer::train(&mut layer, images.view(), 50, 12);
        assert_eq!(reports.len(), 50);
        assert_eq!(reports[49].epoch, 49);

        let activation = layer
            .hidden_probabilities(Array3::zeros((1, 8, 8)).view())
            .mean()
            .unwrap();
        assert!((activation - 0.05).abs() < 0.02, "activation {}", activation);
        assert!((reports[49].sparsity - 0.05).abs() < 0.02);
    }

    #[test]
    fn test_global_target_sparsity_lowers_biases() {
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        let config = LayerConfig::new(8, 1, 6, 2)
            .with_batch_size(10)
            .with_learning_rate(0.05)
            .with_sparsity(Sparsity::GlobalTarget {
                target: 0.05,
                penalty: 10.0,
                decay: 0.9,
            });
        let mut layer = ConvRbm::new(config, &mut rng).unwrap();
        let before = layer.hidden_bias().clone();
        CdTrainer::train(&mut layer, Array4::zeros((20, 1, 8, 8)).view(), 2, 1);
        assert!(layer
            .hidden_bias()
            .iter()
            .zip(before.iter())
            .all(|(after, before)| after < before));
        assert!(layer.mean_activation().is_some());
    }

    #[test]
    fn test_training_is_deterministic() {
        let train = || {
            let mut rng = ChaCha8Rng::seed_from_u64(5);
            let config = LayerConfig::new(8, 1, 5, 3)
                .with_batch_size(4)
                .with_learning_rate(0.01)
                .with_momentum(Momentum::default());
            let mut layer = ConvRbm::new(config, &mut rng).unwrap();
            let reports = CdTrainer::train(&mut layer, stripes(12, 8).view(), 2, 99);
            (layer.filters().clone(), reports)
        };
        let (first_filters, first_reports) = train();
        let (second_filters, second_reports) = train();
        assert_eq!(first_filters, second_filters);
        assert_eq!(first_reports, second_reports);
    }

    #[test]
    fn test_single_batch_update() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let config = LayerConfig::new(6, 1, 4, 2).with_batch_size(4);
        let mut layer = ConvRbm::new(config, &mut rng).unwrap();
        let before = layer.filters().clone();

        let mut trainer = CdTrainer::new(&layer, 0);
        let statistics = trainer.train_batch(&mut layer, stripes(4, 6).view());
        assert_ne!(layer.filters(), &before);
        assert!(statistics.reconstruction_error > 0.0);
        assert!(statistics.sparsity > 0.0 && statistics.sparsity < 1.0);
        assert_eq!(trainer.epoch(), 0);
        assert_eq!(trainer.end_epoch().epoch, 0);
        assert_eq!(trainer.epoch(), 1);

        let empty = trainer.train_batch(&mut layer, Array4::zeros((0, 1, 6, 6)).view());
        assert_eq!(empty, BatchStatistics::default());
    }

    #[test]
    fn test_weight_decay_shrinks_filters() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let config = LayerConfig::new(6, 1, 4, 2)
            .with_batch_size(2)
            .with_learning_rate(1.0)
            .with_weight_decay(WeightDecay::l2(0.5));
        let mut layer = ConvRbm::new(config, &mut rng).unwrap();
        layer.filters.fill(1.0);
        // zero input and saturated hidden units: only the decay term moves the weights
        layer.hidden_bias.fill(-50.0);
        layer.visible_bias.fill(-50.0);

        let mut trainer = CdTrainer::new(&layer, 0);
        trainer.train_batch(&mut layer, Array4::zeros((2, 1, 6, 6)).view());
        assert!(layer.filters().iter().all(|&w| (w - 0.5).abs() < 1e-6));
    }

    /// Layer whose statistics vanish on all-zero input, so only decay and momentum move it.
    fn quiet_layer(config: LayerConfig) -> ConvRbm {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut layer = ConvRbm::new(config.with_batch_size(2), &mut rng).unwrap();
        layer.filters.fill(1.0);
        layer.hidden_bias.fill(-50.0);
        layer.visible_bias.fill(-50.0);
        layer
    }

    #[test]
    fn test_l1_decay_uses_sign() {
        let config = LayerConfig::new(6, 1, 4, 2)
            .with_learning_rate(1.0)
            .with_weight_decay(WeightDecay::l1(0.25));
        let mut layer = quiet_layer(config);
        layer.filters.slice_mut(s![1, .., .., ..]).fill(-1.0);

        let mut trainer = CdTrainer::new(&layer, 0);
        trainer.train_batch(&mut layer, Array4::zeros((2, 1, 6, 6)).view());
        let filters = layer.filters();
        assert!(filters
            .slice(s![0, .., .., ..])
            .iter()
            .all(|&w| (w - 0.75).abs() < 1e-6));
        assert!(filters
            .slice(s![1, .., .., ..])
            .iter()
            .all(|&w| (w + 0.75).abs() < 1e-6));
        // plain L1 leaves the biases alone
        assert!(layer.hidden_bias().iter().all(|&b| (b + 50.0).abs() < 1e-6));
    }

    #[test]
    fn test_full_decay_includes_hidden_bias() {
        let config = LayerConfig::new(6, 1, 4, 2)
            .with_learning_rate(1.0)
            .with_weight_decay(WeightDecay {
                kind: DecayKind::L2Full,
                cost: 0.5,
            });
        let mut layer = quiet_layer(config);

        let mut trainer = CdTrainer::new(&layer, 0);
        trainer.train_batch(&mut layer, Array4::zeros((2, 1, 6, 6)).view());
        assert!(layer.filters().iter().all(|&w| (w - 0.5).abs() < 1e-6));
        assert!(layer.hidden_bias().iter().all(|&b| (b + 25.0).abs() < 1e-6));
        assert!(layer.visible_bias().iter().all(|&b| (b + 50.0).abs() < 1e-6));
    }

    #[test]
    fn test_momentum_reapplies_previous_increment() {
        let (lr, cost, momentum) = (0.1, 0.5, 0.5);
        let config = LayerConfig::new(6, 1, 4, 2)
            .with_learning_rate(lr)
            .with_weight_decay(WeightDecay::l2(cost))
            .with_momentum(Momentum::constant(momentum));
        let mut layer = quiet_layer(config);
        let input = Array4::zeros((2, 1, 6, 6));

        let mut trainer = CdTrainer::new(&layer, 0);
        let w0 = layer.filters()[[0, 0, 0, 0]];
        trainer.train_batch(&mut layer, input.view());
        let w1 = layer.filters()[[0, 0, 0, 0]];
        trainer.train_batch(&mut layer, input.view());
        let w2 = layer.filters()[[0, 0, 0, 0]];

        let first = w1 - w0;
        assert!((first + lr * cost * w0).abs() < 1e-9);
        // the gradient of the second step is the decay of w1
        let expected = momentum * first + lr * (-cost * w1);
        assert!((w2 - w1 - expected).abs() < 1e-9, "{} vs {}", w2 - w1, expected);
    }

    #[test]
    fn test_persistent_chain() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let config = LayerConfig::new(6, 1, 4, 2)
            .with_batch_size(3)
            .with_cd(CdKind::Persistent { steps: 2 });
        let mut layer = ConvRbm::new(config, &mut rng).unwrap();

        let mut trainer = CdTrainer::new(&layer, 1);
        trainer.train_batch(&mut layer, stripes(3, 6).view());
        assert_eq!(layer.chain.as_ref().map(|c| c.dim()), Some((3, 2, 4, 4)));

        // shorter batches only replace the head of the chain
        trainer.train_batch(&mut layer, stripes(2, 6).view());
        assert_eq!(layer.chain.as_ref().map(|c| c.dim()), Some((3, 2, 4, 4)));

        layer.reset_chain();
        assert!(layer.chain.is_none());
    }
}
