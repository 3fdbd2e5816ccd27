//! Convolutional deep belief network: a stack of [`ConvRbm`] layers trained greedily, one layer
//! at a time, each on the deterministic outputs of the already trained layers below it.
use std::fmt::{self, Display};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use ndarray::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    config::{OutputMode, StackConfig},
    crbm::ConvRbm,
    errors::{ConfigResult, ModelError, ModelResult},
    model_io::{read_records, restore_layers, write_layers},
    tensor::FeatureMap,
    trainer::{CdTrainer, EpochReport},
};

/// Training summary of one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerReport {
    pub layer: usize,
    pub epochs: Vec<EpochReport>,
}

pub struct ConvDbn {
    layers: Vec<ConvRbm>,
    output: OutputMode,
    seed: u64,
    rng: ChaCha8Rng,
    interrupted: Arc<AtomicBool>,
}

impl ConvDbn {
    /// Builds all layers of the stack. Without a configured seed, a random one is drawn.
    pub fn new(config: StackConfig) -> ConfigResult<ConvDbn> {
        config.validate()?;
        let seed = config.seed.unwrap_or_else(rand::random);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let layers = config
            .layers
            .iter()
            .map(|layer| ConvRbm::new(*layer, &mut rng))
            .collect::<ConfigResult<Vec<_>>>()?;
        Ok(ConvDbn {
            layers,
            output: config.output,
            seed,
            rng,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn layers(&self) -> &[ConvRbm] {
        &self.layers
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output
    }

    /// Seed the stack was built with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Flag that stops [`ConvDbn::pretrain`] at the next epoch boundary once set.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Shape of one input image, (channels, size, size).
    pub fn input_shape(&self) -> (usize, usize, usize) {
        self.layers[0].input_shape()
    }

    /// Number of values of one input image.
    pub fn input_size(&self) -> usize {
        self.layers[0].input_size()
    }

    /// Length of the feature vector of one image.
    pub fn output_size(&self) -> usize {
        match self.output {
            OutputMode::Last => self.layers[self.layers.len() - 1].output_size(),
            OutputMode::Concatenate => self.layers.iter().map(ConvRbm::output_size).sum(),
        }
    }

    /// Greedy layer-wise pretraining on a batch of images.
    ///
    /// The inputs of layer `i` are computed batch by batch from the frozen layers `0..i`, so
    /// only one mini-batch of intermediate activations exists at a time.
    pub fn pretrain(&mut self, images: ArrayView4<f64>, epochs: usize) -> Vec<LayerReport> {
        let (c, h, w) = self.input_shape();
        debug_assert_eq!(&images.shape()[1..], &[c, h, w][..]);
        let mut reports = Vec::with_capacity(self.layers.len());

        for i in 0..self.layers.len() {
            let (lower, rest) = self.layers.split_at_mut(i);
            let layer = &mut rest[0];
            info!("Train layer {}: {}", i, layer);

            let mut trainer = CdTrainer::new(layer, self.rng.gen());
            let batch_size = layer.config().hyper.batch_size;
            let mut epoch_reports = Vec::with_capacity(epochs);
            for _ in 0..epochs {
                if self.interrupted.load(Ordering::SeqCst) {
                    warn!("Pretraining interrupted in layer {}", i);
                    reports.push(LayerReport {
                        layer: i,
                        epochs: epoch_reports,
                    });
                    return reports;
                }
                for batch in images.axis_chunks_iter(Axis(0), batch_size) {
                    let input = propagate(lower, batch);
                    trainer.train_batch(layer, input.view());
                }
                epoch_reports.push(trainer.end_epoch());
            }
            reports.push(LayerReport {
                layer: i,
                epochs: epoch_reports,
            });
        }
        reports
    }

    /// Outputs of every layer for one image, in layer order.
    pub fn activation_maps(&self, image: ArrayView3<f64>) -> Vec<FeatureMap> {
        let mut maps: Vec<FeatureMap> = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let output = match maps.last() {
                Some(previous) => layer.output_map(previous.view()),
                None => layer.output_map(image),
            };
            maps.push(output);
        }
        maps
    }

    /// Feature vector of one image.
    pub fn features(&self, image: ArrayView3<f64>) -> Array1<f64> {
        let maps = self.activation_maps(image);
        match self.output {
            OutputMode::Last => maps
                .last()
                .map(|map| map.iter().copied().collect())
                .unwrap_or_else(|| Array1::zeros(0)),
            OutputMode::Concatenate => maps.iter().flat_map(|map| map.iter().copied()).collect(),
        }
    }

    /// Feature vectors of a batch of images, one row per image.
    pub fn features_batch(&self, images: ArrayView4<f64>) -> Array2<f64> {
        let rows: Vec<Array1<f64>> = (0..images.len_of(Axis(0)))
            .into_par_iter()
            .map(|i| self.features(images.index_axis(Axis(0), i)))
            .collect();
        let mut features = Array2::zeros((rows.len(), self.output_size()));
        for (mut target, row) in features.outer_iter_mut().zip(rows.iter()) {
            target.assign(row);
        }
        features
    }

    /// Writes all layers to a model file.
    pub fn store<W: Write>(&self, writer: W) -> ModelResult<()> {
        write_layers(writer, &self.layers, self.output)
    }

    /// Restores all layers from a model file written by [`ConvDbn::store`]. The stack is left
    /// untouched if the file doesn't match its configuration, output mode included.
    pub fn load<R: Read>(&mut self, reader: R) -> ModelResult<()> {
        let (header, records) = read_records(reader)?;
        if header.output != self.output {
            return Err(ModelError::OutputModeError {
                expected: self.output,
                found: header.output,
            });
        }
        restore_layers(&mut self.layers, records)
    }
}

/// Runs a batch through frozen layers.
fn propagate<'a>(layers: &[ConvRbm], batch: ArrayView4<'a, f64>) -> CowArray<'a, f64, Ix4> {
    layers.iter().fold(CowArray::from(batch), |input, layer| {
        CowArray::from(layer.activate_output(input.view()))
    })
}

impl Display for ConvDbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DBN with {} layers", self.layers.len())?;
        for layer in &self.layers {
            writeln!(f, "    {}", layer)?;
        }
        write!(
            f,
            "{} inputs -> {} features ({:?})",
            self.input_size(),
            self.output_size(),
            self.output
        )
    }
}
